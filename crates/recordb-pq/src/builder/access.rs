//! Record-level access clause
//!
//! Rows are visible to a caller when the `_access` JSON array contains an
//! entry for one of the caller's roles, for the caller directly, or a
//! public entry at the requested level. Owners and rows without an ACL
//! are always visible. Containment (`@>`) keeps the clause indexable.

use recordb_core::acl::{AclLevel, UserInfo};
use recordb_core::error::{Error, Result};
use serde_json::json;

use super::{full_quote, Fragment};
use crate::types::SqlValue;

/// Condition restricting rows of `table` to those `user` may access at `level`
pub fn access_clause(table: &str, user: Option<&UserInfo>, level: AclLevel) -> Result<Fragment> {
    let access = full_quote(table, "_access");
    let contains = |entry: serde_json::Value| {
        Fragment::with_args(format!("{} @> ?", access), vec![SqlValue::Json(json!([entry]))])
    };

    let mut parts = Vec::new();
    if let Some(user) = user {
        if user.id.is_empty() {
            return Err(Error::invalid_argument(
                "cannot build access clause for a user without id",
            ));
        }
        for role in &user.roles {
            parts.push(contains(json!({ "role": role })));
        }
        parts.push(contains(json!({ "user_id": user.id })));
        parts.push(Fragment::with_args(
            format!("{} = ?", full_quote(table, "_owner_id")),
            vec![SqlValue::Text(user.id.clone())],
        ));
    }

    match level {
        AclLevel::Read => parts.push(contains(json!({ "public": true }))),
        AclLevel::Write => parts.push(contains(json!({ "public": true, "level": "write" }))),
        AclLevel::Create => {}
    }
    parts.push(Fragment::raw(format!("{} IS NULL", access)));

    Ok(Fragment::join(parts, " OR ").wrap("(", ")"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_read() {
        let f = access_clause("note", None, AclLevel::Read).unwrap();
        assert_eq!(
            f.sql,
            "(\"note\".\"_access\" @> ? OR \"note\".\"_access\" IS NULL)"
        );
        assert_eq!(f.args, vec![SqlValue::Json(json!([{"public": true}]))]);
    }

    #[test]
    fn test_user_with_roles() {
        let user = UserInfo::new("alice").with_roles(["admin", "editor"]);
        let f = access_clause("note", Some(&user), AclLevel::Write).unwrap();
        let stmt = f.finish().unwrap();
        assert_eq!(
            stmt.sql,
            "(\"note\".\"_access\" @> $1::jsonb OR \"note\".\"_access\" @> $2::jsonb OR \
             \"note\".\"_access\" @> $3::jsonb OR \"note\".\"_owner_id\" = $4::text OR \
             \"note\".\"_access\" @> $5::jsonb OR \"note\".\"_access\" IS NULL)"
        );
        assert_eq!(stmt.args[0], SqlValue::Json(json!([{"role": "admin"}])));
        assert_eq!(stmt.args[2], SqlValue::Json(json!([{"user_id": "alice"}])));
        assert_eq!(
            stmt.args[4],
            SqlValue::Json(json!([{"public": true, "level": "write"}]))
        );
    }

    #[test]
    fn test_user_without_id() {
        let user = UserInfo::default();
        assert!(access_clause("note", Some(&user), AclLevel::Read).is_err());
    }
}
