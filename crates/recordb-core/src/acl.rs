//! Record-level access control
//!
//! A [`RecordAcl`] is an ordered list of entries, each granting a level of
//! access to the public, a role, or a specific user. An empty list is open
//! to everyone.
//!
//! Read access is granted by *any* matching entry regardless of its level;
//! only write access checks the level. Existing data relies on this, so it
//! must not be tightened.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    /// User id
    pub id: String,
    /// Roles assigned to the user
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserInfo {
    /// User with no roles
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Builder: add roles
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Whether the user has the role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Operation a caller wants to perform on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclLevel {
    /// Read access
    #[default]
    Read,
    /// Write access
    Write,
    /// Create access (record creation rules)
    Create,
}

impl fmt::Display for AclLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Create => write!(f, "create"),
        }
    }
}

/// A single grant
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordAclEntry {
    /// Relation name (`$direct` for user grants)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relation: String,
    /// Role name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    /// Granted level
    pub level: AclLevel,
    /// User id for direct grants
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    /// Public grant
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
}

impl RecordAclEntry {
    /// Grant on a relation
    pub fn relation(relation: impl Into<String>, level: AclLevel) -> Self {
        Self {
            relation: relation.into(),
            level,
            ..Default::default()
        }
    }

    /// Grant for one user
    pub fn direct(user_id: impl Into<String>, level: AclLevel) -> Self {
        Self {
            relation: "$direct".to_string(),
            user_id: user_id.into(),
            level,
            ..Default::default()
        }
    }

    /// Grant for a role
    pub fn role(role: impl Into<String>, level: AclLevel) -> Self {
        Self {
            role: role.into(),
            level,
            ..Default::default()
        }
    }

    /// Grant for everyone
    pub fn public(level: AclLevel) -> Self {
        Self {
            public: true,
            level,
            ..Default::default()
        }
    }

    /// Whether this entry lets the user perform `level`
    pub fn accessible(&self, user: Option<&UserInfo>, level: AclLevel) -> bool {
        if self.public {
            return self.accessible_level(level);
        }
        let Some(user) = user else {
            return false;
        };
        if !self.user_id.is_empty() && user.id == self.user_id && self.accessible_level(level) {
            return true;
        }
        !self.role.is_empty() && user.has_role(&self.role) && self.accessible_level(level)
    }

    /// Whether the granted level covers `level`.
    ///
    /// Read is always covered.
    pub fn accessible_level(&self, level: AclLevel) -> bool {
        match level {
            AclLevel::Read => true,
            AclLevel::Write => self.level == AclLevel::Write,
            AclLevel::Create => false,
        }
    }
}

/// Ordered list of grants
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordAcl(pub Vec<RecordAclEntry>);

impl RecordAcl {
    /// ACL from entries
    pub fn new(entries: Vec<RecordAclEntry>) -> Self {
        Self(entries)
    }

    /// Entries
    pub fn entries(&self) -> &[RecordAclEntry] {
        &self.0
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the user may perform `level`; empty ACLs are open
    pub fn accessible(&self, user: Option<&UserInfo>, level: AclLevel) -> bool {
        self.0.is_empty() || self.0.iter().any(|ace| ace.accessible(user, level))
    }
}

impl FromIterator<RecordAclEntry> for RecordAcl {
    fn from_iter<T: IntoIterator<Item = RecordAclEntry>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserInfo {
        UserInfo::new("alice").with_roles(["editor"])
    }

    #[test]
    fn test_empty_acl_is_open() {
        let acl = RecordAcl::default();
        assert!(acl.accessible(None, AclLevel::Read));
        assert!(acl.accessible(None, AclLevel::Write));
        assert!(acl.accessible(Some(&alice()), AclLevel::Write));
    }

    #[test]
    fn test_anonymous_read_needs_public_entry() {
        let acl = RecordAcl::new(vec![RecordAclEntry::role("editor", AclLevel::Write)]);
        assert!(!acl.accessible(None, AclLevel::Read));

        let acl = RecordAcl::new(vec![RecordAclEntry::public(AclLevel::Read)]);
        assert!(acl.accessible(None, AclLevel::Read));
        assert!(!acl.accessible(None, AclLevel::Write));
    }

    // Read is granted by any matching entry, whatever its level.
    #[test]
    fn test_read_granted_by_any_matching_entry() {
        let acl = RecordAcl::new(vec![RecordAclEntry::direct("alice", AclLevel::Read)]);
        assert!(acl.accessible(Some(&alice()), AclLevel::Read));
        assert!(!acl.accessible(Some(&alice()), AclLevel::Write));

        let acl = RecordAcl::new(vec![RecordAclEntry::role("editor", AclLevel::Write)]);
        assert!(acl.accessible(Some(&alice()), AclLevel::Read));
        assert!(acl.accessible(Some(&alice()), AclLevel::Write));
    }

    #[test]
    fn test_non_matching_user() {
        let acl = RecordAcl::new(vec![RecordAclEntry::direct("bob", AclLevel::Write)]);
        assert!(!acl.accessible(Some(&alice()), AclLevel::Read));
        assert!(!acl.accessible(Some(&alice()), AclLevel::Write));
    }

    #[test]
    fn test_entry_json_shape() {
        let json = serde_json::to_value(RecordAclEntry::public(AclLevel::Write)).unwrap();
        assert_eq!(json, serde_json::json!({"level": "write", "public": true}));

        let json = serde_json::to_value(RecordAclEntry::direct("u1", AclLevel::Read)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"relation": "$direct", "level": "read", "user_id": "u1"})
        );
    }
}
