//! Field-level access control
//!
//! Rules are [`FieldAclEntry`]s keyed by record type and field, either of
//! which may be the wildcard `*`. Entries for the wildcard record type are
//! consulted first; the per-type list is only searched when no wildcard
//! entry matches. Within a list the first matching entry wins, in the
//! order defined by [`FieldAclEntry`]'s `Ord`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::acl::UserInfo;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::value::Value;

/// Wildcard record type or field
pub const WILDCARD: &str = "*";

/// Operation on a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldAccessMode {
    /// Field is returned
    Read,
    /// Field can be written
    Write,
    /// Field can be used in queries to find records
    Discover,
    /// Field can be compared in predicates
    Compare,
}

/// Who an entry applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldUserRole {
    /// The record owner
    Owner,
    /// One specific user
    SpecificUser(String),
    /// The user whose id is stored in the named field
    DynamicUser(String),
    /// Users with the named role
    DefinedRole(String),
    /// Any authenticated user
    AnyUser,
    /// Everyone
    Public,
}

impl FieldUserRole {
    const fn rank(&self) -> u8 {
        match self {
            Self::Owner => 0,
            Self::SpecificUser(_) => 1,
            Self::DynamicUser(_) => 2,
            Self::DefinedRole(_) => 3,
            Self::AnyUser => 4,
            Self::Public => 5,
        }
    }

    fn payload(&self) -> &str {
        match self {
            Self::SpecificUser(s) | Self::DynamicUser(s) | Self::DefinedRole(s) => s,
            _ => "",
        }
    }

    /// Whether the role covers `user` for `record`.
    ///
    /// Owner and dynamic-user roles need a record; without one they never
    /// match.
    pub fn matches(&self, user: Option<&UserInfo>, record: Option<&Record>) -> bool {
        match self {
            Self::Public => true,
            Self::AnyUser => user.is_some(),
            Self::Owner => match (user, record) {
                (Some(u), Some(r)) => r.owner_id == u.id,
                _ => false,
            },
            Self::SpecificUser(id) => user.map(|u| &u.id == id).unwrap_or(false),
            Self::DefinedRole(role) => user.map(|u| u.has_role(role)).unwrap_or(false),
            Self::DynamicUser(field) => match (user, record) {
                (Some(u), Some(r)) => match r.data.get(field) {
                    Some(Value::String(s)) => s == &u.id,
                    Some(Value::Reference(reference)) => reference.id.key == u.id,
                    _ => false,
                },
                _ => false,
            },
        }
    }
}

impl Ord for FieldUserRole {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.payload().cmp(other.payload()))
    }
}

impl PartialOrd for FieldUserRole {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FieldUserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => write!(f, "_owner"),
            Self::SpecificUser(id) => write!(f, "_user_id:{}", id),
            Self::DynamicUser(field) => write!(f, "_field:{}", field),
            Self::DefinedRole(role) => write!(f, "_role:{}", role),
            Self::AnyUser => write!(f, "_any_user"),
            Self::Public => write!(f, "_public"),
        }
    }
}

impl FromStr for FieldUserRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let role = match s {
            "_owner" => Self::Owner,
            "_any_user" => Self::AnyUser,
            "_public" => Self::Public,
            _ => match s.split_once(':') {
                Some(("_user_id", id)) if !id.is_empty() => Self::SpecificUser(id.to_string()),
                Some(("_field", field)) if !field.is_empty() => {
                    Self::DynamicUser(field.to_string())
                }
                Some(("_role", role)) if !role.is_empty() => Self::DefinedRole(role.to_string()),
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "unexpected field user role: {}",
                        s
                    )))
                }
            },
        };
        Ok(role)
    }
}

impl Serialize for FieldUserRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldUserRole {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One field access rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAclEntry {
    /// Record type or `*`
    pub record_type: String,
    /// Field name or `*`
    pub record_field: String,
    /// Who the rule applies to
    pub user_role: FieldUserRole,
    /// Field is returned
    pub readable: bool,
    /// Field can be written
    pub writable: bool,
    /// Field can be compared in predicates
    pub comparable: bool,
    /// Field can be used to discover records
    pub discoverable: bool,
}

impl FieldAclEntry {
    /// Entry granting everything to `user_role`
    pub fn allow_all(
        record_type: impl Into<String>,
        record_field: impl Into<String>,
        user_role: FieldUserRole,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_field: record_field.into(),
            user_role,
            readable: true,
            writable: true,
            comparable: true,
            discoverable: true,
        }
    }

    /// The `* / * / public` entry with the given flags
    pub fn public_default(readable: bool, writable: bool, comparable: bool, discoverable: bool) -> Self {
        Self {
            record_type: WILDCARD.to_string(),
            record_field: WILDCARD.to_string(),
            user_role: FieldUserRole::Public,
            readable,
            writable,
            comparable,
            discoverable,
        }
    }

    /// Whether the entry allows `mode`
    pub fn accessible(&self, mode: FieldAccessMode) -> bool {
        match mode {
            FieldAccessMode::Read => self.readable,
            FieldAccessMode::Write => self.writable,
            FieldAccessMode::Compare => self.comparable,
            FieldAccessMode::Discover => self.discoverable,
        }
    }

    /// Whether the entry covers `field`
    pub fn matches_field(&self, field: &str) -> bool {
        self.record_field == WILDCARD || self.record_field == field
    }

    fn is_public_wildcard(&self) -> bool {
        self.record_type == WILDCARD
            && self.record_field == WILDCARD
            && self.user_role == FieldUserRole::Public
    }
}

fn wildcard_first(a: &str, b: &str) -> Ordering {
    match (a == WILDCARD, b == WILDCARD) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

impl Ord for FieldAclEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        wildcard_first(&self.record_type, &other.record_type)
            .then_with(|| wildcard_first(&self.record_field, &other.record_field))
            .then_with(|| self.user_role.cmp(&other.user_role))
    }
}

impl PartialOrd for FieldAclEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Field access rules for all record types
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldAcl {
    wildcard: Vec<FieldAclEntry>,
    by_type: BTreeMap<String, Vec<FieldAclEntry>>,
    default_entry: Option<FieldAclEntry>,
}

impl FieldAcl {
    /// Build from entries; each list is sorted
    pub fn new(entries: impl IntoIterator<Item = FieldAclEntry>) -> Self {
        let mut acl = Self::default();
        for entry in entries {
            if entry.record_type == WILDCARD {
                acl.wildcard.push(entry);
            } else {
                acl.by_type
                    .entry(entry.record_type.clone())
                    .or_default()
                    .push(entry);
            }
        }
        acl.wildcard.sort();
        for list in acl.by_type.values_mut() {
            list.sort();
        }
        acl
    }

    /// Build from entries, synthesizing `default` as the last resort
    /// unless an explicit `* / * / public` entry exists.
    pub fn with_default(
        entries: impl IntoIterator<Item = FieldAclEntry>,
        default: FieldAclEntry,
    ) -> Self {
        let mut acl = Self::new(entries);
        if !acl.wildcard.iter().any(FieldAclEntry::is_public_wildcard) {
            acl.default_entry = Some(default);
        }
        acl
    }

    /// All explicit entries, wildcard list first
    pub fn entries(&self) -> impl Iterator<Item = &FieldAclEntry> {
        self.wildcard
            .iter()
            .chain(self.by_type.values().flatten())
    }

    /// The synthesized default entry, if any
    pub fn default_entry(&self) -> Option<&FieldAclEntry> {
        self.default_entry.as_ref()
    }

    /// Entries in lookup order for one record type and field
    pub fn lookup<'a>(
        &'a self,
        record_type: &'a str,
        field: &'a str,
    ) -> impl Iterator<Item = &'a FieldAclEntry> + 'a {
        self.wildcard
            .iter()
            .chain(self.by_type.get(record_type).into_iter().flatten())
            .chain(self.default_entry.iter())
            .filter(move |e| e.matches_field(field))
    }

    /// Whether `user` may perform `mode` on `record_type.field`.
    ///
    /// The first entry whose field and role match decides. With no
    /// matching entry and no default the field is accessible.
    pub fn accessible(
        &self,
        user: Option<&UserInfo>,
        record: Option<&Record>,
        record_type: &str,
        field: &str,
        mode: FieldAccessMode,
    ) -> bool {
        self.lookup(record_type, field)
            .find(|e| e.user_role.matches(user, record))
            .map(|e| e.accessible(mode))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordId;

    fn entry(rt: &str, field: &str, role: FieldUserRole, readable: bool) -> FieldAclEntry {
        FieldAclEntry {
            readable,
            ..FieldAclEntry::allow_all(rt, field, role)
        }
    }

    #[test]
    fn test_user_role_round_trip() {
        for s in ["_owner", "_user_id:u1", "_field:assignee", "_role:admin", "_any_user", "_public"] {
            let role: FieldUserRole = s.parse().unwrap();
            assert_eq!(role.to_string(), s);
        }
        assert!("_role:".parse::<FieldUserRole>().is_err());
        assert!("owner".parse::<FieldUserRole>().is_err());
    }

    #[test]
    fn test_entry_ordering() {
        let mut entries = vec![
            entry("note", "title", FieldUserRole::Public, true),
            entry("note", "*", FieldUserRole::AnyUser, true),
            entry("*", "title", FieldUserRole::Owner, true),
            entry("note", "title", FieldUserRole::Owner, true),
            entry("note", "title", FieldUserRole::DefinedRole("admin".into()), true),
            entry("*", "*", FieldUserRole::Public, true),
        ];
        entries.sort();
        let keys: Vec<String> = entries
            .iter()
            .map(|e| format!("{}.{}.{}", e.record_type, e.record_field, e.user_role))
            .collect();
        assert_eq!(
            keys,
            vec![
                "*.*._public",
                "*.title._owner",
                "note.*._any_user",
                "note.title._owner",
                "note.title._role:admin",
                "note.title._public",
            ]
        );
    }

    #[test]
    fn test_wildcard_list_checked_before_type_list() {
        let acl = FieldAcl::new(vec![
            entry("*", "secret", FieldUserRole::Public, false),
            entry("note", "secret", FieldUserRole::Public, true),
        ]);
        assert!(!acl.accessible(None, None, "note", "secret", FieldAccessMode::Read));
        assert!(acl.accessible(None, None, "note", "other", FieldAccessMode::Read));
    }

    #[test]
    fn test_type_list_used_when_no_wildcard_matches() {
        let acl = FieldAcl::new(vec![
            entry("*", "secret", FieldUserRole::DefinedRole("admin".into()), true),
            entry("note", "secret", FieldUserRole::Public, false),
        ]);
        let admin = UserInfo::new("a").with_roles(["admin"]);
        let bob = UserInfo::new("b");
        assert!(acl.accessible(Some(&admin), None, "note", "secret", FieldAccessMode::Read));
        assert!(!acl.accessible(Some(&bob), None, "note", "secret", FieldAccessMode::Read));
    }

    #[test]
    fn test_default_entry_synthesized() {
        let acl = FieldAcl::with_default(
            vec![entry("note", "title", FieldUserRole::Owner, true)],
            FieldAclEntry::public_default(false, false, false, false),
        );
        assert!(acl.default_entry().is_some());
        assert!(!acl.accessible(None, None, "note", "title", FieldAccessMode::Read));

        let record = Record::new(RecordId::new("note", "1")).with_owner("alice");
        let alice = UserInfo::new("alice");
        assert!(acl.accessible(Some(&alice), Some(&record), "note", "title", FieldAccessMode::Read));

        let explicit = FieldAcl::with_default(
            vec![FieldAclEntry::public_default(true, true, true, true)],
            FieldAclEntry::public_default(false, false, false, false),
        );
        assert!(explicit.default_entry().is_none());
        assert!(explicit.accessible(None, None, "note", "x", FieldAccessMode::Write));
    }

    #[test]
    fn test_dynamic_user_role() {
        let role = FieldUserRole::DynamicUser("assignee".into());
        let record = Record::new(RecordId::new("task", "1")).with_field("assignee", "bob");
        assert!(role.matches(Some(&UserInfo::new("bob")), Some(&record)));
        assert!(!role.matches(Some(&UserInfo::new("carol")), Some(&record)));
        assert!(!role.matches(Some(&UserInfo::new("bob")), None));
    }
}
