//! Application users and user-to-user relations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::acl::UserInfo;
use crate::error::{Error, Result};

/// A row of the `_user` table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: String,
    /// Unique username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Unique email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Assigned roles
    #[serde(default)]
    pub roles: Vec<String>,
}

impl User {
    /// User with only an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Builder: set the username
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Builder: set the email
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Caller identity used for access checks
    pub fn to_user_info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            roles: self.roles.clone(),
        }
    }
}

/// Relation table between users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// Mutual friendship (`_friend`)
    #[serde(rename = "_friend")]
    Friend,
    /// One-way follow (`_follow`)
    #[serde(rename = "_follow")]
    Follow,
}

impl RelationKind {
    /// Backing table name
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Friend => "_friend",
            Self::Follow => "_follow",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for RelationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "_friend" | "friend" => Ok(Self::Friend),
            "_follow" | "follow" => Ok(Self::Follow),
            _ => Err(Error::not_supported(format!("relation {} is not supported", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_parse() {
        assert_eq!("_friend".parse::<RelationKind>().unwrap(), RelationKind::Friend);
        assert_eq!("follow".parse::<RelationKind>().unwrap(), RelationKind::Follow);
        assert!("_enemy".parse::<RelationKind>().is_err());
    }

    #[test]
    fn test_user_info_from_user() {
        let mut user = User::new("u1").with_username("alice");
        user.roles.push("admin".into());
        let info = user.to_user_info();
        assert_eq!(info.id, "u1");
        assert!(info.has_role("admin"));
    }
}
