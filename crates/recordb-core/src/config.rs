//! Store configuration

use serde::{Deserialize, Serialize};

use crate::field_acl::FieldAclEntry;

/// Default record type of application users
pub const DEFAULT_USER_RECORD_TYPE: &str = "user";

/// Field access granted when no explicit public wildcard entry exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultFieldAccess {
    /// Fields are returned
    pub readable: bool,
    /// Fields can be written
    pub writable: bool,
    /// Fields can be compared
    pub comparable: bool,
    /// Fields can be used to discover records
    pub discoverable: bool,
}

impl Default for DefaultFieldAccess {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            comparable: true,
            discoverable: true,
        }
    }
}

impl DefaultFieldAccess {
    /// The `* / * / public` entry carrying these flags
    pub fn to_entry(self) -> FieldAclEntry {
        FieldAclEntry::public_default(
            self.readable,
            self.writable,
            self.comparable,
            self.discoverable,
        )
    }
}

/// Options applied to every connection a driver opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Allow JIT schema migration
    pub can_migrate: bool,
    /// Record type whose rows mirror `_user`
    pub user_record_type: String,
    /// Field access used when none is configured
    pub default_field_access: DefaultFieldAccess,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            can_migrate: true,
            user_record_type: DEFAULT_USER_RECORD_TYPE.to_string(),
            default_field_access: DefaultFieldAccess::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable migration
    pub fn with_can_migrate(mut self, can_migrate: bool) -> Self {
        self.can_migrate = can_migrate;
        self
    }

    /// Set the user record type
    pub fn with_user_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.user_record_type = record_type.into();
        self
    }

    /// Set the default field access
    pub fn with_default_field_access(mut self, access: DefaultFieldAccess) -> Self {
        self.default_field_access = access;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::new()
            .with_can_migrate(false)
            .with_user_record_type("member");
        assert!(!config.can_migrate);
        assert_eq!(config.user_record_type, "member");
        assert!(config.default_field_access.readable);
    }

    #[test]
    fn test_store_config_serde_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"can_migrate": false}"#).unwrap();
        assert!(!config.can_migrate);
        assert_eq!(config.user_record_type, DEFAULT_USER_RECORD_TYPE);
    }
}
