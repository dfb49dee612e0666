//! Records and record identity
//!
//! Keys starting with `_` are reserved for metadata. They are routed to
//! the typed fields of [`Record`] by [`Record::get`] and [`Record::set`] and
//! never stored in the data map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::acl::{AclLevel, RecordAcl, UserInfo};
use crate::error::{Error, Result};
use crate::value::{Data, Value};

const TRANSIENT_PREFIX: &str = "_transient_";

/// Identity of a record: `Type/Key`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RecordId {
    /// Record type
    pub record_type: String,
    /// Key, unique within the type
    pub key: String,
}

impl RecordId {
    /// New record id
    pub fn new(record_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            key: key.into(),
        }
    }

    /// Whether both parts are empty
    pub fn is_empty(&self) -> bool {
        self.record_type.is_empty() && self.key.is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.key)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    /// Splits on the first `/`; the key may itself contain slashes.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((record_type, key)) => Ok(Self::new(record_type, key)),
            None => Err(Error::invalid_argument(format!(
                "record id {:?} is not in the form Type/Key",
                s
            ))),
        }
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A typed, ACL-guarded row with dynamic user fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identity
    pub id: RecordId,
    /// Logical sub-database owning the row
    #[serde(default)]
    pub database_id: String,
    /// Owner user id
    #[serde(default)]
    pub owner_id: String,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Creator user id
    #[serde(default)]
    pub creator_id: String,
    /// Last update time (UTC)
    pub updated_at: DateTime<Utc>,
    /// Last updater user id
    #[serde(default)]
    pub updater_id: String,
    /// Access control; `None` is world-accessible
    #[serde(default)]
    pub acl: Option<RecordAcl>,
    /// User-defined fields
    #[serde(default)]
    pub data: Data,
    /// Computed fields, never persisted
    #[serde(default)]
    pub transient: Data,
}

impl Default for Record {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: RecordId::default(),
            database_id: String::new(),
            owner_id: String::new(),
            created_at: epoch,
            creator_id: String::new(),
            updated_at: epoch,
            updater_id: String::new(),
            acl: None,
            data: Data::new(),
            transient: Data::new(),
        }
    }
}

impl Record {
    /// Empty record with the given id
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Builder: set owner, creator and updater
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        self.creator_id = owner_id.clone();
        self.updater_id = owner_id.clone();
        self.owner_id = owner_id;
        self
    }

    /// Builder: set a data field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Builder: set the ACL
    pub fn with_acl(mut self, acl: RecordAcl) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Record type shortcut
    pub fn record_type(&self) -> &str {
        &self.id.record_type
    }

    /// Read a field, routing reserved keys to metadata.
    ///
    /// Missing data keys yield `Null`; unknown reserved keys are an error.
    pub fn get(&self, key: &str) -> Result<Value> {
        if !key.starts_with('_') {
            return Ok(self.data.get(key).cloned().unwrap_or_default());
        }
        let value = match key {
            "_type" => Value::String(self.id.record_type.clone()),
            "_id" => Value::String(self.id.key.clone()),
            "_database_id" => Value::String(self.database_id.clone()),
            "_owner_id" => Value::String(self.owner_id.clone()),
            "_access" => match &self.acl {
                Some(acl) => serde_json::to_value(acl).map(Value::Json).unwrap_or_default(),
                None => Value::Null,
            },
            "_created_at" => Value::DateTime(self.created_at),
            "_created_by" => Value::String(self.creator_id.clone()),
            "_updated_at" => Value::DateTime(self.updated_at),
            "_updated_by" => Value::String(self.updater_id.clone()),
            "_transient" => Value::Json(serde_json::Value::Object(
                self.transient
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            )),
            _ => match key.strip_prefix(TRANSIENT_PREFIX) {
                Some(name) => self.transient.get(name).cloned().unwrap_or_default(),
                None => {
                    return Err(Error::invalid_argument(format!(
                        "unknown reserved key: {}",
                        key
                    )))
                }
            },
        };
        Ok(value)
    }

    /// Write a field, routing reserved keys to metadata.
    ///
    /// Fails for unknown reserved keys and for values of the wrong kind.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        if !key.starts_with('_') {
            self.data.insert(key.to_string(), value);
            return Ok(());
        }
        match key {
            "_type" => self.id.record_type = expect_string(key, value)?,
            "_id" => self.id.key = expect_string(key, value)?,
            "_database_id" => self.database_id = expect_string(key, value)?,
            "_owner_id" => self.owner_id = expect_string(key, value)?,
            "_created_by" => self.creator_id = expect_string(key, value)?,
            "_updated_by" => self.updater_id = expect_string(key, value)?,
            "_created_at" => self.created_at = expect_datetime(key, value)?,
            "_updated_at" => self.updated_at = expect_datetime(key, value)?,
            "_access" => {
                self.acl = match value {
                    Value::Null => None,
                    Value::Json(json) => Some(serde_json::from_value(json)?),
                    other => return Err(wrong_kind(key, &other)),
                }
            }
            "_transient" => match value {
                Value::Json(serde_json::Value::Object(map)) => {
                    self.transient = map
                        .into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect();
                }
                other => return Err(wrong_kind(key, &other)),
            },
            _ => match key.strip_prefix(TRANSIENT_PREFIX) {
                Some(name) => {
                    self.transient.insert(name.to_string(), value);
                }
                None => {
                    return Err(Error::invalid_argument(format!(
                        "unknown reserved key: {}",
                        key
                    )))
                }
            },
        }
        Ok(())
    }

    /// Remove a data field; reserved keys cannot be removed
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        if key.starts_with('_') {
            return Err(Error::invalid_argument(format!(
                "cannot remove reserved key: {}",
                key
            )));
        }
        Ok(self.data.remove(key))
    }

    /// Names of user-defined fields
    pub fn user_keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Whether the caller may access this record at `level`.
    ///
    /// Rows of a private database are only visible to that database's
    /// user; owners always have access.
    pub fn accessible(&self, user: Option<&UserInfo>, level: AclLevel) -> bool {
        let Some(acl) = &self.acl else {
            return true;
        };
        let user_id = user.map(|u| u.id.as_str()).unwrap_or_default();
        if !self.database_id.is_empty() && self.database_id != user_id {
            return false;
        }
        if self.owner_id == user_id {
            return true;
        }
        acl.accessible(user, level)
    }

    /// Overwrite ACL and merge data and transient fields from `src`
    pub fn apply(&mut self, src: &Record) {
        self.acl = src.acl.clone();
        for (k, v) in &src.data {
            self.data.insert(k.clone(), v.clone());
        }
        for (k, v) in &src.transient {
            self.transient.insert(k.clone(), v.clone());
        }
    }

    /// Copy of this record with `merge` applied
    pub fn merged_copy(&self, merge: &Record) -> Record {
        let mut dst = self.clone();
        dst.apply(merge);
        dst
    }
}

fn wrong_kind(key: &str, value: &Value) -> Error {
    Error::invalid_argument(format!(
        "reserved key {} cannot hold a {} value",
        key,
        value.kind()
    ))
}

fn expect_string(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(wrong_kind(key, &other)),
    }
}

fn expect_datetime(key: &str, value: Value) -> Result<DateTime<Utc>> {
    match value {
        Value::DateTime(dt) => Ok(dt),
        other => Err(wrong_kind(key, &other)),
    }
}

/// Kind of change a record went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordHookEvent {
    /// Inserted
    Created,
    /// Updated
    Updated,
    /// Deleted
    Deleted,
}

impl fmt::Display for RecordHookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "create"),
            Self::Updated => write!(f, "update"),
            Self::Deleted => write!(f, "delete"),
        }
    }
}

/// A change to a record, as delivered by the change listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    /// Changed record (its state after the change, or before a delete)
    pub record: Record,
    /// Kind of change
    pub event: RecordHookEvent,
}
