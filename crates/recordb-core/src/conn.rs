//! Store contracts
//!
//! A [`Conn`] is one unit of work against an application's store. It is
//! composed of capability traits and hands out [`Database`] handles for
//! the three row-visibility scopes:
//! - public: rows with an empty `_database_id`
//! - private: rows owned by one user
//! - union: every row, read-only
//!
//! Connection state is never shared between concurrent operations; open a
//! connection per request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::acl::{RecordAcl, UserInfo};
use crate::device::{Device, Subscription};
use crate::error::Result;
use crate::field_acl::FieldAcl;
use crate::query::{Query, RelationDirection};
use crate::record::{Record, RecordEvent, RecordId};
use crate::schema::{Index, RecordSchema};
use crate::user::{RelationKind, User};
use crate::value::Asset;

/// `_database_id` of the public database
pub const PUBLIC_DATABASE_ID: &str = "";

/// How record access is evaluated for an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessModel {
    /// Roles granted to users
    #[default]
    RoleBased,
    /// Relations between the creator and the accessor
    RelationBased,
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoleBased => write!(f, "role"),
            Self::RelationBased => write!(f, "relation"),
        }
    }
}

/// Visibility scope of a [`Database`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// Shared rows
    Public,
    /// Rows of one user
    Private,
    /// All rows, read-only
    Union,
}

/// Access evaluation for record reads
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccessControlOptions {
    /// Caller the access clause is evaluated for
    pub view_as_user: Option<UserInfo>,
    /// Skip the access clause
    pub bypass_access_control: bool,
}

impl AccessControlOptions {
    /// Evaluate as `user`
    pub fn as_user(user: UserInfo) -> Self {
        Self {
            view_as_user: Some(user),
            bypass_access_control: false,
        }
    }

    /// Skip access control
    pub fn bypass() -> Self {
        Self {
            view_as_user: None,
            bypass_access_control: true,
        }
    }
}

impl From<&Query> for AccessControlOptions {
    fn from(q: &Query) -> Self {
        Self {
            view_as_user: q.view_as_user.clone(),
            bypass_access_control: q.bypass_access_control,
        }
    }
}

/// Paging for list queries; a zero limit is unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryConfig {
    /// Maximum rows, 0 for no limit
    pub limit: u64,
    /// Rows to skip
    pub offset: u64,
}

/// Lazy, forward-only sequence of records.
///
/// Not restartable. The first decode error ends the stream.
#[async_trait]
pub trait RecordCursor: Send {
    /// Next record, or `None` at the end of the rows
    async fn next(&mut self) -> Result<Option<Record>>;

    /// Total row count when the query asked for it; known once a row was read
    fn record_count(&self) -> Option<u64>;

    /// Drain the cursor into a vector
    async fn collect_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Cursor over no rows, used when a record type has no table yet
#[derive(Debug, Default)]
pub struct EmptyCursor;

#[async_trait]
impl RecordCursor for EmptyCursor {
    async fn next(&mut self) -> Result<Option<Record>> {
        Ok(None)
    }

    fn record_count(&self) -> Option<u64> {
        None
    }
}

/// Rows in `_user`
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user; duplicated username or email fails
    async fn create_user(&self, user: &User) -> Result<()>;

    /// Update username and email
    async fn update_user(&self, user: &User) -> Result<()>;

    /// User by id, with roles
    async fn get_user(&self, id: &str) -> Result<User>;

    /// User by username
    async fn get_user_by_username(&self, username: &str) -> Result<User>;

    /// Delete a user
    async fn delete_user(&self, id: &str) -> Result<()>;
}

/// Role definitions and assignments
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Roles flagged as admin
    async fn get_admin_roles(&self) -> Result<Vec<String>>;

    /// Replace the admin role set
    async fn set_admin_roles(&self, roles: &[String]) -> Result<()>;

    /// Roles given to new users
    async fn get_default_roles(&self) -> Result<Vec<String>>;

    /// Replace the default role set
    async fn set_default_roles(&self, roles: &[String]) -> Result<()>;

    /// Grant every role to every user, creating missing roles
    async fn assign_roles(&self, user_ids: &[String], roles: &[String]) -> Result<()>;

    /// Revoke every role from every user
    async fn revoke_roles(&self, user_ids: &[String], roles: &[String]) -> Result<()>;

    /// Roles per user id
    async fn get_roles(&self, user_ids: &[String]) -> Result<HashMap<String, Vec<String>>>;
}

/// Per-type access rules
#[async_trait]
pub trait AccessStore: Send + Sync {
    /// Who may create records of a type
    async fn set_record_access(&self, record_type: &str, acl: &RecordAcl) -> Result<()>;

    /// Creation ACL of a type
    async fn get_record_access(&self, record_type: &str) -> Result<RecordAcl>;

    /// ACL applied to new records of a type
    async fn set_record_default_access(&self, record_type: &str, acl: &RecordAcl) -> Result<()>;

    /// Default ACL of a type
    async fn get_record_default_access(&self, record_type: &str) -> Result<RecordAcl>;

    /// Replace all field access entries
    async fn set_record_field_access(&self, acl: &FieldAcl) -> Result<()>;

    /// Field access entries, with the configured default
    async fn get_record_field_access(&self) -> Result<FieldAcl>;
}

/// Asset metadata
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Asset by name
    async fn get_asset(&self, name: &str) -> Result<Asset>;

    /// Assets by name; missing names are skipped
    async fn get_assets(&self, names: &[String]) -> Result<Vec<Asset>>;

    /// Insert or update an asset
    async fn save_asset(&self, asset: &Asset) -> Result<()>;
}

/// `_friend` and `_follow`
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Users related to `user`
    async fn query_relation(
        &self,
        user: &str,
        kind: RelationKind,
        direction: RelationDirection,
        config: QueryConfig,
    ) -> Result<Vec<User>>;

    /// Number of users related to `user`
    async fn query_relation_count(
        &self,
        user: &str,
        kind: RelationKind,
        direction: RelationDirection,
    ) -> Result<u64>;

    /// Add `user -> target`
    async fn add_relation(&self, user: &str, kind: RelationKind, target: &str) -> Result<()>;

    /// Remove `user -> target`
    async fn remove_relation(&self, user: &str, kind: RelationKind, target: &str) -> Result<()>;
}

/// Registered devices
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Device by id
    async fn get_device(&self, id: &str) -> Result<Device>;

    /// Devices of a user
    async fn query_devices_by_user(&self, user_id: &str) -> Result<Vec<Device>>;

    /// Insert or update a device
    async fn save_device(&self, device: &Device) -> Result<()>;

    /// Delete a device and its subscriptions
    async fn delete_device(&self, id: &str) -> Result<()>;

    /// Delete devices with `token`, registered before `before` when given
    async fn delete_devices_by_token(&self, token: &str, before: Option<DateTime<Utc>>)
        -> Result<()>;

    /// Delete devices without a token, registered before `before` when given
    async fn delete_empty_devices_by_time(&self, before: Option<DateTime<Utc>>) -> Result<()>;
}

/// A unit of work against one application's store
#[async_trait]
pub trait Conn:
    UserStore + RoleStore + AccessStore + AssetStore + RelationStore + DeviceStore
{
    /// Application name
    fn app_name(&self) -> &str;

    /// Access model of the application
    fn access_model(&self) -> AccessModel;

    /// Begin a transaction; fails with `TxDidBegin` when one is open
    async fn begin(&self) -> Result<()>;

    /// Commit; fails with `TxDidNotBegin` without a transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back; fails with `TxDidNotBegin` without a transaction
    async fn rollback(&self) -> Result<()>;

    /// Shared rows
    fn public_db(&self) -> Arc<dyn Database>;

    /// Rows of `user_key`
    fn private_db(&self, user_key: &str) -> Arc<dyn Database>;

    /// All rows, read-only
    fn union_db(&self) -> Arc<dyn Database>;

    /// Receive change events for this application
    async fn subscribe(&self, events: mpsc::Sender<RecordEvent>) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Records, schemas and subscriptions within one visibility scope
#[async_trait]
pub trait Database: Send + Sync {
    /// `_database_id` filter value
    fn id(&self) -> &str;

    /// Scope of this database
    fn database_type(&self) -> DatabaseType;

    /// Whether writes are allowed
    fn is_read_only(&self) -> bool {
        self.database_type() == DatabaseType::Union
    }

    /// Record by id
    async fn get(&self, id: &RecordId) -> Result<Record>;

    /// Records of one type by id
    async fn get_by_ids(
        &self,
        ids: &[RecordId],
        options: &AccessControlOptions,
    ) -> Result<Box<dyn RecordCursor>>;

    /// Insert or update; the record is refreshed from the stored row
    async fn save(&self, record: &mut Record) -> Result<()>;

    /// Delete by id
    async fn delete(&self, id: &RecordId) -> Result<()>;

    /// Run a query
    async fn query(&self, query: &Query) -> Result<Box<dyn RecordCursor>>;

    /// Count the rows a query matches
    async fn query_count(&self, query: &Query) -> Result<u64>;

    /// Make the table of `record_type` hold `schema`; true when altered
    async fn extend(&self, record_type: &str, schema: &RecordSchema) -> Result<bool>;

    /// Rename a column
    async fn rename_schema(&self, record_type: &str, old_name: &str, new_name: &str) -> Result<()>;

    /// Drop a column
    async fn delete_schema(&self, record_type: &str, column: &str) -> Result<()>;

    /// Schema of a record type, meta columns excluded
    async fn get_schema(&self, record_type: &str) -> Result<RecordSchema>;

    /// Schemas of every record type
    async fn get_record_schemas(&self) -> Result<BTreeMap<String, RecordSchema>>;

    /// Unique indexes of a record type by name
    async fn get_indexes_by_record_type(&self, record_type: &str)
        -> Result<BTreeMap<String, Index>>;

    /// Create a unique index
    async fn save_index(&self, record_type: &str, name: &str, index: &Index) -> Result<()>;

    /// Drop a unique index
    async fn delete_index(&self, record_type: &str, name: &str) -> Result<()>;

    /// Subscription by id and device
    async fn get_subscription(&self, key: &str, device_id: &str) -> Result<Subscription>;

    /// Insert or update a subscription
    async fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Delete a subscription
    async fn delete_subscription(&self, key: &str, device_id: &str) -> Result<()>;

    /// Subscriptions of a device
    async fn get_subscriptions_by_device_id(&self, device_id: &str) -> Result<Vec<Subscription>>;

    /// Subscriptions whose query matches `record`
    async fn get_matching_subscriptions(&self, record: &Record) -> Result<Vec<Subscription>>;
}
