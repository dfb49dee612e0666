//! # recordb-core
//!
//! Record model, predicate language and access control for recordb, a
//! schema-flexible record store built on a relational database.
//!
//! ## Overview
//!
//! - **Records**: typed metadata plus a sparse map of [`Value`]s
//! - **Schemas**: column types with directional compatibility, driving JIT migration
//! - **Queries**: an operator/expression predicate tree with shape validation
//! - **Access control**: record ACLs and per-field rules keyed by user role
//! - **Matching**: in-process evaluation of predicates against changed records
//! - **Store contracts**: the [`Conn`](conn::Conn) and [`Database`](conn::Database)
//!   traits implemented by storage drivers, and an explicit [`DriverRegistry`](driver::DriverRegistry)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recordb_core::prelude::*;
//!
//! let query = Query::new("note")
//!     .with_predicate(Predicate::equal(
//!         Expression::key_path("category"),
//!         Expression::literal("work"),
//!     ))
//!     .with_sort(Sort::desc("order"))
//!     .with_limit(10);
//! query.validate()?;
//!
//! let driver = registry.get("pq")?;
//! let conn = driver.open("my-app", AccessModel::RoleBased, url, &StoreConfig::default()).await?;
//! let mut cursor = conn.public_db().query(&query).await?;
//! while let Some(record) = cursor.next().await? {
//!     println!("{}", record.id);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod acl;
pub mod config;
pub mod conn;
pub mod device;
pub mod driver;
pub mod error;
pub mod field_acl;
pub mod matcher;
pub mod query;
pub mod record;
pub mod schema;
pub mod user;
pub mod value;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{ApiError, Error, ErrorCategory, ErrorCode, Resource, Result};

    // Values and records
    pub use crate::record::{Record, RecordEvent, RecordHookEvent, RecordId};
    pub use crate::schema::{derive_field_type, DataType, FieldType, Index, RecordSchema};
    pub use crate::value::{Asset, Data, Geometry, Location, Reference, Unknown, Value};

    // Query model
    pub use crate::matcher::matches;
    pub use crate::query::{
        Expression, Func, Operator, Predicate, PredicateChild, Query, RelationDirection, Sort,
        SortOrder,
    };

    // Access control
    pub use crate::acl::{AclLevel, RecordAcl, RecordAclEntry, UserInfo};
    pub use crate::field_acl::{FieldAccessMode, FieldAcl, FieldAclEntry, FieldUserRole};

    // Store contracts
    pub use crate::config::{DefaultFieldAccess, StoreConfig};
    pub use crate::conn::{
        AccessControlOptions, AccessModel, AccessStore, AssetStore, Conn, Database,
        DatabaseType, DeviceStore, EmptyCursor, QueryConfig, RecordCursor, RelationStore,
        RoleStore, UserStore,
    };
    pub use crate::device::{ApsSetting, Device, NotificationInfo, Subscription};
    pub use crate::driver::{Driver, DriverRegistry};
    pub use crate::user::{RelationKind, User};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use value::Value;
