//! # recordb-pq
//!
//! PostgreSQL storage driver for recordb.
//!
//! ## Features
//!
//! - **Query compilation**: predicates, sorts and paging compiled to SQL with
//!   record ACL and field ACL filters applied
//! - **JIT schema**: tables and columns are created or widened on save when
//!   the connection may migrate
//! - **Scopes**: public, private and read-only union databases over one table
//!   per record type
//! - **Stores**: users, roles, creation access, field access, assets,
//!   relations, devices and subscriptions
//! - **Change feed**: a trigger records every row change and a
//!   `LISTEN`/`NOTIFY` listener fans it out to subscribers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recordb_pq::prelude::*;
//!
//! let driver = PgDriver::default();
//! let conn = driver
//!     .connect("my-app", AccessModel::RoleBased, "postgres://localhost/app", &StoreConfig::default())
//!     .await?;
//!
//! let db = conn.public_db();
//! let mut note = Record::new(RecordId::new("note", "n1"))
//!     .with_owner("alice")
//!     .with_field("title", "hello");
//! db.save(&mut note).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod builder;
pub mod connection;
pub mod driver;
pub mod error;
pub mod init;
pub mod listener;
pub mod pool;
pub mod recorddb;
pub mod scan;
pub mod schema;
mod store;
pub mod subscription;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{schema_name, PgConn};
    pub use crate::driver::{PgDriver, DRIVER_NAME};
    pub use crate::listener::{ChangeListener, ListenerConfig};
    pub use crate::pool::{ClientPool, PoolConfig, PoolStats};
    pub use crate::recorddb::PgDatabase;

    pub use recordb_core::prelude::*;
}

// Re-export commonly used items at crate root
pub use connection::PgConn;
pub use driver::PgDriver;
pub use recordb_core::{Error, Result};
