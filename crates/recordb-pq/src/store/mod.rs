//! Application tables outside the record tables
//!
//! Users, roles, access rules, assets, relations and devices live in
//! underscore-prefixed tables created by the bootstrap. Each capability
//! trait of [`recordb_core::conn::Conn`] is implemented on
//! [`PgConn`](crate::connection::PgConn) in its own module.

mod access;
mod asset;
mod device;
mod relation;
mod role;
mod user;

use recordb_core::error::{Error, Result};
use tokio_postgres::types::FromSql;
use tokio_postgres::Row;

/// Typed column read with a decode error instead of a panic
pub(crate) fn col<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T> {
    row.try_get(idx)
        .map_err(|e| Error::serialization(format!("column {}: {}", idx, e)))
}

/// Fail unless exactly one row was affected
pub(crate) fn expect_one(affected: u64, not_found: impl FnOnce() -> Error) -> Result<()> {
    match affected {
        0 => Err(not_found()),
        1 => Ok(()),
        n => Err(Error::internal(format!("want 1 rows affected, got {}", n))),
    }
}
