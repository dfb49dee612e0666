//! PostgreSQL error classification
//!
//! Driver errors are mapped onto the shared [`Error`] by SQLSTATE so callers
//! can branch on the kind without looking at PostgreSQL specifics:
//! - `23505` unique violation → [`Error::Duplicated`]
//! - `23503` foreign key violation → [`Error::ConstraintViolated`]
//! - `42P01` undefined table → not found (record type)
//! - `22xxx` data exception → [`Error::InvalidArgument`]
//! - `08xxx`, `40xxx`, `53xxx` and closed sockets → [`Error::Connection`] (retriable)

use recordb_core::error::{Error, Resource};

/// SQLSTATE of a unique violation
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE of a foreign key violation
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE of an undefined table
pub const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE of a deadlock
pub const DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE code of a server-side error
pub fn sql_state(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|e| e.code().code())
}

/// Whether the error is a unique violation
pub fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    sql_state(err) == Some(UNIQUE_VIOLATION)
}

/// Whether the error is a foreign key violation
pub fn is_foreign_key_violation(err: &tokio_postgres::Error) -> bool {
    sql_state(err) == Some(FOREIGN_KEY_VIOLATION)
}

/// Whether the error is an undefined table
pub fn is_undefined_table(err: &tokio_postgres::Error) -> bool {
    sql_state(err) == Some(UNDEFINED_TABLE)
}

/// Foreign key constraint named in the error, if any
pub fn constraint_name(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().and_then(|e| e.constraint())
}

/// Map a SQLSTATE and server message onto the shared error kinds.
///
/// Returns `None` for states that carry no semantic meaning for callers;
/// those are reported as plain query errors.
pub fn classify_sql_state(code: &str, message: &str) -> Option<Error> {
    let err = match code {
        UNIQUE_VIOLATION => Error::duplicated(message),
        FOREIGN_KEY_VIOLATION => Error::constraint_violated(message),
        UNDEFINED_TABLE => Error::NotFound {
            resource: Resource::RecordType,
            id: None,
        },
        DEADLOCK_DETECTED => Error::connection(format!("deadlock detected: {}", message)),
        c if c.starts_with("22") => Error::invalid_argument(message),
        c if c.starts_with("08") || c.starts_with("40") || c.starts_with("53") => {
            Error::connection(message)
        }
        "57014" => Error::timeout(message),
        c if c.starts_with("57") => Error::connection(message),
        _ => return None,
    };
    Some(err)
}

/// Convert a driver error, keeping the statement for diagnostics
pub fn from_pg(err: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = err.as_db_error() {
        if let Some(mapped) = classify_sql_state(db.code().code(), db.message()) {
            return mapped;
        }
        return Error::Query {
            message: db.message().to_string(),
            sql: Some(sql.to_string()),
            source: Some(Box::new(err)),
        };
    }
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }
    Error::Query {
        message: err.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(err)),
    }
}

/// Convert a connect failure; always retriable
pub fn connect_error(err: tokio_postgres::Error) -> Error {
    Error::connection_with_source(format!("failed to connect: {}", err), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordb_core::error::ErrorCategory;

    #[test]
    fn test_classify_conflicts() {
        let err = classify_sql_state("23505", "duplicate key").unwrap();
        assert!(matches!(err, Error::Duplicated { .. }));

        let err = classify_sql_state("23503", "still referenced").unwrap();
        assert!(matches!(err, Error::ConstraintViolated { .. }));
    }

    #[test]
    fn test_classify_undefined_table() {
        let err = classify_sql_state("42P01", "relation does not exist").unwrap();
        assert!(err.is_not_found_of(Resource::RecordType));
    }

    #[test]
    fn test_classify_retriable() {
        for code in ["08006", "40P01", "40001", "53300", "57P01"] {
            let err = classify_sql_state(code, "x").unwrap();
            assert!(err.is_retriable(), "{} should be retriable", code);
        }
        assert_eq!(
            classify_sql_state("57014", "canceled").unwrap().category(),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_classify_data_exception() {
        let err = classify_sql_state("22P02", "invalid input syntax").unwrap();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(classify_sql_state("42601", "syntax error").is_none());
    }
}
