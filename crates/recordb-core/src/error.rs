//! Error types for recordb
//!
//! One error type is shared by the model, the PostgreSQL store and the
//! notification pipeline. Errors are classified in two ways:
//! - [`ErrorCategory`] for retry decisions (transport vs semantic failures)
//! - [`ErrorCode`] for the numeric code surfaced to API clients

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for recordb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Record, user, device, subscription or asset does not exist
    NotFound,
    /// Unique or foreign key conflict
    Conflict,
    /// Incompatible schema definition or migration disabled
    Schema,
    /// Malformed predicate or unsupported query construct
    QueryValidity,
    /// Caller is not allowed to perform the operation
    Permission,
    /// Transaction state misuse
    Transaction,
    /// Store unreachable or connection dropped (retriable)
    Connection,
    /// Operation timed out (retriable)
    Timeout,
    /// Encoding or decoding failure
    Serialization,
    /// Invalid configuration or driver registration
    Configuration,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Schema => write!(f, "schema"),
            Self::QueryValidity => write!(f, "query_validity"),
            Self::Permission => write!(f, "permission"),
            Self::Transaction => write!(f, "transaction"),
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Numeric error codes exposed to API clients.
///
/// Values are stable; new codes are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum ErrorCode {
    NotAuthenticated = 101,
    PermissionDenied = 102,
    AccessKeyNotAccepted = 103,
    AccessTokenNotAccepted = 104,
    InvalidCredentials = 105,
    InvalidSignature = 106,
    BadRequest = 107,
    InvalidArgument = 108,
    Duplicated = 109,
    ResourceNotFound = 110,
    NotSupported = 111,
    NotImplemented = 112,
    ConstraintViolated = 113,
    IncompatibleSchema = 114,
    AtomicOperationFailure = 115,
    PartialOperationFailure = 116,
    UndefinedOperation = 117,
    PluginUnavailable = 118,
    PluginTimeout = 119,
    RecordQueryInvalid = 120,
    PluginInitializing = 121,
    ResponseTimeout = 122,
    DeniedArgument = 123,
    RecordQueryDenied = 124,
    NotConfigured = 125,
    UnexpectedError = 10000,
    UnexpectedAuthInfoNotFound = 10001,
    UnexpectedUnableToOpenDatabase = 10002,
    UnexpectedPushNotificationNotConfigured = 10003,
    InternalQueryInvalid = 10004,
    UnexpectedUserNotFound = 10005,
}

impl ErrorCode {
    /// The numeric value sent over the wire
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kind of entity a not-found error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A record row
    Record,
    /// A record type (backing table)
    RecordType,
    /// A user row
    User,
    /// A registered device
    Device,
    /// A stored subscription
    Subscription,
    /// An asset
    Asset,
    /// A unique index
    Index,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record => write!(f, "record"),
            Self::RecordType => write!(f, "record type"),
            Self::User => write!(f, "user"),
            Self::Device => write!(f, "device"),
            Self::Subscription => write!(f, "subscription"),
            Self::Asset => write!(f, "asset"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// Structured error shape returned to API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Numeric error code
    pub error_code: u32,
    /// Human readable message
    pub message: String,
}

/// Main error type for recordb
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Entity not found
    #[error("{resource} not found{}", .id.as_deref().map(|id| format!(": {}", id)).unwrap_or_default())]
    NotFound { resource: Resource, id: Option<String> },

    /// Unique constraint violation
    #[error("duplicated: {message}")]
    Duplicated { message: String },

    /// Row is still referenced by another row
    #[error("constraint violated: {message}")]
    ConstraintViolated { message: String },

    /// Schema redefinition conflict or migration disabled
    #[error("incompatible schema: {message}")]
    IncompatibleSchema { message: String },

    /// Malformed predicate or query
    #[error("invalid query: {message}")]
    RecordQueryInvalid { message: String },

    /// Operator combination the compiler cannot express
    #[error("unsupported operator {operator}: {message}")]
    UnsupportedOperator { operator: String, message: String },

    /// Construct recognised but not supported
    #[error("not supported: {message}")]
    NotSupported { message: String },

    /// Invalid argument supplied by the caller
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Caller lacks permission
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Write attempted on a read-only database
    #[error("database is read only")]
    DatabaseIsReadOnly,

    /// Begin called while a transaction is open
    #[error("transaction already began")]
    TxDidBegin,

    /// Commit or rollback without an open transaction
    #[error("transaction has not begun")]
    TxDidNotBegin,

    /// Store connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Encoding or decoding failed
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Driver registered twice
    #[error("driver already registered: {name}")]
    DriverAlreadyRegistered { name: String },

    /// Driver name unknown to the registry
    #[error("driver not found: {name}")]
    DriverNotFound { name: String },

    /// Error annotated with the failing operation
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Self::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Duplicated { .. } | Self::ConstraintViolated { .. } => ErrorCategory::Conflict,
            Self::IncompatibleSchema { .. } => ErrorCategory::Schema,
            Self::RecordQueryInvalid { .. }
            | Self::UnsupportedOperator { .. }
            | Self::NotSupported { .. }
            | Self::InvalidArgument { .. } => ErrorCategory::QueryValidity,
            Self::PermissionDenied { .. } | Self::DatabaseIsReadOnly => ErrorCategory::Permission,
            Self::TxDidBegin | Self::TxDidNotBegin => ErrorCategory::Transaction,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::Configuration { .. }
            | Self::DriverAlreadyRegistered { .. }
            | Self::DriverNotFound { .. } => ErrorCategory::Configuration,
            Self::Query { .. } | Self::Internal { .. } | Self::Context { .. } => {
                ErrorCategory::Other
            }
        }
    }

    /// Numeric API code for this error
    pub fn code(&self) -> ErrorCode {
        match self.root() {
            Self::NotFound { .. } => ErrorCode::ResourceNotFound,
            Self::Duplicated { .. } => ErrorCode::Duplicated,
            Self::ConstraintViolated { .. } => ErrorCode::ConstraintViolated,
            Self::IncompatibleSchema { .. } => ErrorCode::IncompatibleSchema,
            Self::RecordQueryInvalid { .. } => ErrorCode::RecordQueryInvalid,
            Self::UnsupportedOperator { .. } | Self::NotSupported { .. } => {
                ErrorCode::NotSupported
            }
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::PermissionDenied { .. } | Self::DatabaseIsReadOnly => {
                ErrorCode::PermissionDenied
            }
            Self::Timeout { .. } => ErrorCode::ResponseTimeout,
            Self::Configuration { .. }
            | Self::DriverAlreadyRegistered { .. }
            | Self::DriverNotFound { .. } => ErrorCode::NotConfigured,
            Self::Connection { .. } => ErrorCode::UnexpectedUnableToOpenDatabase,
            Self::TxDidBegin
            | Self::TxDidNotBegin
            | Self::Query { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. }
            | Self::Context { .. } => ErrorCode::UnexpectedError,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the entity does not exist
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    /// Whether this error is a not-found for the given resource
    pub fn is_not_found_of(&self, resource: Resource) -> bool {
        matches!(self.root(), Self::NotFound { resource: r, .. } if *r == resource)
    }

    /// Convert into the API-facing `{error_code, message}` shape
    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            error_code: self.code().as_u32(),
            message: self.root().to_string(),
        }
    }

    /// Wrap with the failing operation and entity id
    pub fn with_context(self, operation: &str, id: impl fmt::Display) -> Self {
        Self::Context {
            context: format!("{} {}", operation, id),
            source: Box::new(self),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: Resource, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: Some(id.into()),
        }
    }

    /// Record not found without an id
    pub fn record_not_found() -> Self {
        Self::NotFound {
            resource: Resource::Record,
            id: None,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a duplicated error
    pub fn duplicated(message: impl Into<String>) -> Self {
        Self::Duplicated {
            message: message.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint_violated(message: impl Into<String>) -> Self {
        Self::ConstraintViolated {
            message: message.into(),
        }
    }

    /// Create an incompatible schema error
    pub fn incompatible_schema(message: impl Into<String>) -> Self {
        Self::IncompatibleSchema {
            message: message.into(),
        }
    }

    /// Create an invalid query error
    pub fn query_invalid(message: impl Into<String>) -> Self {
        Self::RecordQueryInvalid {
            message: message.into(),
        }
    }

    /// Create an unsupported operator error
    pub fn unsupported_operator(operator: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Conflict.is_retriable());
        assert!(!ErrorCategory::Schema.is_retriable());
        assert!(!ErrorCategory::QueryValidity.is_retriable());
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::record_not_found().with_context("delete", "note/1");
        assert!(err.is_not_found());
        assert!(err.is_not_found_of(Resource::Record));
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.code(), ErrorCode::ResourceNotFound);
        assert!(err.to_string().contains("delete note/1"));
    }

    #[test]
    fn test_api_error_shape() {
        let err = Error::duplicated("_id already exists");
        let api = err.to_api_error();
        assert_eq!(api.error_code, 109);

        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["error_code"], 109);
        assert!(json["message"].as_str().unwrap().contains("_id already exists"));
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found(Resource::Device, "dev-1");
        assert_eq!(err.to_string(), "device not found: dev-1");
        assert_eq!(Error::record_not_found().to_string(), "record not found");
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::incompatible_schema("x").code().as_u32(), 114);
        assert_eq!(Error::query_invalid("x").code().as_u32(), 120);
        assert_eq!(Error::unsupported_operator("In", "x").code().as_u32(), 111);
        assert_eq!(Error::constraint_violated("x").code().as_u32(), 113);
        assert!(Error::connection("refused").is_retriable());
        assert!(!Error::DatabaseIsReadOnly.is_retriable());
    }
}
