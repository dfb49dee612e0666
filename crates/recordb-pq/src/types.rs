//! Bound parameters and column types
//!
//! [`SqlValue`] is what the compiler binds to a placeholder. Each variant
//! carries the cast written next to its placeholder, so statements never
//! depend on server-side parameter type inference.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use recordb_core::error::{Error, Result};
use recordb_core::schema::{DataType, FieldType};
use recordb_core::value::Value;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// Column type of strings, assets and references
pub const TYPE_STRING: &str = "text";
/// Column type of numbers
pub const TYPE_NUMBER: &str = "double precision";
/// Column type of booleans
pub const TYPE_BOOLEAN: &str = "boolean";
/// Column type of JSON values and ACLs
pub const TYPE_JSON: &str = "jsonb";
/// Column type of timestamps
pub const TYPE_TIMESTAMP: &str = "timestamp without time zone";
/// Column type of locations
pub const TYPE_LOCATION: &str = "geometry(Point)";
/// Column type of integers
pub const TYPE_INTEGER: &str = "bigint";
/// Column type of sequences
pub const TYPE_SERIAL: &str = "bigserial UNIQUE";
/// Column type of geometries
pub const TYPE_GEOMETRY: &str = "geometry";

/// A value bound to a statement placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// `text`
    Text(String),
    /// `double precision`
    Float(f64),
    /// `bigint`
    Integer(i64),
    /// `boolean`
    Boolean(bool),
    /// `timestamp` (UTC, no zone)
    Timestamp(NaiveDateTime),
    /// `jsonb`
    Json(serde_json::Value),
}

impl SqlValue {
    /// Cast written after the placeholder
    pub fn cast(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Float(_) => "double precision",
            Self::Integer(_) => "bigint",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "jsonb",
        }
    }

    /// Timestamp parameter from a UTC datetime
    pub fn timestamp(dt: DateTime<Utc>) -> Self {
        Self::Timestamp(dt.naive_utc())
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for SqlValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(j: serde_json::Value) -> Self {
        Self::Json(j)
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Self::Text(s) => s.to_sql(ty, out),
            Self::Float(n) => n.to_sql(ty, out),
            Self::Integer(n) => n.to_sql(ty, out),
            Self::Boolean(b) => b.to_sql(ty, out),
            Self::Timestamp(ts) => ts.to_sql(ty, out),
            Self::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
            || <f64 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <bool as ToSql>::accepts(ty)
            || <NaiveDateTime as ToSql>::accepts(ty)
            || <serde_json::Value as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

/// A fragment of SQL in the form of a bound parameter or an inline literal.
///
/// Null is never bound; it is written as `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `?` placeholder with its value
    Bind(SqlValue),
    /// SQL written verbatim
    Raw(String),
}

impl Operand {
    /// Inline `NULL`
    pub fn null() -> Self {
        Self::Raw("NULL".to_string())
    }
}

/// Convert a record value into what is written to its column.
///
/// Returns `Ok(None)` for values that are never written (`Unknown`).
pub fn value_to_operand(value: &Value) -> Result<Option<Operand>> {
    let operand = match value {
        Value::Null => Operand::null(),
        Value::String(s) => Operand::Bind(SqlValue::Text(s.clone())),
        Value::Number(n) => Operand::Bind(SqlValue::Float(*n)),
        Value::Integer(n) => Operand::Bind(SqlValue::Integer(*n)),
        Value::Boolean(b) => Operand::Bind(SqlValue::Boolean(*b)),
        Value::DateTime(dt) => Operand::Bind(SqlValue::timestamp(*dt)),
        Value::Asset(a) => Operand::Bind(SqlValue::Text(a.name.clone())),
        Value::Reference(r) => Operand::Bind(SqlValue::Text(r.id.key.clone())),
        Value::Json(j) => Operand::Bind(SqlValue::Json(j.clone())),
        Value::Location(_) | Value::Geometry(_) => {
            return Err(Error::internal(format!(
                "{} values are written through a spatial wrapper",
                value.kind()
            )))
        }
        Value::Unknown(_) => return Ok(None),
    };
    Ok(Some(operand))
}

/// Column definition for a field type
pub fn pq_data_type(field_type: &FieldType) -> Result<&'static str> {
    let ty = match field_type.data_type {
        DataType::String | DataType::Asset | DataType::Reference => TYPE_STRING,
        DataType::Number => TYPE_NUMBER,
        DataType::Integer => TYPE_INTEGER,
        DataType::DateTime => TYPE_TIMESTAMP,
        DataType::Boolean => TYPE_BOOLEAN,
        DataType::Json | DataType::Acl => TYPE_JSON,
        DataType::Location => TYPE_LOCATION,
        DataType::Sequence => TYPE_SERIAL,
        DataType::Geometry => TYPE_GEOMETRY,
        DataType::Unknown => {
            return Err(Error::not_supported(format!(
                "cannot create a column of unknown type {}",
                field_type.underlying_type
            )))
        }
    };
    Ok(ty)
}

/// Field type of a column as reported by `format_type`.
///
/// References, assets and sequences cannot be told apart from their
/// storage type here; they are refined from constraints and sequences.
pub fn field_type_from_pq(column: &str, pq_type: &str) -> FieldType {
    let data_type = match pq_type {
        "text" | "citext" | "character varying" => DataType::String,
        "double precision" | "real" => DataType::Number,
        "timestamp without time zone" | "timestamp with time zone" => DataType::DateTime,
        "boolean" => DataType::Boolean,
        "jsonb" | "json" if column == "_access" => DataType::Acl,
        "jsonb" | "json" => DataType::Json,
        "integer" | "bigint" | "smallint" => DataType::Integer,
        "geometry" => DataType::Geometry,
        t if t.starts_with("geometry(Point") || t.starts_with("geometry(point") => {
            DataType::Location
        }
        t if t.starts_with("character varying(") => DataType::String,
        other => return FieldType::unknown(other),
    };
    FieldType::new(data_type)
}
