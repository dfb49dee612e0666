//! Field types and record schemas
//!
//! A [`RecordSchema`] maps column names to [`FieldType`]s. Compatibility
//! between schemas is directional and drives JIT migration: a table only
//! needs altering when the stored schema is not compatible with the one a
//! record requires.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::query::Expression;
use crate::value::Value;

/// Data type of a record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Text
    String,
    /// Double precision number
    Number,
    /// Boolean
    Boolean,
    /// JSON map or list
    Json,
    /// Reference to another record type
    Reference,
    /// Geographic point
    Location,
    /// Timestamp
    DateTime,
    /// Asset name
    Asset,
    /// Access control list (`_access`)
    Acl,
    /// Integer
    Integer,
    /// Auto-incrementing integer
    Sequence,
    /// GeoJSON geometry
    Geometry,
    /// Unmapped SQL type
    Unknown,
}

impl DataType {
    /// Whether the type is integer, number or sequence
    #[inline]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Number | Self::Integer | Self::Sequence)
    }

    /// Whether the type is a spatial type
    #[inline]
    pub const fn is_geometry_compatible(self) -> bool {
        matches!(self, Self::Location | Self::Geometry)
    }
}

/// Full type description of a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldType {
    /// Base type
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Referenced record type for `Reference` fields
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_type: String,
    /// Expression for computed columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    /// Raw SQL type name for `Unknown` fields
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub underlying_type: String,
}

impl FieldType {
    /// Plain field type
    pub const fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            reference_type: String::new(),
            expression: None,
            underlying_type: String::new(),
        }
    }

    /// Reference to `record_type`
    pub fn reference(record_type: impl Into<String>) -> Self {
        Self {
            reference_type: record_type.into(),
            ..Self::new(DataType::Reference)
        }
    }

    /// Unmapped SQL type
    pub fn unknown(underlying_type: impl Into<String>) -> Self {
        Self {
            underlying_type: underlying_type.into(),
            ..Self::new(DataType::Unknown)
        }
    }

    /// Computed column
    pub fn computed(data_type: DataType, expression: Expression) -> Self {
        Self {
            expression: Some(expression),
            ..Self::new(data_type)
        }
    }

    /// Whether a column of this type can store values of `other`
    pub fn definition_compatible_to(&self, other: &FieldType) -> bool {
        if self.data_type == DataType::Reference || other.data_type == DataType::Reference {
            return self.data_type == other.data_type
                && self.reference_type == other.reference_type;
        }
        if self.data_type.is_numeric() && other.data_type.is_numeric() {
            return true;
        }
        self.data_type == other.data_type
    }

    /// Short name used by schema APIs, e.g. `ref(note)`
    pub fn to_simple_name(&self) -> String {
        match self.data_type {
            DataType::String => "string".into(),
            DataType::Number => "number".into(),
            DataType::Boolean => "boolean".into(),
            DataType::Json => "json".into(),
            DataType::Reference => format!("ref({})", self.reference_type),
            DataType::Location => "location".into(),
            DataType::DateTime => "datetime".into(),
            DataType::Asset => "asset".into(),
            DataType::Acl => "acl".into(),
            DataType::Integer => "integer".into(),
            DataType::Sequence => "sequence".into(),
            DataType::Geometry => "geometry".into(),
            DataType::Unknown => "unknown".into(),
        }
    }

    /// Parse a short name produced by [`FieldType::to_simple_name`]
    pub fn from_simple_name(name: &str) -> Result<Self> {
        let data_type = match name {
            "string" => DataType::String,
            "number" => DataType::Number,
            "boolean" => DataType::Boolean,
            "json" => DataType::Json,
            "location" => DataType::Location,
            "datetime" => DataType::DateTime,
            "asset" => DataType::Asset,
            "acl" => DataType::Acl,
            "integer" => DataType::Integer,
            "sequence" => DataType::Sequence,
            "geometry" => DataType::Geometry,
            "unknown" => DataType::Unknown,
            _ => {
                return match name.strip_prefix("ref(").and_then(|s| s.strip_suffix(')')) {
                    Some(target) if !target.is_empty() => Ok(Self::reference(target)),
                    _ => Err(Error::invalid_argument(format!(
                        "unexpected field type name: {}",
                        name
                    ))),
                };
            }
        };
        Ok(Self::new(data_type))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_simple_name())
    }
}

/// Derive the field type a value would be stored as.
///
/// Null has no type and is rejected.
pub fn derive_field_type(value: &Value) -> Result<FieldType> {
    let data_type = match value {
        Value::Null => {
            return Err(Error::invalid_argument("cannot derive field type of null"));
        }
        Value::String(_) => DataType::String,
        Value::Number(_) => DataType::Number,
        Value::Integer(_) => DataType::Integer,
        Value::Boolean(_) => DataType::Boolean,
        Value::DateTime(_) => DataType::DateTime,
        Value::Asset(_) => DataType::Asset,
        Value::Reference(r) => return Ok(FieldType::reference(r.id.record_type.clone())),
        Value::Location(_) => DataType::Location,
        Value::Geometry(_) => DataType::Geometry,
        Value::Json(_) => DataType::Json,
        Value::Unknown(u) => return Ok(FieldType::unknown(u.underlying_type.clone())),
    };
    Ok(FieldType::new(data_type))
}

/// Column name to field type mapping of a record type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSchema(pub BTreeMap<String, FieldType>);

impl RecordSchema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a field
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.0.insert(name.into(), field_type);
        self
    }

    /// Insert a field
    pub fn insert(&mut self, name: impl Into<String>, field_type: FieldType) {
        self.0.insert(name.into(), field_type);
    }

    /// Look up a field
    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.0.get(name)
    }

    /// Whether the field exists
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldType)> {
        self.0.iter()
    }

    /// Whether a table with this schema can hold records of `other`.
    ///
    /// Every field of `other` must exist here with a compatible type. The
    /// relation is directional: a superset is compatible to its subset,
    /// not the other way round.
    pub fn definition_compatible_to(&self, other: &RecordSchema) -> bool {
        if self.len() < other.len() {
            return false;
        }
        other.iter().all(|(name, wanted)| {
            self.get(name)
                .map(|have| wanted.definition_compatible_to(have))
                .unwrap_or(false)
        })
    }

    /// Fields whose names do not start with `_`
    pub fn user_fields(&self) -> RecordSchema {
        RecordSchema(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, FieldType)> for RecordSchema {
    fn from_iter<T: IntoIterator<Item = (String, FieldType)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Unique index over one or more fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Index {
    /// Indexed fields, in order
    pub fields: Vec<String>,
}

impl Index {
    /// Index over `fields`
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}
