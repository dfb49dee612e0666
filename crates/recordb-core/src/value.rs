//! Value types for record data
//!
//! [`Value`] is the closed set of things a record field can hold. Every
//! variant corresponds to one [`DataType`](crate::schema::DataType), which
//! keeps encode, decode and scan switches exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::record::RecordId;

/// Dynamic, sparse field map keyed by column name
pub type Data = BTreeMap<String, Value>;

/// A stored file referenced by a record field
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset name (primary key in `_asset`)
    pub name: String,
    /// MIME type
    #[serde(default)]
    pub content_type: String,
    /// Size in bytes
    #[serde(default)]
    pub size: i64,
    /// Whether the asset can be served without signing
    #[serde(default)]
    pub public: bool,
}

impl Asset {
    /// Asset with only its name known
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A reference to another record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced record
    pub id: RecordId,
}

impl Reference {
    /// Reference to `record_type/key`
    pub fn new(record_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(record_type, key),
        }
    }

    /// Whether the reference points nowhere
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// A geographic point, longitude first
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Longitude
    pub lng: f64,
    /// Latitude
    pub lat: f64,
}

impl Location {
    /// New location from longitude and latitude
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// GeoJSON `Point` representation
    pub fn to_geojson(&self) -> serde_json::Value {
        serde_json::json!({ "type": "Point", "coordinates": [self.lng, self.lat] })
    }

    /// Parse a GeoJSON `Point`
    pub fn from_geojson(value: &serde_json::Value) -> Result<Self> {
        let coords = value
            .get("coordinates")
            .and_then(|c| c.as_array())
            .ok_or_else(|| Error::serialization("location is not a GeoJSON point"))?;
        match (
            coords.first().and_then(|v| v.as_f64()),
            coords.get(1).and_then(|v| v.as_f64()),
        ) {
            (Some(lng), Some(lat)) => Ok(Self { lng, lat }),
            _ => Err(Error::serialization("location point needs two coordinates")),
        }
    }
}

impl fmt::Display for Location {
    /// WKT form, e.g. `POINT(114.1 22.3)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "POINT({} {})", self.lng, self.lat)
    }
}

/// Arbitrary GeoJSON geometry object
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(pub serde_json::Map<String, serde_json::Value>);

impl Geometry {
    /// Parse from a GeoJSON value, which must be an object
    pub fn from_geojson(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(Error::serialization(format!(
                "geometry must be a GeoJSON object, got {}",
                other
            ))),
        }
    }

    /// GeoJSON value
    pub fn to_geojson(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }

    /// The GeoJSON `type` member
    pub fn geometry_type(&self) -> Option<&str> {
        self.0.get("type").and_then(|t| t.as_str())
    }
}

/// Opaque placeholder for a column whose SQL type has no mapping
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Unknown {
    /// Raw SQL type name reported by the catalog
    pub underlying_type: String,
}

/// A record field value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Absent / SQL NULL
    #[default]
    Null,
    /// Text
    String(String),
    /// Double precision number
    Number(f64),
    /// 64-bit integer (integer and sequence columns)
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// Timestamp in UTC
    DateTime(DateTime<Utc>),
    /// Asset reference
    Asset(Asset),
    /// Record reference
    Reference(Reference),
    /// Geographic point
    Location(Location),
    /// GeoJSON geometry
    Geometry(Geometry),
    /// Nested map or list
    Json(serde_json::Value),
    /// Unsupported SQL type passed through opaquely
    Unknown(Unknown),
}

impl Value {
    /// Check if value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this is a JSON map or array
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Self::Json(serde_json::Value::Array(_)) | Self::Json(serde_json::Value::Object(_))
        )
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as f64, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::DateTime(_) => "datetime",
            Self::Asset(_) => "asset",
            Self::Reference(_) => "reference",
            Self::Location(_) => "location",
            Self::Geometry(_) => "geometry",
            Self::Json(_) => "json",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Plain JSON projection of the value.
    ///
    /// Assets collapse to their name and references to their key, which is
    /// how they are stored in their columns.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null | Self::Unknown(_) => J::Null,
            Self::String(s) => J::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n).map(J::Number).unwrap_or(J::Null),
            Self::Integer(n) => J::from(*n),
            Self::Boolean(b) => J::Bool(*b),
            Self::DateTime(dt) => J::String(dt.to_rfc3339()),
            Self::Asset(a) => J::String(a.name.clone()),
            Self::Reference(r) => J::String(r.id.key.clone()),
            Self::Location(l) => l.to_geojson(),
            Self::Geometry(g) => g.to_geojson(),
            Self::Json(j) => j.clone(),
        }
    }

    /// Best-effort conversion of untyped JSON into a value.
    ///
    /// Integral numbers become [`Value::Integer`], everything else maps
    /// onto the obvious variant; arrays and objects stay JSON.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match value {
            J::Null => Self::Null,
            J::Bool(b) => Self::Boolean(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Number(n.as_f64().unwrap_or_default()),
            },
            J::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }

    /// Loose equality used by in-process predicate evaluation.
    ///
    /// Numbers compare by numeric value across integer/number; everything
    /// else compares structurally.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Self::Json(a), b) | (b, Self::Json(a)) if !matches!(b, Self::Json(_)) => {
                    *a == b.to_json()
                }
                _ => self == other,
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Reference(r)
    }
}

impl From<Location> for Value {
    fn from(l: Location) -> Self {
        Self::Location(l)
    }
}

impl From<Asset> for Value {
    fn from(a: Asset) -> Self {
        Self::Asset(a)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_location_wkt_and_geojson() {
        let loc = Location::new(114.5, 22.25);
        assert_eq!(loc.to_string(), "POINT(114.5 22.25)");

        let parsed = Location::from_geojson(&loc.to_geojson()).unwrap();
        assert_eq!(parsed, loc);
        assert!(Location::from_geojson(&json!({"type": "Point"})).is_err());
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from_json(json!(1)), Value::Integer(1));
        assert_eq!(Value::from_json(json!(1.5)), Value::Number(1.5));
        assert_eq!(Value::from_json(json!("a")), Value::from("a"));
        assert_eq!(Value::from_json(json!(null)), Value::Null);
        assert!(Value::from_json(json!([1, 2])).is_collection());
    }

    #[test]
    fn test_loose_eq() {
        assert!(Value::Integer(3).loose_eq(&Value::Number(3.0)));
        assert!(!Value::Integer(3).loose_eq(&Value::Number(3.5)));
        assert!(Value::from("x").loose_eq(&Value::Json(json!("x"))));
        assert!(!Value::from("x").loose_eq(&Value::Null));
    }

    #[test]
    fn test_to_json_projection() {
        assert_eq!(Value::Asset(Asset::named("a.png")).to_json(), json!("a.png"));
        assert_eq!(Value::Reference(Reference::new("note", "1")).to_json(), json!("1"));
        assert_eq!(
            Value::Unknown(Unknown { underlying_type: "money".into() }).to_json(),
            json!(null)
        );
    }
}
