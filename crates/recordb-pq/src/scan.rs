//! Row decoding and the record cursor
//!
//! Columns are decoded by the type map of the statement that produced
//! them, not by their wire type, so a text column can come back as a
//! string, an asset or a reference. Nulls are left out of the record.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use recordb_core::conn::RecordCursor;
use recordb_core::error::{Error, Result};
use recordb_core::record::{Record, RecordId};
use recordb_core::schema::{DataType, FieldType, RecordSchema};
use recordb_core::value::{Asset, Geometry, Location, Reference, Unknown, Value};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Row, RowStream};

use crate::builder::select::RECORD_COUNT_COLUMN;
use crate::error::from_pg;

/// Column value of any type, for presence checks only
#[derive(Debug)]
struct Opaque;

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(
        _ty: &Type,
        _raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Opaque)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(column)
        .map_err(|e| Error::serialization(format!("column {}: {}", column, e)))
}

fn column_type<'a>(row: &'a Row, column: &str) -> Result<&'a Type> {
    row.columns()
        .iter()
        .find(|c| c.name() == column)
        .map(|c| c.type_())
        .ok_or_else(|| Error::internal(format!("column {} missing from result", column)))
}

fn get_integer(row: &Row, column: &str) -> Result<Option<i64>> {
    let ty = column_type(row, column)?;
    if *ty == Type::INT2 {
        Ok(get::<i16>(row, column)?.map(i64::from))
    } else if *ty == Type::INT4 {
        Ok(get::<i32>(row, column)?.map(i64::from))
    } else {
        get::<i64>(row, column)
    }
}

fn get_number(row: &Row, column: &str) -> Result<Option<f64>> {
    let ty = column_type(row, column)?;
    if *ty == Type::FLOAT4 {
        Ok(get::<f32>(row, column)?.map(f64::from))
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        Ok(get_integer(row, column)?.map(|n| n as f64))
    } else {
        get::<f64>(row, column)
    }
}

fn get_datetime(row: &Row, column: &str) -> Result<Option<DateTime<Utc>>> {
    if *column_type(row, column)? == Type::TIMESTAMPTZ {
        return get::<DateTime<Utc>>(row, column);
    }
    Ok(get::<NaiveDateTime>(row, column)?.map(|dt| dt.and_utc()))
}

fn parse_geojson(column: &str, text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|e| Error::serialization(format!("column {} is not GeoJSON: {}", column, e)))
}

/// Decode one column into a value; `None` for SQL null
pub fn column_value(row: &Row, column: &str, field_type: &FieldType) -> Result<Option<Value>> {
    let value = match field_type.data_type {
        DataType::String => get::<String>(row, column)?.map(Value::String),
        DataType::Asset => get::<String>(row, column)?.map(|s| Value::Asset(Asset::named(s))),
        DataType::Reference => get::<String>(row, column)?
            .map(|s| Value::Reference(Reference::new(field_type.reference_type.as_str(), s))),
        DataType::Number => get_number(row, column)?.map(Value::Number),
        DataType::Integer | DataType::Sequence => get_integer(row, column)?.map(Value::Integer),
        DataType::Boolean => get::<bool>(row, column)?.map(Value::Boolean),
        DataType::DateTime => get_datetime(row, column)?.map(Value::DateTime),
        DataType::Json | DataType::Acl => get::<serde_json::Value>(row, column)?.map(Value::Json),
        DataType::Location => match get::<String>(row, column)? {
            Some(text) => Some(Value::Location(Location::from_geojson(&parse_geojson(
                column, &text,
            )?)?)),
            None => None,
        },
        DataType::Geometry => match get::<String>(row, column)? {
            Some(text) => Some(Value::Geometry(Geometry::from_geojson(parse_geojson(
                column, &text,
            )?)?)),
            None => None,
        },
        DataType::Unknown => get::<Opaque>(row, column)?.map(|_| {
            Value::Unknown(Unknown {
                underlying_type: field_type.underlying_type.clone(),
            })
        }),
    };
    Ok(value)
}

/// Decodes rows of one record type
#[derive(Debug, Clone)]
pub struct RowScanner {
    record_type: String,
    typemap: RecordSchema,
}

impl RowScanner {
    /// Scanner for rows selected with `typemap`
    pub fn new(record_type: impl Into<String>, typemap: RecordSchema) -> Self {
        Self {
            record_type: record_type.into(),
            typemap,
        }
    }

    /// Decode a row into a record, returning the window count if selected
    pub fn scan(&self, row: &Row) -> Result<(Record, Option<u64>)> {
        let mut record = Record::new(RecordId::new(self.record_type.as_str(), ""));
        let mut record_count = None;

        for (column, field_type) in self.typemap.iter() {
            if column == RECORD_COUNT_COLUMN {
                record_count = get_integer(row, column)?.map(|n| n.max(0) as u64);
                continue;
            }
            if let Some(value) = column_value(row, column, field_type)? {
                record.set(column, value)?;
            }
        }
        Ok((record, record_count))
    }

    /// Decode into an existing record, keeping fields the row does not carry
    pub fn scan_into(&self, row: &Row, record: &mut Record) -> Result<()> {
        let (scanned, _) = self.scan(row)?;
        let data = std::mem::take(&mut record.data);
        let transient = std::mem::take(&mut record.transient);
        *record = scanned;
        for (key, value) in data {
            record.data.entry(key).or_insert(value);
        }
        record.transient = transient;
        Ok(())
    }
}

/// Lazy cursor over a query's rows
pub struct PgCursor {
    rows: Pin<Box<RowStream>>,
    scanner: RowScanner,
    sql: String,
    record_count: Option<u64>,
    done: bool,
}

impl PgCursor {
    /// Cursor decoding `rows` with `scanner`
    pub fn new(rows: RowStream, scanner: RowScanner, sql: impl Into<String>) -> Self {
        Self {
            rows: Box::pin(rows),
            scanner,
            sql: sql.into(),
            record_count: None,
            done: false,
        }
    }
}

impl std::fmt::Debug for PgCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCursor")
            .field("scanner", &self.scanner)
            .field("record_count", &self.record_count)
            .field("done", &self.done)
            .finish()
    }
}

#[async_trait]
impl RecordCursor for PgCursor {
    async fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let row = match self.rows.next().await {
            Some(Ok(row)) => row,
            Some(Err(e)) => {
                self.done = true;
                return Err(from_pg(e, &self.sql));
            }
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        match self.scanner.scan(&row) {
            Ok((record, count)) => {
                if count.is_some() {
                    self.record_count = count;
                }
                Ok(Some(record))
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    fn record_count(&self) -> Option<u64> {
        self.record_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_geojson() {
        let json = parse_geojson("loc", r#"{"type":"Point","coordinates":[1.5,2.5]}"#).unwrap();
        assert_eq!(Location::from_geojson(&json).unwrap(), Location::new(1.5, 2.5));
        assert!(parse_geojson("loc", "POINT(1 2)").is_err());
    }

    #[test]
    fn test_opaque_accepts_anything() {
        assert!(<Opaque as FromSql>::accepts(&Type::MONEY));
        assert!(<Opaque as FromSql>::accepts(&Type::TS_VECTOR));
        assert!(<Opaque as FromSql>::accepts(&Type::NUMERIC));
    }

    #[test]
    fn test_numeric_columns_scan_as_unknown() {
        // f64 only decodes FLOAT8, so numeric must not be typed as a number
        assert!(!<f64 as FromSql>::accepts(&Type::NUMERIC));
        let field_type = crate::types::field_type_from_pq("price", "numeric");
        assert_eq!(field_type.data_type, DataType::Unknown);
    }
}
