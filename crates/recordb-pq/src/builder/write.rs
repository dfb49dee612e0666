//! INSERT, UPDATE and DELETE statements for records

use recordb_core::error::{Error, Result};
use recordb_core::record::Record;
use recordb_core::schema::{DataType, RecordSchema};
use recordb_core::value::Value;
use sea_query::{Alias, Expr, IntoIden, OnConflict, PostgresQueryBuilder, Query};

use super::expression::{make_point, Context, ExpressionSql};
use super::{full_quote, quote_ident, table_name, table_ref, Fragment, Statement};
use crate::types::{value_to_operand, SqlValue};

/// Columns never overwritten once a row exists
pub const IMMUTABLE_COLUMNS: [&str; 3] = ["_owner_id", "_created_at", "_created_by"];

/// SQL for writing `value` into a column.
///
/// Spatial values are converted on the server. Returns `None` for values
/// that must not be written.
pub fn write_operand(value: &Value) -> Result<Option<Fragment>> {
    match value {
        Value::Location(location) => Ok(Some(make_point(location))),
        Value::Geometry(geometry) => Ok(Some(Fragment::with_args(
            "ST_GeomFromGeoJSON(?)",
            vec![SqlValue::Text(geometry.to_geojson().to_string())],
        ))),
        other => Ok(value_to_operand(other)?.map(Fragment::operand)),
    }
}

/// Column values of a record as written to its table
pub fn record_columns(record: &Record, database_id: &str) -> Result<Vec<(String, Fragment)>> {
    let mut columns = vec![
        ("_id".to_string(), Fragment::bind(record.id.key.as_str())),
        ("_database_id".to_string(), Fragment::bind(database_id)),
        ("_owner_id".to_string(), Fragment::bind(record.owner_id.as_str())),
        (
            "_access".to_string(),
            match &record.acl {
                Some(acl) => Fragment::bind(serde_json::to_value(acl)?),
                None => Fragment::raw("NULL"),
            },
        ),
        ("_created_at".to_string(), Fragment::bind(SqlValue::timestamp(record.created_at))),
        ("_created_by".to_string(), Fragment::bind(record.creator_id.as_str())),
        ("_updated_at".to_string(), Fragment::bind(SqlValue::timestamp(record.updated_at))),
        ("_updated_by".to_string(), Fragment::bind(record.updater_id.as_str())),
    ];
    for (key, value) in &record.data {
        if let Some(fragment) = write_operand(value)? {
            columns.push((key.clone(), fragment));
        }
    }
    Ok(columns)
}

/// Insert-or-update of a record, returning the stored row.
///
/// Conflicts on `_id`; the update only applies when the existing row is
/// in the same database, so a clash across databases returns no row.
pub fn upsert_record(
    schema_name: &str,
    record: &Record,
    database_id: &str,
    typemap: &RecordSchema,
) -> Result<Statement> {
    let table = record.record_type();
    let columns = record_columns(record, database_id)?;

    let update_columns: Vec<_> = columns
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| *name != "_id" && !IMMUTABLE_COLUMNS.contains(name))
        .map(|name| Alias::new(name).into_iden())
        .collect();

    let mut args = Vec::new();
    let mut values = Vec::with_capacity(columns.len());
    let mut idens = Vec::with_capacity(columns.len());
    for (name, fragment) in columns {
        idens.push(Alias::new(name).into_iden());
        values.push(Expr::cust(fragment.sql));
        args.extend(fragment.args);
    }

    let mut on_conflict = OnConflict::column(Alias::new("_id"));
    on_conflict.update_columns(update_columns).action_and_where(Expr::cust(format!(
        "{} = \"excluded\".\"_database_id\"",
        full_quote(table, "_database_id")
    )));

    let mut returning = Vec::with_capacity(typemap.len());
    for (name, field_type) in typemap.iter() {
        let column = ExpressionSql::new(None, field_type.clone(), recordb_core::query::Expression::key_path(name.as_str()))
            .to_fragment(Context::Select)?;
        returning.push(Expr::cust(format!("{} AS {}", column.sql, quote_ident(name))));
    }

    let mut stmt = Query::insert();
    stmt.into_table(table_ref(schema_name, table))
        .columns(idens)
        .values(values)
        .map_err(|e| Error::internal(format!("failed to build upsert: {}", e)))?
        .on_conflict(on_conflict.to_owned())
        .returning(Query::returning().exprs(returning));

    Statement::number(&stmt.to_string(PostgresQueryBuilder), args)
}

/// DELETE of one record; `database_id` is `None` for the union scope
pub fn delete_record(
    schema_name: &str,
    record_type: &str,
    key: &str,
    database_id: Option<&str>,
) -> Result<Statement> {
    let mut args = vec![SqlValue::Text(key.to_string())];
    let mut stmt = Query::delete();
    stmt.from_table(table_ref(schema_name, record_type))
        .and_where(Expr::col(Alias::new("_id")).eq(Expr::cust("?")));
    if let Some(database_id) = database_id {
        stmt.and_where(Expr::col(Alias::new("_database_id")).eq(Expr::cust("?")));
        args.push(SqlValue::Text(database_id.to_string()));
    }
    Statement::number(&stmt.to_string(PostgresQueryBuilder), args)
}

/// Advance the sequence behind `column` to at least `value`.
///
/// Needed before writing an explicit value into a sequence column so the
/// next generated value does not collide with it.
pub fn set_sequence_value(
    schema_name: &str,
    record_type: &str,
    column: &str,
    value: &Value,
) -> Result<Statement> {
    let n = match value {
        Value::Integer(n) => *n,
        Value::Number(n) if n.fract() == 0.0 => *n as i64,
        other => {
            return Err(Error::invalid_argument(format!(
                "sequence column {} cannot hold a {} value",
                column,
                other.kind()
            )))
        }
    };
    let sequence = table_name(schema_name, &format!("{}_{}_seq", record_type, column));
    let sql = format!(
        "SELECT setval(CAST(? AS regclass), GREATEST(max({}), ?)) FROM {}",
        quote_ident(column),
        table_name(schema_name, record_type)
    );
    Statement::number(&sql, vec![SqlValue::Text(sequence), SqlValue::Integer(n)])
}

/// Data keys of `record` stored in sequence columns
pub fn sequence_columns<'r>(
    record: &'r Record,
    typemap: &RecordSchema,
) -> impl Iterator<Item = (&'r str, &'r Value)> + 'r {
    let sequences: Vec<String> = typemap
        .iter()
        .filter(|(_, t)| t.data_type == DataType::Sequence)
        .map(|(name, _)| name.clone())
        .collect();
    record
        .data
        .iter()
        .filter(move |(key, value)| sequences.contains(key) && !value.is_null())
        .map(|(key, value)| (key.as_str(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordb_core::record::RecordId;
    use recordb_core::schema::FieldType;
    use recordb_core::value::{Location, Unknown};

    fn note() -> Record {
        Record::new(RecordId::new("note", "n1"))
            .with_owner("alice")
            .with_field("title", "hi")
            .with_field("location", Value::Location(Location::new(1.0, 2.0)))
            .with_field(
                "price",
                Value::Unknown(Unknown {
                    underlying_type: "money".into(),
                }),
            )
    }

    #[test]
    fn test_record_columns_skip_unknown() {
        let columns = record_columns(&note(), "").unwrap();
        let names: Vec<_> = columns.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"_owner_id"));
        assert!(names.contains(&"title"));
        assert!(!names.contains(&"price"));
        let location = &columns.iter().find(|(n, _)| n == "location").unwrap().1;
        assert_eq!(location.sql, "ST_MakePoint(?, ?)");
        let access = &columns.iter().find(|(n, _)| n == "_access").unwrap().1;
        assert_eq!(access.sql, "NULL");
    }

    #[test]
    fn test_upsert_record() {
        let typemap = RecordSchema::new()
            .with_field("_id", FieldType::new(DataType::String))
            .with_field("location", FieldType::new(DataType::Location))
            .with_field("title", FieldType::new(DataType::String));
        let stmt = upsert_record("app_demo", &note(), "", &typemap).unwrap();
        let sql = &stmt.sql;

        assert!(sql.starts_with("INSERT INTO \"app_demo\".\"note\""));
        assert!(sql.contains("ON CONFLICT (\"_id\") DO UPDATE SET"));
        assert!(sql.contains("\"title\" = \"excluded\".\"title\""));
        assert!(!sql.contains("\"_owner_id\" = \"excluded\""));
        assert!(!sql.contains("\"_created_at\" = \"excluded\""));
        assert!(sql.contains("\"note\".\"_database_id\" = \"excluded\".\"_database_id\""));
        assert!(sql.contains("RETURNING \"_id\" AS \"_id\", ST_AsGeoJSON(\"location\") AS \"location\""));
        assert_eq!(stmt.args[0], SqlValue::from("n1"));
    }

    #[test]
    fn test_delete_record() {
        let stmt = delete_record("app_demo", "note", "n1", Some("")).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"app_demo\".\"note\" WHERE \"_id\" = $1::text AND \"_database_id\" = $2::text"
        );
        let union = delete_record("app_demo", "note", "n1", None).unwrap();
        assert_eq!(union.args.len(), 1);
    }

    #[test]
    fn test_set_sequence_value() {
        let stmt = set_sequence_value("app_demo", "note", "seq", &Value::Integer(7)).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT setval(CAST($1::text AS regclass), GREATEST(max(\"seq\"), $2::bigint)) FROM \"app_demo\".\"note\""
        );
        assert_eq!(stmt.args[0], SqlValue::from("\"app_demo\".\"note_seq_seq\""));
        assert!(set_sequence_value("app_demo", "note", "seq", &Value::from("x")).is_err());
    }
}
