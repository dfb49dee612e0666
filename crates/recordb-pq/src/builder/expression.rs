//! Expression operands
//!
//! Key paths render as a column of a table alias, functions as their SQL
//! counterpart, and literals as bound parameters. Spatial columns are
//! read through `ST_AsGeoJSON` when selected.

use recordb_core::error::{Error, Result};
use recordb_core::query::{Expression, Func, Sort, SortOrder};
use recordb_core::schema::{DataType, FieldType, RecordSchema};
use recordb_core::value::{Location, Value};
use sea_query::Order;

use super::{full_quote, placeholders, quote_ident, Fragment};
use crate::types::{value_to_operand, SqlValue};

/// Where an operand is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Inside a condition
    Where,
    /// In the select list
    Select,
}

/// An expression bound to the table alias its columns belong to
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionSql {
    /// Table alias for key paths; unqualified when `None`
    pub alias: Option<String>,
    /// Resolved type of the expression
    pub field_type: FieldType,
    /// The expression
    pub expression: Expression,
}

impl ExpressionSql {
    /// Operand over `alias`
    pub fn new(alias: Option<&str>, field_type: FieldType, expression: Expression) -> Self {
        Self {
            alias: alias.map(str::to_string),
            field_type,
            expression,
        }
    }

    /// Whether this is a null literal
    pub fn is_null(&self) -> bool {
        self.expression.is_literal_null()
    }

    /// Render in `context`
    pub fn to_fragment(&self, context: Context) -> Result<Fragment> {
        let fragment = match &self.expression {
            Expression::KeyPath(_) => {
                let components = self.expression.key_path_components().unwrap_or_default();
                let column = components
                    .last()
                    .ok_or_else(|| Error::query_invalid("empty key path"))?;
                Fragment::raw(column_ref(self.alias.as_deref(), column))
            }
            Expression::Function(func) => func_operand(self.alias.as_deref(), func)?,
            Expression::Literal(value) => literal_operand(value)?,
        };

        if context == Context::Select && self.field_type.data_type.is_geometry_compatible() {
            return Ok(fragment.wrap("ST_AsGeoJSON(", ")"));
        }
        Ok(fragment)
    }
}

/// Column reference, qualified when an alias is given
pub fn column_ref(alias: Option<&str>, column: &str) -> String {
    match alias {
        Some(alias) => full_quote(alias, column),
        None => quote_ident(column),
    }
}

/// `ST_MakePoint(?, ?)` for a location
pub fn make_point(location: &Location) -> Fragment {
    Fragment::with_args(
        "ST_MakePoint(?, ?)",
        vec![SqlValue::Float(location.lng), SqlValue::Float(location.lat)],
    )
}

/// SQL for a function used as an operand
pub fn func_operand(alias: Option<&str>, func: &Func) -> Result<Fragment> {
    match func {
        Func::Distance { field, location } => {
            let mut f = Fragment::raw(format!("ST_DistanceSphere({}, ", column_ref(alias, field)));
            f.push(make_point(location)).push_str(")");
            Ok(f)
        }
        Func::Count { overall_records } => Ok(Fragment::raw(if *overall_records {
            "COUNT(*) OVER()"
        } else {
            "COUNT(*)"
        })),
        Func::UserData { data_name } => Ok(Fragment::raw(full_quote("_user", data_name))),
        Func::UserRelation { .. } | Func::UserDiscover { .. } => Err(Error::query_invalid(
            format!("{} cannot be used as an operand", func.name()),
        )),
    }
}

/// SQL for a literal.
///
/// Arrays become a parenthesised list for `IN`; an empty array becomes
/// `(NULL)`, which matches nothing.
pub fn literal_operand(value: &Value) -> Result<Fragment> {
    match value {
        Value::Json(serde_json::Value::Array(items)) => {
            let values = items
                .iter()
                .map(|item| scalar_arg(&Value::from_json(item.clone())))
                .collect::<Result<Vec<_>>>()?;
            Ok(placeholders(values))
        }
        Value::Location(location) => Ok(make_point(location)),
        Value::Geometry(geometry) => Ok(Fragment::with_args(
            "ST_GeomFromGeoJSON(?)",
            vec![SqlValue::Text(geometry.to_geojson().to_string())],
        )),
        other => match value_to_operand(other)? {
            Some(operand) => Ok(Fragment::operand(operand)),
            None => Err(Error::invalid_argument(format!(
                "{} literal cannot be compared",
                other.kind()
            ))),
        },
    }
}

fn scalar_arg(value: &Value) -> Result<SqlValue> {
    match value_to_operand(value)? {
        Some(crate::types::Operand::Bind(v)) => Ok(v),
        _ => Err(Error::invalid_argument(format!(
            "{} cannot be an element of a list",
            value.kind()
        ))),
    }
}

/// Type of a literal; null has none
pub fn literal_field_type(value: &Value) -> Result<FieldType> {
    if value.is_null() {
        return Ok(FieldType::new(DataType::Unknown));
    }
    recordb_core::schema::derive_field_type(value)
}

/// Result type of a function operand
pub fn func_field_type(func: &Func) -> FieldType {
    match func {
        Func::Distance { .. } => FieldType::new(DataType::Number),
        Func::Count { .. } => FieldType::new(DataType::Integer),
        Func::UserData { .. } => FieldType::new(DataType::String),
        Func::UserRelation { .. } | Func::UserDiscover { .. } => FieldType::new(DataType::Boolean),
    }
}

/// A distance needs a spatial column of `schema` and a finite point
pub fn check_distance(schema: &RecordSchema, field: &str, location: &Location) -> Result<()> {
    match schema.get(field) {
        Some(field_type) if field_type.data_type.is_geometry_compatible() => {}
        Some(field_type) => {
            return Err(Error::query_invalid(format!(
                "cannot compute distance on \"{}\" of type {}",
                field,
                field_type.to_simple_name()
            )))
        }
        None => {
            return Err(Error::query_invalid(format!(
                "cannot compute distance on unknown field \"{}\"",
                field
            )))
        }
    }
    if !location.lng.is_finite() || !location.lat.is_finite() {
        return Err(Error::query_invalid("distance location must be finite"));
    }
    Ok(())
}

/// `ORDER BY` term for a sort on the primary table.
///
/// Only plain columns and distance can be sorted on.
pub fn order_by(table: &str, schema: &RecordSchema, sort: &Sort) -> Result<(Fragment, Order)> {
    let expr = match &sort.expression {
        Expression::KeyPath(path) => {
            if path.contains('.') {
                return Err(Error::query_invalid(format!(
                    "cannot sort by key path \"{}\" through a reference",
                    path
                )));
            }
            Fragment::raw(full_quote(table, path))
        }
        Expression::Function(func @ Func::Distance { field, location }) => {
            check_distance(schema, field, location)?;
            func_operand(Some(table), func)?
        }
        Expression::Function(func) => {
            return Err(Error::query_invalid(format!(
                "cannot sort by function {}",
                func.name()
            )))
        }
        Expression::Literal(_) => {
            return Err(Error::query_invalid("cannot sort by a literal"));
        }
    };

    let order = match sort.order {
        SortOrder::Asc => Order::Asc,
        SortOrder::Desc => Order::Desc,
    };
    Ok((expr, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_path_operand() {
        let e = ExpressionSql::new(
            Some("note"),
            FieldType::new(DataType::String),
            Expression::key_path("title"),
        );
        assert_eq!(e.to_fragment(Context::Where).unwrap().sql, "\"note\".\"title\"");

        let joined = ExpressionSql::new(
            Some("_t0"),
            FieldType::new(DataType::String),
            Expression::key_path("city.name"),
        );
        assert_eq!(joined.to_fragment(Context::Where).unwrap().sql, "\"_t0\".\"name\"");
    }

    #[test]
    fn test_geometry_selected_as_geojson() {
        let e = ExpressionSql::new(
            Some("place"),
            FieldType::new(DataType::Geometry),
            Expression::key_path("area"),
        );
        assert_eq!(
            e.to_fragment(Context::Select).unwrap().sql,
            "ST_AsGeoJSON(\"place\".\"area\")"
        );
        assert_eq!(e.to_fragment(Context::Where).unwrap().sql, "\"place\".\"area\"");
    }

    #[test]
    fn test_literal_lists() {
        let f = literal_operand(&Value::Json(json!(["a", "b"]))).unwrap();
        assert_eq!(f.sql, "(?, ?)");
        assert_eq!(f.args, vec![SqlValue::from("a"), SqlValue::from("b")]);

        let empty = literal_operand(&Value::Json(json!([]))).unwrap();
        assert_eq!(empty.sql, "(NULL)");
        assert!(empty.args.is_empty());

        assert_eq!(literal_operand(&Value::Null).unwrap().sql, "NULL");
    }

    #[test]
    fn test_distance_operand() {
        let f = func_operand(
            Some("place"),
            &Func::Distance {
                field: "location".into(),
                location: Location::new(1.5, 2.5),
            },
        )
        .unwrap();
        assert_eq!(
            f.sql,
            "ST_DistanceSphere(\"place\".\"location\", ST_MakePoint(?, ?))"
        );
        assert_eq!(f.args, vec![SqlValue::Float(1.5), SqlValue::Float(2.5)]);
    }

    #[test]
    fn test_order_by() {
        let schema = RecordSchema::new()
            .with_field("order", FieldType::new(DataType::Number))
            .with_field("location", FieldType::new(DataType::Location));
        let (expr, order) = order_by("note", &schema, &Sort::desc("order")).unwrap();
        assert_eq!(expr.sql, "\"note\".\"order\"");
        assert!(matches!(order, Order::Desc));
        let by_distance = |field: &str, location: Location| Sort {
            expression: Expression::Function(Func::Distance {
                field: field.into(),
                location,
            }),
            order: SortOrder::Asc,
        };
        let (expr, order) =
            order_by("place", &schema, &by_distance("location", Location::new(1.0, 2.0))).unwrap();
        assert_eq!(
            expr.sql,
            "ST_DistanceSphere(\"place\".\"location\", ST_MakePoint(?, ?))"
        );
        assert_eq!(expr.args, vec![SqlValue::Float(1.0), SqlValue::Float(2.0)]);
        assert!(matches!(order, Order::Asc));

        let by_count = Sort {
            expression: Expression::Function(Func::Count {
                overall_records: false,
            }),
            order: SortOrder::Asc,
        };
        assert!(order_by("note", &schema, &by_count).is_err());
    }

    #[test]
    fn test_distance_operands_are_checked() {
        let schema = RecordSchema::new()
            .with_field("order", FieldType::new(DataType::Number))
            .with_field("location", FieldType::new(DataType::Location));
        assert!(check_distance(&schema, "location", &Location::new(1.0, 2.0)).is_ok());
        for (field, location) in [
            ("location", Location::new(f64::NAN, 2.0)),
            ("location", Location::new(1.0, f64::INFINITY)),
            ("order", Location::new(1.0, 2.0)),
            ("nope", Location::new(1.0, 2.0)),
        ] {
            let err = check_distance(&schema, field, &location).unwrap_err();
            assert!(matches!(err, Error::RecordQueryInvalid { .. }));
        }
    }
}
