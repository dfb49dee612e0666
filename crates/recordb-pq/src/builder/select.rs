//! SELECT statements for record reads
//!
//! Every read goes through [`SelectBuilder`]: select list from a type map,
//! scope filter on `_database_id`, compiled predicate with its joins, the
//! access clause, ordering and paging. The returned type map tells the
//! scanner how to decode each selected column.

use std::collections::HashMap;

use recordb_core::acl::AclLevel;
use recordb_core::conn::{AccessControlOptions, DatabaseType};
use recordb_core::error::{Error, Result};
use recordb_core::query::{Expression, Func, Query};
use recordb_core::schema::{DataType, FieldType, RecordSchema};
use sea_query::{Alias, Expr, JoinType, Order, PostgresQueryBuilder};

use super::access::access_clause;
use super::expression::{
    check_distance, func_field_type, literal_field_type, order_by, Context, ExpressionSql,
};
use super::predicate::PredicateCompiler;
use super::{full_quote, quote_ident, table_ref, text_list, Fragment, Statement};
use crate::types::SqlValue;

/// Column holding the window count of a query
pub const RECORD_COUNT_COLUMN: &str = "_record_count";

/// Prefix of computed columns in the select list
pub const TRANSIENT_COLUMN_PREFIX: &str = "_transient_";

/// Prefix of sort terms selected by a DISTINCT read
const SORT_COLUMN_PREFIX: &str = "_sort_";

/// Where a read runs: the application schema and the database scope
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// PostgreSQL schema of the application
    pub schema_name: &'a str,
    /// Public, private or union
    pub database_type: DatabaseType,
    /// `_database_id` of the scope
    pub database_id: &'a str,
    /// Record type mirroring `_user`
    pub user_record_type: &'a str,
}

impl Scope<'_> {
    /// `_database_id` condition, none for the union scope
    fn database_filter(&self, table: &str) -> Option<Fragment> {
        match self.database_type {
            DatabaseType::Union => None,
            DatabaseType::Public | DatabaseType::Private => Some(Fragment::with_args(
                format!("{} = ?", full_quote(table, "_database_id")),
                vec![SqlValue::Text(self.database_id.to_string())],
            )),
        }
    }

    /// Access clause unless bypassed; only the public scope is restricted
    fn access_filter(&self, table: &str, options: &AccessControlOptions) -> Result<Option<Fragment>> {
        if self.database_type != DatabaseType::Public || options.bypass_access_control {
            return Ok(None);
        }
        access_clause(table, options.view_as_user.as_ref(), AclLevel::Read).map(Some)
    }
}

/// A runnable SELECT and the types of the columns it returns
#[derive(Debug, Clone)]
pub struct SelectPlan {
    /// The statement
    pub statement: Statement,
    /// Column name to type, for decoding rows
    pub typemap: RecordSchema,
}

#[derive(Debug)]
struct Join {
    alias: String,
    table: String,
    on: String,
}

/// Assembles a SELECT over one primary table
#[derive(Debug)]
pub struct SelectBuilder<'a> {
    scope: Scope<'a>,
    table: String,
    columns: Vec<(String, Fragment)>,
    joins: Vec<Join>,
    conditions: Vec<Fragment>,
    orders: Vec<(Fragment, Order)>,
    distinct: bool,
    limit: Option<u64>,
    offset: u64,
}

impl<'a> SelectBuilder<'a> {
    /// SELECT from `table` in `scope`
    pub fn new(scope: Scope<'a>, table: impl Into<String>) -> Self {
        Self {
            scope,
            table: table.into(),
            columns: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            orders: Vec::new(),
            distinct: false,
            limit: None,
            offset: 0,
        }
    }

    /// Select every column of `typemap`, computed ones through their expression
    pub fn columns(&mut self, typemap: &RecordSchema) -> Result<&mut Self> {
        for (name, field_type) in typemap.iter() {
            let expression = field_type
                .expression
                .clone()
                .unwrap_or_else(|| Expression::key_path(name.as_str()));
            let operand = ExpressionSql::new(Some(&self.table), field_type.clone(), expression);
            self.columns
                .push((name.clone(), operand.to_fragment(Context::Select)?));
        }
        Ok(self)
    }

    /// Select a single expression
    pub fn column(&mut self, name: &str, fragment: Fragment) -> &mut Self {
        self.columns.push((name.to_string(), fragment));
        self
    }

    /// Add a condition, ANDed with the rest
    pub fn condition(&mut self, fragment: Fragment) -> &mut Self {
        self.conditions.push(fragment.wrap("(", ")"));
        self
    }

    /// Restrict to the scope's `_database_id`
    pub fn scoped(&mut self) -> &mut Self {
        if let Some(filter) = self.scope.database_filter(&self.table) {
            self.condition(filter);
        }
        self
    }

    /// Apply the access clause when the scope requires one
    pub fn access(&mut self, options: &AccessControlOptions) -> Result<&mut Self> {
        if let Some(filter) = self.scope.access_filter(&self.table, options)? {
            self.condition(filter);
        }
        Ok(self)
    }

    /// Take the joins a compiled predicate needs; joined reads are DISTINCT
    pub fn joins_from(&mut self, compiler: &PredicateCompiler<'_>) -> &mut Self {
        for (alias, join) in compiler.joins() {
            self.joins.push(Join {
                on: compiler.join_condition(&alias, join),
                alias,
                table: join.table.clone(),
            });
        }
        self.distinct = compiler.has_joins();
        self
    }

    /// Order by an expression
    pub fn order(&mut self, expr: Fragment, order: Order) -> &mut Self {
        self.orders.push((expr, order));
        self
    }

    /// Page the result
    pub fn page(&mut self, limit: Option<u64>, offset: u64) -> &mut Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Render and number the statement.
    ///
    /// Arguments are collected in the order their fragments appear in the
    /// rendered text: select list, conditions, then ordering. A DISTINCT
    /// read selects each sort term as `_sort_<n>` and orders by that name.
    pub fn build(mut self) -> Result<Statement> {
        let mut stmt = sea_query::Query::select();
        let mut args = Vec::new();

        let mut orders = Vec::with_capacity(self.orders.len());
        for (i, (expr, order)) in std::mem::take(&mut self.orders).into_iter().enumerate() {
            if self.distinct {
                let name = format!("{}{}", SORT_COLUMN_PREFIX, i);
                orders.push((Fragment::raw(quote_ident(&name)), order));
                self.columns.push((name, expr));
            } else {
                orders.push((expr, order));
            }
        }

        for (name, fragment) in self.columns {
            stmt.expr_as(Expr::cust(fragment.sql), Alias::new(name));
            args.extend(fragment.args);
        }
        stmt.from(table_ref(self.scope.schema_name, &self.table));
        for join in self.joins {
            stmt.join_as(
                JoinType::LeftJoin,
                table_ref(self.scope.schema_name, &join.table),
                Alias::new(join.alias),
                Expr::cust(join.on),
            );
        }
        for condition in self.conditions {
            stmt.and_where(Expr::cust(condition.sql));
            args.extend(condition.args);
        }
        if self.distinct {
            stmt.distinct();
        }
        for (expr, order) in orders {
            stmt.order_by_expr(Expr::cust(expr.sql), order);
            args.extend(expr.args);
        }
        if let Some(limit) = self.limit {
            stmt.limit(limit);
        }
        if self.offset > 0 {
            stmt.offset(self.offset);
        }

        Statement::number(&stmt.to_string(PostgresQueryBuilder), args)
    }
}

/// Keep only `desired` user columns; meta columns always stay
pub fn whitelisted(schema: &RecordSchema, desired: &[String]) -> Result<RecordSchema> {
    let mut out = RecordSchema::new();
    for key in desired {
        let field_type = schema
            .get(key)
            .ok_or_else(|| Error::query_invalid(format!("unexpected key \"{}\"", key)))?;
        out.insert(key.clone(), field_type.clone());
    }
    for (key, field_type) in schema.iter().filter(|(k, _)| k.starts_with('_')) {
        out.insert(key.clone(), field_type.clone());
    }
    Ok(out)
}

/// Type map of a query: whitelist, computed keys and the window count
pub fn query_typemap(query: &Query, schema: &RecordSchema) -> Result<RecordSchema> {
    let mut typemap = match &query.desired_keys {
        Some(keys) => whitelisted(schema, keys)?,
        None => schema.clone(),
    };

    for (key, expression) in &query.computed_keys {
        let field_type = match expression {
            Expression::KeyPath(_) => continue,
            Expression::Function(func) => {
                if let Func::Distance { field, location } = func {
                    check_distance(schema, field, location)?;
                }
                func_field_type(func)
            }
            Expression::Literal(value) => literal_field_type(value)?,
        };
        typemap.insert(
            format!("{}{}", TRANSIENT_COLUMN_PREFIX, key),
            FieldType {
                expression: Some(expression.clone()),
                ..field_type
            },
        );
    }

    if query.get_count {
        typemap.insert(
            RECORD_COUNT_COLUMN,
            FieldType::computed(
                DataType::Integer,
                Expression::Function(Func::Count {
                    overall_records: true,
                }),
            ),
        );
    }
    Ok(typemap)
}

/// SELECT for a query.
///
/// `schemas` must hold the primary record type and every type a two
/// component key path of the predicate points at.
pub fn select_query(
    scope: Scope<'_>,
    query: &Query,
    schemas: &HashMap<String, RecordSchema>,
) -> Result<SelectPlan> {
    let table = query.record_type.as_str();
    let mut compiler = PredicateCompiler::new(table, schemas, scope.user_record_type);
    let schema = compiler.primary_schema()?;

    let mut builder = SelectBuilder::new(scope, table);
    builder.scoped();
    if let Some(predicate) = &query.predicate {
        builder.condition(compiler.compile(predicate)?);
        builder.joins_from(&compiler);
    }
    builder.access(&query.into())?;

    for sort in &query.sorts {
        let (expr, order) = order_by(table, schema, sort)?;
        builder.order(expr, order);
    }
    builder.page(query.limit, query.offset);

    let mut typemap = query_typemap(query, schema)?;
    for (name, field_type) in compiler.extra_columns() {
        typemap.insert(name.clone(), field_type.clone());
    }
    builder.columns(&typemap)?;

    Ok(SelectPlan {
        statement: builder.build()?,
        typemap,
    })
}

/// `SELECT COUNT(*)` for a query; counts distinct ids when joined
pub fn count_query(
    scope: Scope<'_>,
    query: &Query,
    schemas: &HashMap<String, RecordSchema>,
) -> Result<Statement> {
    let table = query.record_type.as_str();
    let mut compiler = PredicateCompiler::new(table, schemas, scope.user_record_type);
    compiler.primary_schema()?;

    let mut builder = SelectBuilder::new(scope, table);
    builder.scoped();
    if let Some(predicate) = &query.predicate {
        builder.condition(compiler.compile(predicate)?);
        builder.joins_from(&compiler);
    }
    builder.access(&query.into())?;

    let count = if compiler.has_joins() {
        format!("COUNT(DISTINCT {})", full_quote(table, "_id"))
    } else {
        "COUNT(*)".to_string()
    };
    builder.distinct = false;
    builder.column(RECORD_COUNT_COLUMN, Fragment::raw(count));
    builder.build()
}

/// SELECT of records of one type by key
pub fn select_by_keys(
    scope: Scope<'_>,
    record_type: &str,
    schema: &RecordSchema,
    keys: &[String],
    options: &AccessControlOptions,
) -> Result<SelectPlan> {
    if keys.is_empty() {
        return Err(Error::invalid_argument("at least one record id is required"));
    }

    let mut builder = SelectBuilder::new(scope, record_type);
    builder.scoped();
    let mut ids = Fragment::raw(format!("{} IN ", full_quote(record_type, "_id")));
    ids.push(text_list(keys));
    builder.condition(ids);
    builder.access(options)?;
    builder.columns(schema)?;

    Ok(SelectPlan {
        statement: builder.build()?,
        typemap: schema.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordb_core::acl::UserInfo;
    use recordb_core::query::{Operator, Predicate, Sort, SortOrder};
    use serde_json::json;

    fn scope(database_type: DatabaseType) -> Scope<'static> {
        Scope {
            schema_name: "app_demo",
            database_type,
            database_id: "",
            user_record_type: "user",
        }
    }

    fn schemas() -> HashMap<String, RecordSchema> {
        let note = RecordSchema::new()
            .with_field("_id", FieldType::new(DataType::String))
            .with_field("_database_id", FieldType::new(DataType::String))
            .with_field("_owner_id", FieldType::new(DataType::String))
            .with_field("_access", FieldType::new(DataType::Acl))
            .with_field("title", FieldType::new(DataType::String))
            .with_field("order", FieldType::new(DataType::Number))
            .with_field("location", FieldType::new(DataType::Location))
            .with_field("city", FieldType::reference("city"));
        let city = RecordSchema::new()
            .with_field("_id", FieldType::new(DataType::String))
            .with_field("name", FieldType::new(DataType::String));
        HashMap::from([("note".to_string(), note), ("city".to_string(), city)])
    }

    #[test]
    fn test_select_query_union_scope() {
        let q = Query::new("note")
            .with_predicate(Predicate::equal(
                Expression::key_path("title"),
                Expression::literal("hi"),
            ))
            .with_sort(Sort::desc("order"))
            .with_limit(10)
            .with_offset(5);
        let plan = select_query(scope(DatabaseType::Union), &q, &schemas()).unwrap();
        let sql = &plan.statement.sql;

        assert!(sql.starts_with("SELECT "));
        assert!(sql.contains("\"note\".\"title\" AS \"title\""));
        assert!(sql.contains("ST_AsGeoJSON(\"note\".\"location\") AS \"location\""));
        assert!(sql.contains("FROM \"app_demo\".\"note\""));
        assert!(sql.contains("WHERE "));
        assert!(sql.contains("(\"note\".\"title\" = $1::text)"));
        assert!(sql.contains("ORDER BY \"note\".\"order\" DESC"));
        assert!(sql.contains("LIMIT 10"));
        assert!(sql.contains("OFFSET 5"));
        assert!(!sql.contains("_database_id\" ="));
        assert_eq!(plan.statement.args, vec![SqlValue::from("hi")]);
    }

    #[test]
    fn test_select_query_public_scope_adds_access() {
        let q = Query::new("note").with_view_as_user(UserInfo::new("alice"));
        let plan = select_query(scope(DatabaseType::Public), &q, &schemas()).unwrap();
        let sql = &plan.statement.sql;
        assert!(sql.contains("(\"note\".\"_database_id\" = $1::text)"));
        assert!(sql.contains("\"note\".\"_access\" @> $2::jsonb"));
        assert!(sql.contains("\"note\".\"_owner_id\" = $3::text"));
        assert_eq!(plan.statement.args.len(), 4);

        let mut bypass = q.clone();
        bypass.bypass_access_control = true;
        let plan = select_query(scope(DatabaseType::Public), &bypass, &schemas()).unwrap();
        assert!(!plan.statement.sql.contains("_access\" @>"));
    }

    #[test]
    fn test_private_scope_skips_access() {
        let q = Query::new("note");
        let private = Scope {
            database_id: "alice",
            ..scope(DatabaseType::Private)
        };
        let plan = select_query(private, &q, &schemas()).unwrap();
        assert!(!plan.statement.sql.contains("_access\" @>"));
        assert_eq!(plan.statement.args, vec![SqlValue::from("alice")]);
    }

    #[test]
    fn test_joined_query_is_distinct() {
        let q = Query::new("note").with_predicate(Predicate::equal(
            Expression::key_path("city.name"),
            Expression::literal("HK"),
        ));
        let plan = select_query(scope(DatabaseType::Union), &q, &schemas()).unwrap();
        let sql = &plan.statement.sql;
        assert!(sql.starts_with("SELECT DISTINCT "));
        assert!(sql.contains("LEFT JOIN \"app_demo\".\"city\" AS \"_t0\" ON "));
        assert!(sql.contains("\"note\".\"city\" = \"_t0\".\"_id\""));
    }

    #[test]
    fn test_distinct_read_selects_sort_terms() {
        let q = Query::new("note")
            .with_predicate(Predicate::equal(
                Expression::key_path("city.name"),
                Expression::literal("HK"),
            ))
            .with_sort(Sort {
                expression: Expression::Function(Func::Distance {
                    field: "location".into(),
                    location: recordb_core::value::Location::new(1.0, 2.0),
                }),
                order: SortOrder::Asc,
            })
            .with_sort(Sort::desc("order"));
        let plan = select_query(scope(DatabaseType::Union), &q, &schemas()).unwrap();
        let sql = &plan.statement.sql;
        assert!(sql.starts_with("SELECT DISTINCT "));
        assert!(sql.contains(
            "ST_DistanceSphere(\"note\".\"location\", ST_MakePoint($1::double precision, $2::double precision)) AS \"_sort_0\""
        ));
        assert!(sql.contains("\"note\".\"order\" AS \"_sort_1\""));
        assert!(sql.ends_with("ORDER BY \"_sort_0\" ASC, \"_sort_1\" DESC"));
        assert_eq!(
            plan.statement.args,
            vec![
                SqlValue::Float(1.0),
                SqlValue::Float(2.0),
                SqlValue::from("HK"),
            ]
        );
        assert!(!plan.typemap.contains("_sort_0"));
    }

    #[test]
    fn test_distance_sort_binds_location() {
        let q = Query::new("note").with_sort(Sort {
            expression: Expression::Function(Func::Distance {
                field: "location".into(),
                location: recordb_core::value::Location::new(1.5, f64::NAN),
            }),
            order: SortOrder::Asc,
        });
        assert!(matches!(
            select_query(scope(DatabaseType::Union), &q, &schemas()),
            Err(Error::RecordQueryInvalid { .. })
        ));

        let q = Query::new("note").with_sort(Sort {
            expression: Expression::Function(Func::Distance {
                field: "location".into(),
                location: recordb_core::value::Location::new(1.5, 2.5),
            }),
            order: SortOrder::Desc,
        });
        let plan = select_query(scope(DatabaseType::Union), &q, &schemas()).unwrap();
        assert!(plan.statement.sql.ends_with(
            "ORDER BY ST_DistanceSphere(\"note\".\"location\", ST_MakePoint($1::double precision, $2::double precision)) DESC"
        ));
        assert_eq!(
            plan.statement.args,
            vec![SqlValue::Float(1.5), SqlValue::Float(2.5)]
        );
    }

    #[test]
    fn test_typemap_whitelist_and_computed() {
        let mut q = Query::new("note");
        q.desired_keys = Some(vec!["title".into()]);
        q.computed_keys.insert(
            "distance".into(),
            Expression::Function(Func::Distance {
                field: "location".into(),
                location: recordb_core::value::Location::new(1.0, 2.0),
            }),
        );
        q.computed_keys.insert("alias".into(), Expression::key_path("title"));
        q.get_count = true;

        let typemap = query_typemap(&q, &schemas()["note"]).unwrap();
        assert!(typemap.contains("title"));
        assert!(!typemap.contains("order"));
        assert!(typemap.contains("_owner_id"));
        assert!(!typemap.contains("_transient_alias"));
        assert_eq!(
            typemap.get("_transient_distance").unwrap().data_type,
            DataType::Number
        );
        assert_eq!(
            typemap.get(RECORD_COUNT_COLUMN).unwrap().data_type,
            DataType::Integer
        );

        q.desired_keys = Some(vec!["nope".into()]);
        assert!(matches!(
            query_typemap(&q, &schemas()["note"]),
            Err(Error::RecordQueryInvalid { .. })
        ));
    }

    #[test]
    fn test_count_query() {
        let q = Query::new("note").with_predicate(Predicate::compare(
            Operator::In,
            Expression::key_path("title"),
            Expression::Literal(recordb_core::value::Value::Json(json!(["a"]))),
        ));
        let stmt = count_query(scope(DatabaseType::Union), &q, &schemas()).unwrap();
        assert!(stmt.sql.starts_with("SELECT COUNT(*) AS \"_record_count\""));

        let joined = Query::new("note").with_predicate(Predicate::equal(
            Expression::key_path("city.name"),
            Expression::literal("HK"),
        ));
        let stmt = count_query(scope(DatabaseType::Union), &joined, &schemas()).unwrap();
        assert!(stmt
            .sql
            .starts_with("SELECT COUNT(DISTINCT \"note\".\"_id\") AS \"_record_count\""));
    }

    #[test]
    fn test_select_by_keys() {
        let schema = schemas()["note"].clone();
        let plan = select_by_keys(
            scope(DatabaseType::Public),
            "note",
            &schema,
            &["a".to_string(), "b".to_string()],
            &AccessControlOptions::bypass(),
        )
        .unwrap();
        assert!(plan
            .statement
            .sql
            .contains("(\"note\".\"_id\" IN ($2::text, $3::text))"));
        assert!(select_by_keys(
            scope(DatabaseType::Public),
            "note",
            &schema,
            &[],
            &AccessControlOptions::bypass()
        )
        .is_err());
    }
}
