//! Predicate compilation
//!
//! A [`PredicateCompiler`] turns a predicate tree into a `WHERE` fragment
//! for one primary table. While compiling it collects the left joins that
//! key paths and user functions need, and any extra columns they add to
//! the select list.
//!
//! Schemas are looked up in a prefetched map; [`required_record_types`]
//! lists which record types must be fetched before compiling.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use recordb_core::error::{Error, Result};
use recordb_core::query::{Expression, Func, Operator, Predicate, RelationDirection};
use recordb_core::schema::{DataType, FieldType, RecordSchema};
use recordb_core::value::Value;

use super::expression::{
    check_distance, func_field_type, literal_field_type, make_point, Context, ExpressionSql,
};
use super::{full_quote, quote_ident, Fragment};

/// Key paths may follow at most one reference
pub const MAX_KEY_PATH_COMPONENTS: usize = 2;

/// Fields a user discover predicate matches on
const DISCOVERY_FIELDS: [&str; 2] = ["username", "email"];

/// A left join from the primary table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Joined table
    pub table: String,
    /// Column of the primary table
    pub primary_column: String,
    /// Column of the joined table
    pub secondary_column: String,
}

impl Join {
    fn new(table: &str, primary_column: &str, secondary_column: &str) -> Self {
        Self {
            table: table.to_string(),
            primary_column: primary_column.to_string(),
            secondary_column: secondary_column.to_string(),
        }
    }
}

/// Alias of the `index`th joined table; the user table keeps its name
pub fn join_alias(table: &str, index: usize) -> String {
    if table == "_user" {
        "_user".to_string()
    } else {
        format!("_t{}", index)
    }
}

/// Compiles predicates over one primary table
#[derive(Debug)]
pub struct PredicateCompiler<'a> {
    primary_table: String,
    schemas: &'a HashMap<String, RecordSchema>,
    user_record_type: String,
    joins: Vec<Join>,
    extra_columns: BTreeMap<String, FieldType>,
}

impl<'a> PredicateCompiler<'a> {
    /// Compiler for `primary_table` using prefetched `schemas`
    pub fn new(
        primary_table: impl Into<String>,
        schemas: &'a HashMap<String, RecordSchema>,
        user_record_type: impl Into<String>,
    ) -> Self {
        Self {
            primary_table: primary_table.into(),
            schemas,
            user_record_type: user_record_type.into(),
            joins: Vec::new(),
            extra_columns: BTreeMap::new(),
        }
    }

    /// The primary table (also its alias)
    pub fn primary_table(&self) -> &str {
        &self.primary_table
    }

    /// Joins collected so far, in alias order
    pub fn joins(&self) -> impl Iterator<Item = (String, &Join)> {
        self.joins
            .iter()
            .enumerate()
            .map(|(i, j)| (join_alias(&j.table, i), j))
    }

    /// Whether any join was added
    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// Columns added to the select list by compiled predicates
    pub fn extra_columns(&self) -> &BTreeMap<String, FieldType> {
        &self.extra_columns
    }

    /// Schema of the primary table
    pub fn primary_schema(&self) -> Result<&'a RecordSchema> {
        self.schema_of(&self.primary_table)
    }

    fn schema_of(&self, record_type: &str) -> Result<&'a RecordSchema> {
        self.schemas.get(record_type).ok_or_else(|| {
            Error::query_invalid(format!("record type \"{}\" does not exist", record_type))
        })
    }

    /// Compile a predicate into a condition
    pub fn compile(&mut self, predicate: &Predicate) -> Result<Fragment> {
        if predicate.operator == Operator::Functional {
            return self.compile_functional(predicate);
        }
        if predicate.operator.is_compound() {
            return self.compile_compound(predicate);
        }
        self.compile_comparison(predicate)
    }

    fn compile_compound(&mut self, predicate: &Predicate) -> Result<Fragment> {
        let children = predicate.child_predicates()?;
        let sep = match predicate.operator {
            Operator::And => " AND ",
            Operator::Or => " OR ",
            Operator::Not => {
                let child = children
                    .first()
                    .ok_or_else(|| Error::query_invalid("Not predicate requires a child"))?;
                return Ok(self.compile(child)?.wrap("NOT (", ")"));
            }
            other => {
                return Err(Error::unsupported_operator(
                    other,
                    format!("compound operator `{}` is not supported", other),
                ))
            }
        };
        if children.is_empty() {
            return Err(Error::query_invalid(format!(
                "{} predicate requires at least one child",
                predicate.operator
            )));
        }

        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            parts.push(self.compile(child)?.wrap("(", ")"));
        }
        Ok(Fragment::join(parts, sep))
    }

    fn compile_functional(&mut self, predicate: &Predicate) -> Result<Fragment> {
        match predicate.function()? {
            Func::UserRelation {
                key_path,
                relation_name,
                relation_direction,
                user,
            } => Ok(self.user_relation(key_path, relation_name, *relation_direction, user)),
            Func::UserDiscover { usernames, emails } => self.user_discover(usernames, emails),
            other => Err(Error::not_supported(format!(
                "function {} cannot be used as a predicate",
                other.name()
            ))),
        }
    }

    fn user_relation(
        &mut self,
        key_path: &str,
        relation: &str,
        direction: RelationDirection,
        user: &str,
    ) -> Fragment {
        let primary_column = match key_path {
            "" | "_owner" => "_owner_id",
            other => other,
        };

        let sql = match direction {
            RelationDirection::Outward => {
                let out = self.left_join(relation, primary_column, "right_id");
                format!("{} = ?", full_quote(&out, "left_id"))
            }
            RelationDirection::Inward => {
                let inw = self.left_join(relation, primary_column, "left_id");
                format!("{} = ?", full_quote(&inw, "right_id"))
            }
            RelationDirection::Mutual => {
                let out = self.left_join(relation, primary_column, "right_id");
                let inw = self.left_join(relation, primary_column, "left_id");
                format!(
                    "{} = {} AND {} = ?",
                    full_quote(&out, "left_id"),
                    full_quote(&inw, "right_id"),
                    full_quote(&out, "left_id")
                )
            }
        };
        Fragment::with_args(sql, vec![user.into()])
    }

    fn user_discover(&mut self, usernames: &[String], emails: &[String]) -> Result<Fragment> {
        if self.primary_table != self.user_record_type {
            return Err(Error::query_invalid(
                "user discover predicate can only be used on user record",
            ));
        }

        let mut alias = None;
        let mut parts = Vec::new();
        for (field, values) in DISCOVERY_FIELDS.iter().zip([usernames, emails]) {
            if values.is_empty() {
                continue;
            }
            let alias = alias
                .get_or_insert_with(|| self.left_join("_user", "_id", "id"))
                .clone();
            let mut f = Fragment::raw(full_quote(&alias, field));
            f.push_str(" IN ").push(super::text_list(values));
            parts.push(f);
        }

        if parts.is_empty() {
            return Ok(Fragment::raw("FALSE"));
        }

        for field in DISCOVERY_FIELDS {
            self.extra_columns.insert(
                format!("_transient__{}", field),
                FieldType::computed(
                    DataType::String,
                    Expression::Function(Func::UserData {
                        data_name: field.to_string(),
                    }),
                ),
            );
        }
        Ok(Fragment::join(parts, " OR "))
    }

    fn compile_comparison(&mut self, predicate: &Predicate) -> Result<Fragment> {
        let exprs = predicate.child_expressions()?;
        let [lhs, rhs] = exprs.as_slice() else {
            return Err(Error::query_invalid(format!(
                "{} predicate requires exactly two children",
                predicate.operator
            )));
        };

        if let Some(fragment) = self.try_distance(predicate.operator, lhs, rhs)? {
            return Ok(fragment);
        }

        let lhs = self.expression(lhs)?;
        let rhs = self.expression(rhs)?;
        if predicate.operator == Operator::In {
            return contains(&lhs, &rhs);
        }
        compare(predicate.operator, lhs, rhs)
    }

    /// `distance(field, point) < v` becomes an index-friendly `ST_DWithin`.
    ///
    /// The function may be on either side; `v < distance(..)` and
    /// `distance(..) > v` are the negation.
    fn try_distance(
        &mut self,
        operator: Operator,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<Option<Fragment>> {
        let (func, value, negate) = match (operator, lhs, rhs) {
            (Operator::LessThan, Expression::Function(f @ Func::Distance { .. }), v) => (f, v, false),
            (Operator::GreaterThan, v, Expression::Function(f @ Func::Distance { .. })) => {
                (f, v, false)
            }
            (Operator::GreaterThan, Expression::Function(f @ Func::Distance { .. }), v) => {
                (f, v, true)
            }
            (Operator::LessThan, v, Expression::Function(f @ Func::Distance { .. })) => (f, v, true),
            _ => return Ok(None),
        };
        let Func::Distance { field, location } = func else {
            return Ok(None);
        };
        if matches!(value, Expression::Function(Func::Distance { .. })) {
            return Ok(None);
        }
        check_distance(self.primary_schema()?, field, location)?;

        let distance = self.expression(value)?.to_fragment(Context::Where)?;
        let mut f = Fragment::raw(format!(
            "ST_DWithin({}::geography, ",
            full_quote(&self.primary_table, field)
        ));
        f.push(make_point(location))
            .push_str("::geography, ")
            .push(distance)
            .push_str(")");
        if negate {
            f = f.wrap("NOT ", "");
        }
        Ok(Some(f))
    }

    /// Resolve an operand against the primary table and its joins
    pub fn expression(&mut self, expr: &Expression) -> Result<ExpressionSql> {
        match expr {
            Expression::KeyPath(_) => self.key_path(expr),
            Expression::Function(func) => {
                if let Func::Distance { field, location } = func {
                    check_distance(self.primary_schema()?, field, location)?;
                }
                Ok(ExpressionSql::new(
                    Some(&self.primary_table),
                    func_field_type(func),
                    expr.clone(),
                ))
            }
            Expression::Literal(value) => Ok(ExpressionSql::new(
                None,
                literal_field_type(value)?,
                expr.clone(),
            )),
        }
    }

    fn key_path(&mut self, expr: &Expression) -> Result<ExpressionSql> {
        let Expression::KeyPath(path) = expr else {
            return Err(Error::internal("expression is not a key path"));
        };
        let components = expr.key_path_components().unwrap_or_default();
        if components.len() > MAX_KEY_PATH_COMPONENTS {
            return Err(Error::query_invalid(format!(
                "keypath \"{}\" with more than 2 components is not supported",
                path
            )));
        }

        let mut alias = self.primary_table.clone();
        let mut record_type = self.primary_table.clone();
        let last = components.len().saturating_sub(1);
        for (i, component) in components.iter().enumerate() {
            let schema = self.schema_of(&record_type)?;
            let field = schema.get(component).ok_or_else(|| {
                Error::query_invalid(format!("keypath \"{}\" does not exist", path))
            })?;

            if i == last {
                return Ok(ExpressionSql::new(Some(&alias), field.clone(), expr.clone()));
            }
            if field.data_type != DataType::Reference {
                return Err(Error::query_invalid(format!(
                    "field \"{}\" in keypath \"{}\" is not a reference",
                    component, path
                )));
            }
            alias = self.left_join(&field.reference_type, component, "_id");
            record_type = field.reference_type.clone();
        }
        Err(Error::query_invalid(format!("keypath \"{}\" is empty", path)))
    }

    /// Add a join unless an identical one exists; returns its alias
    fn left_join(&mut self, table: &str, primary_column: &str, secondary_column: &str) -> String {
        let join = Join::new(table, primary_column, secondary_column);
        let index = match self.joins.iter().position(|j| *j == join) {
            Some(i) => i,
            None => {
                self.joins.push(join);
                self.joins.len() - 1
            }
        };
        join_alias(table, index)
    }

    /// `ON` condition of a join
    pub fn join_condition(&self, alias: &str, join: &Join) -> String {
        format!(
            "{} = {}",
            full_quote(&self.primary_table, &join.primary_column),
            full_quote(alias, &join.secondary_column)
        )
    }
}

fn contains(lhs: &ExpressionSql, rhs: &ExpressionSql) -> Result<Fragment> {
    let lhs_geo = lhs.field_type.data_type.is_geometry_compatible();
    let rhs_geo = rhs.field_type.data_type.is_geometry_compatible();
    if lhs_geo && rhs_geo {
        let mut f = Fragment::raw("ST_Contains(");
        f.push(rhs.to_fragment(Context::Where)?)
            .push_str(", ")
            .push(lhs.to_fragment(Context::Where)?)
            .push_str(")");
        return Ok(f);
    }

    match (&lhs.expression, &rhs.expression) {
        (Expression::Literal(_), Expression::KeyPath(_)) => {
            let mut f = Fragment::raw("jsonb_exists(");
            f.push(rhs.to_fragment(Context::Where)?)
                .push_str(", ")
                .push(lhs.to_fragment(Context::Where)?)
                .push_str(")");
            Ok(f)
        }
        (Expression::KeyPath(_), Expression::Literal(Value::Json(serde_json::Value::Array(_)))) => {
            let mut f = lhs.to_fragment(Context::Where)?;
            f.push_str(" IN ").push(rhs.to_fragment(Context::Where)?);
            Ok(f)
        }
        _ => Err(Error::unsupported_operator(
            Operator::In,
            "In requires a key path and a list literal, or two geometries",
        )),
    }
}

fn compare(operator: Operator, mut lhs: ExpressionSql, mut rhs: ExpressionSql) -> Result<Fragment> {
    if operator.is_commutative() && lhs.is_null() && !rhs.is_null() {
        std::mem::swap(&mut lhs, &mut rhs);
    }

    let op = if rhs.is_null() {
        match operator {
            Operator::Equal => " IS ",
            Operator::NotEqual => " IS NOT ",
            other => sql_operator(other)?,
        }
    } else {
        sql_operator(operator)?
    };

    let mut f = lhs.to_fragment(Context::Where)?;
    f.push_str(op).push(rhs.to_fragment(Context::Where)?);
    Ok(f)
}

fn sql_operator(operator: Operator) -> Result<&'static str> {
    let op = match operator {
        Operator::Equal => " = ",
        Operator::GreaterThan => " > ",
        Operator::LessThan => " < ",
        Operator::GreaterThanOrEqual => " >= ",
        Operator::LessThanOrEqual => " <= ",
        Operator::NotEqual => " <> ",
        Operator::Like => " LIKE ",
        Operator::ILike => " ILIKE ",
        other => {
            return Err(Error::unsupported_operator(
                other,
                format!("comparison operator `{}` is not supported", other),
            ))
        }
    };
    Ok(op)
}

/// Record types whose schemas compiling `predicate` over `primary` reads.
///
/// Unknown primary columns are ignored here; the compiler reports them.
pub fn required_record_types(
    primary: &str,
    primary_schema: &RecordSchema,
    predicate: Option<&Predicate>,
) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    types.insert(primary.to_string());
    if let Some(predicate) = predicate {
        collect_referenced_types(primary_schema, predicate, &mut types);
    }
    types
}

fn collect_referenced_types(
    schema: &RecordSchema,
    predicate: &Predicate,
    types: &mut BTreeSet<String>,
) {
    for child in &predicate.children {
        match child {
            recordb_core::query::PredicateChild::Predicate(p) => {
                collect_referenced_types(schema, p, types)
            }
            recordb_core::query::PredicateChild::Expression(e) => {
                if let Some(components) = e.key_path_components() {
                    if components.len() == MAX_KEY_PATH_COMPONENTS {
                        if let Some(field) = schema.get(components[0]) {
                            if field.data_type == DataType::Reference {
                                types.insert(field.reference_type.clone());
                            }
                        }
                    }
                }
            }
        }
    }
}

/// `"table" AS "alias"` text for a joined table
pub fn aliased(table_sql: &str, alias: &str) -> String {
    format!("{} AS {}", table_sql, quote_ident(alias))
}
