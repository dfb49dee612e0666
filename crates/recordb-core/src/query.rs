//! Predicate and query model
//!
//! A [`Predicate`] is an operator applied to children. Compound operators
//! (`And`, `Or`, `Not`) take predicates; every other operator takes
//! [`Expression`]s. Shapes are checked by [`Predicate::validate`] before
//! anything is compiled or evaluated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::acl::UserInfo;
use crate::error::{Error, Result};
use crate::value::{Location, Value};

/// Predicate operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// All children hold
    And,
    /// Any child holds
    Or,
    /// The single child does not hold
    Not,
    /// `=`
    Equal,
    /// `>`
    GreaterThan,
    /// `<`
    LessThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `<=`
    LessThanOrEqual,
    /// `<>`
    NotEqual,
    /// `LIKE`
    Like,
    /// `ILIKE`
    ILike,
    /// Membership
    In,
    /// Truth value computed by a function
    Functional,
}

impl Operator {
    /// `And`, `Or` or `Not`
    #[inline]
    pub const fn is_compound(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Not)
    }

    /// Operators taking exactly two expressions
    #[inline]
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::GreaterThan
                | Self::LessThan
                | Self::GreaterThanOrEqual
                | Self::LessThanOrEqual
                | Self::NotEqual
                | Self::Like
                | Self::ILike
                | Self::In
        )
    }

    /// Whether operand order does not matter
    #[inline]
    pub const fn is_commutative(self) -> bool {
        matches!(self, Self::Equal | Self::NotEqual)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Direction of a user relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationDirection {
    /// Users the key path user points at
    #[default]
    Outward,
    /// Users pointing at the key path user
    Inward,
    /// Both directions
    Mutual,
}

/// Function used inside expressions and functional predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Func {
    /// Spherical distance from a location field to a point (metres)
    Distance {
        /// Location column
        field: String,
        /// Reference point
        location: Location,
    },
    /// Row count
    Count {
        /// Count over the whole result set (window) instead of a group
        overall_records: bool,
    },
    /// Relation between the key path user and `user`
    UserRelation {
        /// Column holding the user id, defaults to `_owner_id`
        #[serde(default)]
        key_path: String,
        /// Relation table, `_friend` or `_follow`
        relation_name: String,
        /// Direction of the relation
        #[serde(default)]
        relation_direction: RelationDirection,
        /// The other user
        user: String,
    },
    /// Discover users by username or email
    UserDiscover {
        /// Usernames to match
        #[serde(default)]
        usernames: Vec<String>,
        /// Emails to match
        #[serde(default)]
        emails: Vec<String>,
    },
    /// A column of the joined user table
    UserData {
        /// Column name
        data_name: String,
    },
}

impl Func {
    /// Short name of the function kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Distance { .. } => "distance",
            Self::Count { .. } => "count",
            Self::UserRelation { .. } => "user_relation",
            Self::UserDiscover { .. } => "user_discover",
            Self::UserData { .. } => "user_data",
        }
    }
}

/// Operand of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    /// Constant value
    Literal(Value),
    /// Field reference, optionally one reference hop (`city.name`)
    KeyPath(String),
    /// Function call
    Function(Func),
}

impl Expression {
    /// Literal expression
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Key path expression
    pub fn key_path(path: impl Into<String>) -> Self {
        Self::KeyPath(path.into())
    }

    /// Whether this is a literal
    #[inline]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Whether this is a key path
    #[inline]
    pub fn is_key_path(&self) -> bool {
        matches!(self, Self::KeyPath(_))
    }

    /// Whether this is a literal null
    #[inline]
    pub fn is_literal_null(&self) -> bool {
        matches!(self, Self::Literal(Value::Null))
    }

    /// Components of a key path
    pub fn key_path_components(&self) -> Option<Vec<&str>> {
        match self {
            Self::KeyPath(path) => Some(path.split('.').collect()),
            _ => None,
        }
    }
}

/// Child of a predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateChild {
    /// Nested predicate (compound operators)
    Predicate(Predicate),
    /// Operand (all other operators)
    Expression(Expression),
}

impl From<Predicate> for PredicateChild {
    fn from(p: Predicate) -> Self {
        Self::Predicate(p)
    }
}

impl From<Expression> for PredicateChild {
    fn from(e: Expression) -> Self {
        Self::Expression(e)
    }
}

/// Boolean expression tree over record fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Operator
    pub operator: Operator,
    /// Operands
    #[serde(default)]
    pub children: Vec<PredicateChild>,
}

impl Predicate {
    /// Predicate from parts
    pub fn new(operator: Operator, children: Vec<PredicateChild>) -> Self {
        Self { operator, children }
    }

    /// Binary comparison
    pub fn compare(operator: Operator, lhs: Expression, rhs: Expression) -> Self {
        Self::new(operator, vec![lhs.into(), rhs.into()])
    }

    /// `lhs = rhs`
    pub fn equal(lhs: Expression, rhs: Expression) -> Self {
        Self::compare(Operator::Equal, lhs, rhs)
    }

    /// All of `preds`
    pub fn and(preds: Vec<Predicate>) -> Self {
        Self::new(Operator::And, preds.into_iter().map(Into::into).collect())
    }

    /// Any of `preds`
    pub fn or(preds: Vec<Predicate>) -> Self {
        Self::new(Operator::Or, preds.into_iter().map(Into::into).collect())
    }

    /// Negation
    pub fn not(pred: Predicate) -> Self {
        Self::new(Operator::Not, vec![pred.into()])
    }

    /// Functional predicate
    pub fn functional(func: Func) -> Self {
        Self::new(Operator::Functional, vec![Expression::Function(func).into()])
    }

    /// Child predicates; errors if a child is an expression
    pub fn child_predicates(&self) -> Result<Vec<&Predicate>> {
        self.children
            .iter()
            .map(|c| match c {
                PredicateChild::Predicate(p) => Ok(p),
                PredicateChild::Expression(_) => Err(Error::query_invalid(format!(
                    "{} predicate can only have predicates as children",
                    self.operator
                ))),
            })
            .collect()
    }

    /// Child expressions; errors if a child is a predicate
    pub fn child_expressions(&self) -> Result<Vec<&Expression>> {
        self.children
            .iter()
            .map(|c| match c {
                PredicateChild::Expression(e) => Ok(e),
                PredicateChild::Predicate(_) => Err(Error::query_invalid(format!(
                    "{} predicate can only have expressions as children",
                    self.operator
                ))),
            })
            .collect()
    }

    /// The function of a functional predicate
    pub fn function(&self) -> Result<&Func> {
        match self.children.first() {
            Some(PredicateChild::Expression(Expression::Function(f)))
                if self.operator == Operator::Functional =>
            {
                Ok(f)
            }
            _ => Err(Error::query_invalid(
                "functional predicate must have a function as its only child",
            )),
        }
    }

    /// Check arity, child kinds and supported functions
    pub fn validate(&self) -> Result<()> {
        self.validate_at(true)
    }

    fn validate_at(&self, top_level: bool) -> Result<()> {
        if self.operator.is_binary() && self.children.len() != 2 {
            return Err(Error::query_invalid(format!(
                "{} predicate requires exactly two children, got {}",
                self.operator,
                self.children.len()
            )));
        }
        if self.operator == Operator::Not && self.children.len() != 1 {
            return Err(Error::query_invalid("Not predicate requires exactly one child"));
        }
        if self.operator == Operator::Functional && self.children.len() != 1 {
            return Err(Error::query_invalid(
                "Functional predicate requires exactly one child",
            ));
        }

        if self.operator.is_compound() {
            for child in self.child_predicates()? {
                child.validate_at(false)?;
            }
            return Ok(());
        }

        let exprs = self.child_expressions()?;
        match self.operator {
            Operator::Functional => match self.function()? {
                Func::UserRelation { relation_name, .. } => {
                    if relation_name != "_friend" && relation_name != "_follow" {
                        return Err(Error::not_supported(format!(
                            "user relation predicate with {} relation is not supported",
                            relation_name
                        )));
                    }
                }
                Func::UserDiscover { .. } => {
                    if !top_level {
                        return Err(Error::query_invalid(
                            "user discover predicate cannot be nested in another predicate",
                        ));
                    }
                }
                other => {
                    return Err(Error::not_supported(format!(
                        "function {} is not supported in a functional predicate",
                        other.name()
                    )));
                }
            },
            Operator::Equal | Operator::NotEqual => {
                for expr in exprs {
                    if let Expression::Literal(v) = expr {
                        if v.is_collection() {
                            return Err(Error::not_supported(format!(
                                "{} comparison with a map or array literal is not supported",
                                self.operator
                            )));
                        }
                    }
                }
            }
            Operator::In => validate_in(exprs[0], exprs[1])?,
            _ => {}
        }
        Ok(())
    }

    /// Whether any functional child is a user discover
    pub fn has_user_discover(&self) -> bool {
        match self.operator {
            Operator::Functional => matches!(self.function(), Ok(Func::UserDiscover { .. })),
            _ if self.operator.is_compound() => self.children.iter().any(|c| match c {
                PredicateChild::Predicate(p) => p.has_user_discover(),
                PredicateChild::Expression(_) => false,
            }),
            _ => false,
        }
    }
}

/// Exactly one side of `In` is a key path. The other side is a string
/// (membership in a JSON array column), an array (membership of the
/// column's value) or a geometry (containment).
fn validate_in(lhs: &Expression, rhs: &Expression) -> Result<()> {
    if lhs.is_key_path() == rhs.is_key_path() {
        return Err(Error::query_invalid(
            "either one of the operands of In must be a key path",
        ));
    }
    let geometry = |e: &Expression| {
        matches!(
            e,
            Expression::Literal(Value::Location(_)) | Expression::Literal(Value::Geometry(_))
        )
    };
    if rhs.is_key_path() && !matches!(lhs, Expression::Literal(Value::String(_))) && !geometry(lhs) {
        return Err(Error::query_invalid(
            "left operand of In must be a string when comparing with a key path",
        ));
    }
    if lhs.is_key_path()
        && !matches!(rhs, Expression::Literal(Value::Json(serde_json::Value::Array(_))))
        && !geometry(rhs)
    {
        return Err(Error::query_invalid(
            "right operand of In must be an array when comparing with a key path",
        ));
    }
    Ok(())
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    /// Expression to sort by (key path or function)
    pub expression: Expression,
    /// Direction
    #[serde(default)]
    pub order: SortOrder,
}

impl Sort {
    /// Ascending by key path
    pub fn asc(key_path: impl Into<String>) -> Self {
        Self {
            expression: Expression::key_path(key_path),
            order: SortOrder::Asc,
        }
    }

    /// Descending by key path
    pub fn desc(key_path: impl Into<String>) -> Self {
        Self {
            expression: Expression::key_path(key_path),
            order: SortOrder::Desc,
        }
    }
}

/// A record query.
///
/// Serialized with PascalCase field names; stored subscriptions are
/// matched on `{"Type": ...}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Query {
    /// Record type
    #[serde(rename = "Type")]
    pub record_type: String,
    /// Filter
    #[serde(default)]
    pub predicate: Option<Predicate>,
    /// Ordering
    #[serde(default)]
    pub sorts: Vec<Sort>,
    /// Extra transient columns
    #[serde(default)]
    pub computed_keys: BTreeMap<String, Expression>,
    /// Whitelist of user columns to return; empty returns all
    #[serde(default)]
    pub desired_keys: Option<Vec<String>>,
    /// Also compute the total row count
    #[serde(default)]
    pub get_count: bool,
    /// Maximum rows
    #[serde(default)]
    pub limit: Option<u64>,
    /// Rows to skip
    #[serde(default)]
    pub offset: u64,
    /// Caller the access clause is evaluated for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_as_user: Option<UserInfo>,
    /// Skip the access clause (admin and internal calls)
    #[serde(default)]
    pub bypass_access_control: bool,
}

impl Query {
    /// Query over a record type
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            ..Default::default()
        }
    }

    /// Builder: set the predicate
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Builder: add a sort
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    /// Builder: set limit
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder: set offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Builder: evaluate access as this user
    pub fn with_view_as_user(mut self, user: UserInfo) -> Self {
        self.view_as_user = Some(user);
        self
    }

    /// Validate the record type and predicate
    pub fn validate(&self) -> Result<()> {
        if self.record_type.is_empty() {
            return Err(Error::query_invalid("query record type cannot be empty"));
        }
        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        for sort in &self.sorts {
            if let Expression::Literal(_) = sort.expression {
                return Err(Error::query_invalid("cannot sort by a literal"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kp(path: &str) -> Expression {
        Expression::key_path(path)
    }

    #[test]
    fn test_binary_arity() {
        let one = Predicate::new(Operator::Equal, vec![kp("a").into()]);
        assert!(one.validate().is_err());

        let three = Predicate::new(
            Operator::GreaterThan,
            vec![kp("a").into(), kp("b").into(), kp("c").into()],
        );
        assert!(three.validate().is_err());

        let two = Predicate::equal(kp("a"), Expression::literal(1));
        assert!(two.validate().is_ok());
    }

    #[test]
    fn test_child_kinds() {
        let bad_and = Predicate::new(Operator::And, vec![kp("a").into()]);
        assert!(bad_and.validate().is_err());

        let inner = Predicate::equal(kp("a"), Expression::literal(1));
        let bad_eq = Predicate::new(Operator::Equal, vec![inner.clone().into(), kp("b").into()]);
        assert!(bad_eq.validate().is_err());

        assert!(Predicate::and(vec![inner.clone(), inner]).validate().is_ok());
    }

    #[test]
    fn test_equal_rejects_collection_literal() {
        let p = Predicate::equal(kp("tags"), Expression::Literal(Value::Json(serde_json::json!([1]))));
        let err = p.validate().unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));

        let p = Predicate::compare(
            Operator::NotEqual,
            kp("meta"),
            Expression::Literal(Value::Json(serde_json::json!({"a": 1}))),
        );
        assert!(p.validate().is_err());

        let p = Predicate::compare(
            Operator::In,
            kp("a"),
            Expression::Literal(Value::Json(serde_json::json!([1]))),
        );
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_in_operand_shapes() {
        let array = || Expression::Literal(Value::Json(serde_json::json!(["a", "b"])));
        let in_ = |lhs, rhs| Predicate::compare(Operator::In, lhs, rhs);

        assert!(in_(kp("title"), array()).validate().is_ok());
        assert!(in_(Expression::literal("a"), kp("tags")).validate().is_ok());
        assert!(in_(
            Expression::Literal(Value::Location(Location::new(1.0, 2.0))),
            kp("area")
        )
        .validate()
        .is_ok());

        for p in [
            in_(Expression::literal("a"), array()),
            in_(kp("title"), kp("tags")),
            in_(Expression::literal(1), kp("tags")),
            in_(array(), kp("tags")),
            in_(kp("title"), Expression::literal("a")),
            in_(kp("title"), Expression::Literal(Value::Json(serde_json::json!({"a": 1})))),
        ] {
            let err = p.validate().unwrap_err();
            assert!(matches!(err, Error::RecordQueryInvalid { .. }), "{:?}", p);
        }

        let nested = Predicate::not(in_(Expression::literal(1), Expression::literal(2)));
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_user_discover_must_be_top_level() {
        let discover = Predicate::functional(Func::UserDiscover {
            usernames: vec!["alice".into()],
            emails: vec![],
        });
        assert!(discover.validate().is_ok());
        assert!(Predicate::not(discover.clone()).validate().is_err());
        assert!(Predicate::and(vec![discover]).validate().is_err());
    }

    #[test]
    fn test_user_relation_names() {
        let rel = |name: &str| {
            Predicate::functional(Func::UserRelation {
                key_path: String::new(),
                relation_name: name.into(),
                relation_direction: RelationDirection::Outward,
                user: "u1".into(),
            })
        };
        assert!(rel("_friend").validate().is_ok());
        assert!(rel("_follow").validate().is_ok());
        assert!(matches!(
            rel("_colleague").validate(),
            Err(Error::NotSupported { .. })
        ));
    }

    #[test]
    fn test_query_serializes_type_key() {
        let q = Query::new("note");
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["Type"], "note");
        let back: Query = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn test_empty_query_type_rejected() {
        assert!(Query::default().validate().is_err());
    }
}
