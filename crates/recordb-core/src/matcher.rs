//! In-process predicate evaluation
//!
//! Used to re-check a stored subscription query against a changed record
//! without going back to the database. Only `And`, `Or`, `Not`, `Equal`,
//! `NotEqual` and `In` are supported; anything else is reported as
//! [`Error::NotSupported`].

use crate::error::{Error, Result};
use crate::query::{Expression, Operator, Predicate};
use crate::record::Record;
use crate::value::Value;

/// Whether `record` satisfies `predicate`. A missing predicate matches.
pub fn matches(predicate: Option<&Predicate>, record: &Record) -> Result<bool> {
    match predicate {
        Some(p) => evaluate(p, record),
        None => Ok(true),
    }
}

fn evaluate(predicate: &Predicate, record: &Record) -> Result<bool> {
    match predicate.operator {
        Operator::And => {
            for child in predicate.child_predicates()? {
                if !evaluate(child, record)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Operator::Or => {
            for child in predicate.child_predicates()? {
                if evaluate(child, record)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Operator::Not => match predicate.child_predicates()?.as_slice() {
            [child] => Ok(!evaluate(child, record)?),
            _ => Err(Error::query_invalid("Not predicate requires exactly one child")),
        },
        Operator::Equal | Operator::NotEqual | Operator::In => {
            let (lhs, rhs) = operands(predicate, record)?;
            match predicate.operator {
                Operator::Equal => Ok(lhs.loose_eq(&rhs)),
                Operator::NotEqual => Ok(!lhs.loose_eq(&rhs)),
                _ => contains(&rhs, &lhs),
            }
        }
        other => Err(Error::not_supported(format!(
            "operator {} cannot be evaluated against a record",
            other
        ))),
    }
}

fn operands(predicate: &Predicate, record: &Record) -> Result<(Value, Value)> {
    match predicate.child_expressions()?.as_slice() {
        [lhs, rhs] => Ok((resolve(lhs, record)?, resolve(rhs, record)?)),
        _ => Err(Error::query_invalid(format!(
            "{} predicate requires exactly two children",
            predicate.operator
        ))),
    }
}

fn resolve(expr: &Expression, record: &Record) -> Result<Value> {
    match expr {
        Expression::Literal(v) => Ok(v.clone()),
        Expression::KeyPath(path) => {
            if path.contains('.') {
                return Err(Error::not_supported(format!(
                    "key path {} crosses a reference",
                    path
                )));
            }
            record.get(path)
        }
        Expression::Function(f) => Err(Error::not_supported(format!(
            "function {} cannot be evaluated against a record",
            f.name()
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::Json(serde_json::Value::Array(items)) => Ok(items
            .iter()
            .any(|item| needle.loose_eq(&Value::from_json(item.clone())))),
        other => Err(Error::query_invalid(format!(
            "right hand side of In must be an array, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordId;
    use serde_json::json;

    fn note() -> Record {
        Record::new(RecordId::new("note", "n1"))
            .with_owner("alice")
            .with_field("title", "hello")
            .with_field("order", 2)
    }

    fn kp(p: &str) -> Expression {
        Expression::key_path(p)
    }

    #[test]
    fn test_empty_predicate_matches() {
        assert!(matches(None, &note()).unwrap());
    }

    #[test]
    fn test_equal_and_not_equal() {
        let r = note();
        let eq = Predicate::equal(kp("title"), Expression::literal("hello"));
        assert!(matches(Some(&eq), &r).unwrap());

        let ne = Predicate::compare(Operator::NotEqual, kp("order"), Expression::literal(2.0));
        assert!(!matches(Some(&ne), &r).unwrap());

        let owner = Predicate::equal(kp("_owner_id"), Expression::literal("alice"));
        assert!(matches(Some(&owner), &r).unwrap());
    }

    #[test]
    fn test_compound() {
        let r = note();
        let yes = Predicate::equal(kp("title"), Expression::literal("hello"));
        let no = Predicate::equal(kp("title"), Expression::literal("bye"));
        assert!(!matches(Some(&Predicate::and(vec![yes.clone(), no.clone()])), &r).unwrap());
        assert!(matches(Some(&Predicate::or(vec![no.clone(), yes])), &r).unwrap());
        assert!(matches(Some(&Predicate::not(no)), &r).unwrap());
    }

    #[test]
    fn test_in_array() {
        let r = note();
        let p = Predicate::compare(
            Operator::In,
            kp("order"),
            Expression::Literal(Value::Json(json!([1, 2, 3]))),
        );
        assert!(matches(Some(&p), &r).unwrap());

        let not_array = Predicate::compare(Operator::In, kp("order"), Expression::literal(2));
        assert!(matches(Some(&not_array), &r).is_err());
    }

    #[test]
    fn test_unsupported_operator_is_error() {
        let p = Predicate::compare(Operator::GreaterThan, kp("order"), Expression::literal(1));
        assert!(matches!(
            matches(Some(&p), &note()),
            Err(Error::NotSupported { .. })
        ));
    }
}
