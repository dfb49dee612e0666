//! SQL generation
//!
//! Statements are assembled from [`Fragment`]s written with `?` markers.
//! A single pass at the end numbers the markers into `$n::<cast>`, where
//! the cast comes from the bound [`SqlValue`]. Quoted identifiers and
//! string literals are skipped by that pass, so a `?` inside either is
//! left alone.

pub mod access;
pub mod expression;
pub mod predicate;
pub mod select;
pub mod write;

use recordb_core::error::{Error, Result};
use sea_query::{Alias, IntoIden, TableRef};

use crate::types::{Operand, SqlValue};

/// SQL text with `?` markers and the values bound to them, in order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    /// SQL with `?` markers
    pub sql: String,
    /// Bound values, one per marker
    pub args: Vec<SqlValue>,
}

impl Fragment {
    /// Fragment without arguments
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Fragment with arguments
    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// A single `?` bound to `value`
    pub fn bind(value: impl Into<SqlValue>) -> Self {
        Self::with_args("?", vec![value.into()])
    }

    /// Bound parameter or inline SQL
    pub fn operand(operand: Operand) -> Self {
        match operand {
            Operand::Bind(value) => Self::bind(value),
            Operand::Raw(sql) => Self::raw(sql),
        }
    }

    /// Append SQL text
    pub fn push_str(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append another fragment
    pub fn push(&mut self, other: Fragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args);
        self
    }

    /// Surround the SQL text
    pub fn wrap(mut self, prefix: &str, suffix: &str) -> Self {
        self.sql = format!("{}{}{}", prefix, self.sql, suffix);
        self
    }

    /// Join fragments with `sep`
    pub fn join(fragments: impl IntoIterator<Item = Fragment>, sep: &str) -> Self {
        let mut out = Fragment::default();
        for (i, f) in fragments.into_iter().enumerate() {
            if i > 0 {
                out.sql.push_str(sep);
            }
            out.push(f);
        }
        out
    }

    /// Number the markers into a runnable statement
    pub fn finish(self) -> Result<Statement> {
        Statement::number(&self.sql, self.args)
    }
}

/// A statement ready to run: `$n` placeholders and their values
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL with numbered placeholders
    pub sql: String,
    /// Parameter values
    pub args: Vec<SqlValue>,
}

impl Statement {
    /// Statement without parameters
    pub fn plain(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Number the `?` markers of `sql`
    pub fn number(sql: &str, args: Vec<SqlValue>) -> Result<Self> {
        let sql = number_placeholders(sql, &args)?;
        Ok(Self { sql, args })
    }

    /// Parameters for `query_raw` / `execute_raw`
    pub fn params(&self) -> impl ExactSizeIterator<Item = &SqlValue> {
        self.args.iter()
    }
}

/// Replace each `?` outside quotes with `$n::<cast>`.
///
/// Fails if the number of markers does not match the number of values.
pub fn number_placeholders(sql: &str, args: &[SqlValue]) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut in_single = false;
    let mut in_double = false;
    let mut n = 0usize;

    for c in sql.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '?' if !in_single && !in_double => {
                let arg = args.get(n).ok_or_else(|| {
                    Error::internal(format!(
                        "statement has more placeholders than the {} bound values",
                        args.len()
                    ))
                })?;
                n += 1;
                out.push_str(&format!("${}::{}", n, arg.cast()));
            }
            _ => out.push(c),
        }
    }

    if n != args.len() {
        return Err(Error::internal(format!(
            "statement has {} placeholders but {} bound values",
            n,
            args.len()
        )));
    }
    Ok(out)
}

/// Quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"alias"."column"`
pub fn full_quote(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

/// `"schema"."table"`
pub fn table_name(schema: &str, table: &str) -> String {
    full_quote(schema, table)
}

/// sea-query reference to a schema-qualified table
pub fn table_ref(schema: &str, table: &str) -> TableRef {
    TableRef::SchemaTable(Alias::new(schema).into_iden(), Alias::new(table).into_iden())
}

/// `(?, ?, ...)` for `n` values, or `(NULL)` when empty so `IN` matches nothing
pub fn placeholders(values: Vec<SqlValue>) -> Fragment {
    if values.is_empty() {
        return Fragment::raw("(NULL)");
    }
    let marks = vec!["?"; values.len()].join(", ");
    Fragment::with_args(format!("({})", marks), values)
}

/// Text values for an `IN` list
pub fn text_list<S: AsRef<str>>(values: &[S]) -> Fragment {
    placeholders(
        values
            .iter()
            .map(|v| SqlValue::Text(v.as_ref().to_string()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_placeholders_with_casts() {
        let sql = number_placeholders(
            "SELECT * FROM t WHERE a = ? AND b < ?",
            &[SqlValue::from("x"), SqlValue::from(2_i64)],
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1::text AND b < $2::bigint");
    }

    #[test]
    fn test_number_placeholders_skips_quotes() {
        let sql = number_placeholders(
            r#"SELECT "wh?t", 'is ''this?' FROM t WHERE c = ?"#,
            &[SqlValue::from(true)],
        )
        .unwrap();
        assert_eq!(sql, r#"SELECT "wh?t", 'is ''this?' FROM t WHERE c = $1::boolean"#);
    }

    #[test]
    fn test_number_placeholders_count_mismatch() {
        assert!(number_placeholders("a = ?", &[]).is_err());
        assert!(number_placeholders("a = 1", &[SqlValue::from(1_i64)]).is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("note"), "\"note\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(full_quote("_t0", "_id"), "\"_t0\".\"_id\"");
    }

    #[test]
    fn test_fragment_join_keeps_arg_order() {
        let f = Fragment::join(
            vec![Fragment::bind("a"), Fragment::raw("TRUE"), Fragment::bind(1_i64)],
            " AND ",
        );
        assert_eq!(f.sql, "? AND TRUE AND ?");
        let stmt = f.finish().unwrap();
        assert_eq!(stmt.sql, "$1::text AND TRUE AND $2::bigint");
        assert_eq!(stmt.params().len(), 2);
    }

    #[test]
    fn test_empty_placeholders() {
        assert_eq!(placeholders(vec![]).sql, "(NULL)");
        assert_eq!(text_list(&["a", "b"]).sql, "(?, ?)");
    }
}
