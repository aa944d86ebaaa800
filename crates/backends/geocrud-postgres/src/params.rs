//! Named placeholder binding.
//!
//! Statements arrive with `:name` placeholders. PostgreSQL wants `$1`, `$2`, ...,
//! so [`rewrite_placeholders`] renumbers them in order of first appearance, leaving
//! `::type` casts and quoted text untouched. Values travel in text format as
//! [`TextParam`] and the server infers their type from the statement.

use std::error::Error;

use bytes::BytesMut;
use serde_json::Value;
use tokio_postgres::types::{Format, IsNull, ToSql, Type, to_sql_checked};

use geocrud_core_common::{DbError, DbErrorKind, DbResult, Params};

/// A statement rewritten to positional placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Positional {
    /// Statement text with `$n` placeholders
    pub sql: String,
    /// Parameter name of `$1`, `$2`, ...
    pub names: Vec<String>,
}

/// Rewrites `:name` placeholders to `$n`.
///
/// A name used twice binds the same position.
///
/// ```
/// use geocrud_postgres::params::rewrite_placeholders;
///
/// let positional = rewrite_placeholders("SELECT :a::text, ':b', :a, \"x:y\"");
/// assert_eq!(positional.sql, "SELECT $1::text, ':b', $1, \"x:y\"");
/// assert_eq!(positional.names, ["a"]);
/// ```
#[must_use]
pub fn rewrite_placeholders(sql: &str) -> Positional {
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                // copy through the closing quote; doubled quotes reopen immediately
                for (_, inner) in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            },
            ':' => match chars.peek() {
                Some((_, ':')) => {
                    out.push_str("::");
                    chars.next();
                },
                Some((start, next)) if next.is_ascii_alphabetic() || *next == '_' => {
                    let start = *start;
                    let mut end = start;
                    while let Some((i, n)) = chars.peek() {
                        if n.is_ascii_alphanumeric() || *n == '_' {
                            end = i + n.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let name = &sql[start..end];
                    let position = match names.iter().position(|n| n == name) {
                        Some(position) => position,
                        None => {
                            names.push(name.to_string());
                            names.len() - 1
                        },
                    };
                    out.push('$');
                    out.push_str(&(position + 1).to_string());
                },
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }

    Positional { sql: out, names }
}

/// A JSON value bound in text format.
///
/// Accepts every parameter type; the server parses the text like a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextParam(pub Option<String>);

impl TextParam {
    /// Text form of a JSON value: strings as-is, numbers and booleans by their JSON
    /// spelling, arrays and objects as JSON text, `null` as SQL NULL.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        Self(match value {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Array(_) | Value::Object(_) => Some(value.to_string()),
        })
    }
}

impl ToSql for TextParam {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            },
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Binds `params` to the positional names of a rewritten statement.
///
/// # Errors
///
/// Returns a [`DbErrorKind::Programming`] error for a placeholder without a value.
pub fn bind(names: &[String], params: &Params) -> DbResult<Vec<TextParam>> {
    names
        .iter()
        .map(|name| {
            params.get(name).map(TextParam::from_json).ok_or_else(|| {
                DbError::new(
                    DbErrorKind::Programming,
                    format!("no value for parameter :{name}"),
                )
            })
        })
        .collect()
}
