//! Filter expression parsing.
//!
//! Filters arrive as JSON arrays such as
//!
//! ```text
//! [["name", "=", "Main Street"], "and", [["type", "=", 2], "or", ["type", "=", 3]]]
//! ```
//!
//! Even positions hold leaves `[column, operator, value]` or nested arrays, odd
//! positions hold `"and"`/`"or"`. Parsing builds a [`FilterNode`] tree, checking
//! every column against the permitted set while the tree is built. Lowering to SQL
//! binds every value as a parameter (`:v0`, `:v1`, ...); only permitted column
//! names, through the caller's resolver, reach the SQL text.
//!
//! A column prefixed with `?` is optional: if it is not permitted, the leaf is
//! dropped from its `AND` group instead of failing the whole filter.
//!
//! # Examples
//!
//! ```
//! use geocrud_core::filter::FilterParser;
//!
//! let attributes = vec!["name".to_string(), "type".to_string()];
//! let parser = FilterParser::new("id", &attributes);
//! let parsed = parser
//!     .parse(Some(r#"[["name", "=", "x'; DROP TABLE t; --"], "and", ["type", ">", 5]]"#))
//!     .unwrap();
//! assert_eq!(parsed.sql, r#"("name" = :v0 AND "type" > :v1)"#);
//! assert_eq!(parsed.params["v0"], "x'; DROP TABLE t; --");
//!
//! assert!(parser.parse(Some(r#"[["owner", "=", 1]]"#)).is_err());
//! ```

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use geocrud_core_common::{Dialect, Params};

use crate::error::ParseError;
use crate::i18n::{DefaultTranslator, Translator};
use crate::spatial::{POSTGIS, SpatialDialect};

/// Comparison operators accepted in filter leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<>`
    NotEqual,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `LIKE`
    Like,
    /// `ILIKE`
    ILike,
    /// `IS`
    Is,
    /// `IS NOT`
    IsNot,
}

impl Operator {
    /// Parses an operator, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        let op = match normalized.as_str() {
            "=" => Operator::Eq,
            "!=" => Operator::Ne,
            "<>" => Operator::NotEqual,
            "<" => Operator::Lt,
            ">" => Operator::Gt,
            "<=" => Operator::Le,
            ">=" => Operator::Ge,
            "LIKE" => Operator::Like,
            "ILIKE" => Operator::ILike,
            "IS" => Operator::Is,
            "IS NOT" => Operator::IsNot,
            _ => return None,
        };
        Some(op)
    }

    /// SQL spelling of the operator.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::NotEqual => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
            Operator::Is => "IS",
            Operator::IsNot => "IS NOT",
        }
    }

    fn is_null_test(self) -> bool {
        matches!(self, Operator::Is | Operator::IsNot)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parsed filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    /// `column op value`
    Leaf {
        /// Permitted column name, without any `?` prefix
        column: String,
        /// Normalized operator
        op: Operator,
        /// Scalar value or null
        value: Value,
    },
    /// All children must match
    And(Vec<FilterNode>),
    /// Any child must match
    Or(Vec<FilterNode>),
}

impl FilterNode {
    /// Columns referenced by the leaves, in order of appearance.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterNode::Leaf { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            },
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.collect_columns(out);
                }
            },
        }
    }

    /// Lowers the tree to a parenthesized SQL fragment with bound parameters.
    ///
    /// `resolve` maps a column name to its SQL expression.
    #[must_use]
    pub fn to_sql(&self, resolve: &dyn Fn(&str) -> String, dialect: Dialect) -> ParsedFilter {
        let mut params = Params::new();
        let mut counter = 0;
        let body = self.render(resolve, dialect, &mut params, &mut counter);
        let sql = match self {
            FilterNode::Leaf { .. } => format!("({body})"),
            _ => body,
        };
        ParsedFilter { sql, params }
    }

    fn render(
        &self,
        resolve: &dyn Fn(&str) -> String,
        dialect: Dialect,
        params: &mut Params,
        counter: &mut usize,
    ) -> String {
        match self {
            FilterNode::Leaf { column, op, value } => {
                let name = format!("v{counter}");
                *counter += 1;
                let column_sql = resolve(column);
                if value.is_null() {
                    return format!("{column_sql} {} NULL", op.as_sql());
                }
                params.insert(name.clone(), value.clone());
                match (op, dialect) {
                    (Operator::ILike, Dialect::MsSql) => {
                        format!("LOWER({column_sql}) LIKE LOWER(:{name})")
                    },
                    _ => format!("{column_sql} {} :{name}", op.as_sql()),
                }
            },
            FilterNode::And(children) => {
                Self::render_group(children, " AND ", resolve, dialect, params, counter)
            },
            FilterNode::Or(children) => {
                Self::render_group(children, " OR ", resolve, dialect, params, counter)
            },
        }
    }

    fn render_group(
        children: &[FilterNode],
        separator: &str,
        resolve: &dyn Fn(&str) -> String,
        dialect: Dialect,
        params: &mut Params,
        counter: &mut usize,
    ) -> String {
        let parts = children
            .iter()
            .map(|child| child.render(resolve, dialect, params, counter))
            .collect::<Vec<_>>();
        format!("({})", parts.join(separator))
    }
}

/// SQL fragment and bound parameters of a filter.
///
/// An empty `sql` means the filter was valid but every leaf was dropped; callers
/// omit the clause in that case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFilter {
    /// Parenthesized boolean expression, or empty
    pub sql: String,
    /// Values for the `:vN` placeholders
    pub params: Params,
}

impl ParsedFilter {
    /// Returns `true` for the empty-but-valid result.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Kind of problem found in a filter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterIssueKind {
    /// A string token other than `and`/`or`
    InvalidConcatenation,
    /// `and`/`or` at an even position or at the end
    ConcatenationPosition,
    /// `[]` inside the expression
    EmptyList,
    /// Leaf without exactly three parts
    EntryCount,
    /// Column is not a string
    InvalidColumn,
    /// Column is neither the primary key nor permitted
    UnknownColumn,
    /// Unknown operator, or operator not valid for the value
    InvalidOperator,
    /// Value is not a scalar
    InvalidValueType,
    /// Anything else
    InvalidEntry,
}

impl FilterIssueKind {
    fn key(self) -> &'static str {
        match self {
            FilterIssueKind::InvalidConcatenation => "filter.invalid_concatenation",
            FilterIssueKind::ConcatenationPosition => "filter.concatenation_position",
            FilterIssueKind::EmptyList => "filter.empty_list",
            FilterIssueKind::EntryCount => "filter.entry_count",
            FilterIssueKind::InvalidColumn => "filter.invalid_column",
            FilterIssueKind::UnknownColumn => "filter.unknown_column",
            FilterIssueKind::InvalidOperator => "filter.invalid_operator",
            FilterIssueKind::InvalidValueType => "filter.invalid_value_type",
            FilterIssueKind::InvalidEntry => "filter.invalid_entry",
        }
    }
}

/// One invalid filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterIssue {
    /// What is wrong
    pub kind: FilterIssueKind,
    /// The offending entry as JSON text, or the token for connector issues
    pub entry: String,
    /// Index path from the top-level array to the entry
    pub position: Vec<usize>,
}

impl FilterIssue {
    /// Returns the translated message.
    #[must_use]
    pub fn message(&self, tr: &dyn Translator) -> String {
        tr.tr(self.kind.key(), &[self.entry.as_str()])
    }
}

impl fmt::Display for FilterIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message(&DefaultTranslator::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    And,
    Or,
}

/// Parser bound to one dataset's permitted columns.
#[derive(Debug, Clone)]
pub struct FilterParser<'a> {
    primary_key: &'a str,
    attributes: HashSet<&'a str>,
    dialect: &'a dyn SpatialDialect,
}

impl<'a> FilterParser<'a> {
    /// Creates a parser accepting `primary_key` and `attributes` as columns.
    #[must_use]
    pub fn new(primary_key: &'a str, attributes: &'a [String]) -> Self {
        Self {
            primary_key,
            attributes: attributes.iter().map(String::as_str).collect(),
            dialect: &POSTGIS,
        }
    }

    /// Uses `dialect` for identifier quoting and operator spelling.
    #[must_use]
    pub fn with_dialect(mut self, dialect: &'a dyn SpatialDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Parses filter text into a tree.
    ///
    /// Returns `Ok(None)` when the expression is valid but contains no leaves.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::EmptyExpression`] for missing or blank input,
    /// [`ParseError::InvalidJson`], [`ParseError::NotAnArray`], or
    /// [`ParseError::Filter`] with every invalid entry.
    pub fn parse_expression(&self, input: Option<&str>) -> Result<Option<FilterNode>, ParseError> {
        let text = match input {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Err(ParseError::EmptyExpression),
        };
        let value: Value = serde_json::from_str(text).map_err(|_| ParseError::InvalidJson)?;
        let Value::Array(entries) = value else {
            return Err(ParseError::NotAnArray);
        };

        // a bare leaf is one implicit group
        let entries = match entries.first() {
            Some(first) if !first.is_array() => vec![Value::Array(entries)],
            _ => entries,
        };

        let mut issues = Vec::new();
        let node = self.parse_group(&entries, &mut Vec::new(), &mut issues);
        if issues.is_empty() {
            Ok(node)
        } else {
            Err(ParseError::Filter(issues))
        }
    }

    /// Parses filter text and lowers it to SQL with the dialect's identifier quoting.
    ///
    /// # Errors
    ///
    /// See [`FilterParser::parse_expression`].
    pub fn parse(&self, input: Option<&str>) -> Result<ParsedFilter, ParseError> {
        let dialect = self.dialect;
        Ok(self
            .parse_expression(input)?
            .map(|node| node.to_sql(&|column| dialect.quote_ident(column), dialect.dialect()))
            .unwrap_or_default())
    }

    fn parse_group(
        &self,
        entries: &[Value],
        path: &mut Vec<usize>,
        issues: &mut Vec<FilterIssue>,
    ) -> Option<FilterNode> {
        let mut terms: Vec<(Connector, Option<FilterNode>)> = Vec::new();
        let mut pending = Connector::And;
        let mut failed = false;

        // siblings of an invalid entry are still checked so every issue is reported
        for (i, entry) in entries.iter().enumerate() {
            path.push(i);
            let outcome = self.parse_entry(entries.len(), i, entry, path, issues);
            path.pop();
            match outcome {
                Entry::Connector(connector) => pending = connector,
                Entry::Node(node) => terms.push((pending, Some(node))),
                Entry::Dropped => terms.push((pending, None)),
                Entry::Invalid => failed = true,
            }
        }

        if failed { None } else { combine(terms) }
    }

    fn parse_entry(
        &self,
        len: usize,
        i: usize,
        entry: &Value,
        path: &mut Vec<usize>,
        issues: &mut Vec<FilterIssue>,
    ) -> Entry {
        match entry {
            Value::String(token) => {
                let token = token.to_uppercase();
                let connector = match token.trim() {
                    "AND" => Connector::And,
                    "OR" => Connector::Or,
                    _ => return invalid(FilterIssueKind::InvalidConcatenation, token, path, issues),
                };
                if i % 2 != 1 || i == len - 1 {
                    return invalid(FilterIssueKind::ConcatenationPosition, token, path, issues);
                }
                Entry::Connector(connector)
            },
            Value::Array(parts) if i % 2 == 0 => {
                if parts.is_empty() {
                    return invalid(FilterIssueKind::EmptyList, String::new(), path, issues);
                }
                if parts[0].is_array() {
                    let before = issues.len();
                    return match self.parse_group(parts, path, issues) {
                        Some(node) => Entry::Node(node),
                        None if issues.len() > before => Entry::Invalid,
                        None => Entry::Dropped,
                    };
                }
                match self.parse_leaf(parts) {
                    Ok(Some(node)) => Entry::Node(node),
                    Ok(None) => Entry::Dropped,
                    Err(kind) => invalid(kind, entry.to_string(), path, issues),
                }
            },
            _ => invalid(FilterIssueKind::InvalidEntry, entry.to_string(), path, issues),
        }
    }

    fn parse_leaf(&self, parts: &[Value]) -> Result<Option<FilterNode>, FilterIssueKind> {
        let [column, op, value] = parts else {
            return Err(FilterIssueKind::EntryCount);
        };

        let Value::String(column) = column else {
            return Err(FilterIssueKind::InvalidColumn);
        };
        let (column, optional) = match column.strip_prefix('?') {
            Some(rest) => (rest, true),
            None => (column.as_str(), false),
        };
        if column != self.primary_key && !self.attributes.contains(column) {
            if optional {
                log::warn!("Dropping filter on unavailable column '{column}'");
                return Ok(None);
            }
            return Err(FilterIssueKind::UnknownColumn);
        }

        let mut op = op
            .as_str()
            .and_then(Operator::parse)
            .ok_or(FilterIssueKind::InvalidOperator)?;

        match value {
            Value::Null => {
                op = match op {
                    Operator::Eq | Operator::Is => Operator::Is,
                    Operator::Ne | Operator::IsNot => Operator::IsNot,
                    _ => return Err(FilterIssueKind::InvalidOperator),
                };
            },
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                if op.is_null_test() {
                    return Err(FilterIssueKind::InvalidOperator);
                }
            },
            Value::Array(_) | Value::Object(_) => return Err(FilterIssueKind::InvalidValueType),
        }

        Ok(Some(FilterNode::Leaf {
            column: column.to_string(),
            op,
            value: value.clone(),
        }))
    }
}

enum Entry {
    Connector(Connector),
    Node(FilterNode),
    Dropped,
    Invalid,
}

fn invalid(
    kind: FilterIssueKind,
    entry: String,
    path: &[usize],
    issues: &mut Vec<FilterIssue>,
) -> Entry {
    issues.push(FilterIssue {
        kind,
        entry,
        position: path.to_vec(),
    });
    Entry::Invalid
}

/// Groups terms by precedence: `AND` binds tighter than `OR`.
///
/// Dropped terms (`None`) vanish from their conjunction; a conjunction left empty
/// vanishes from the disjunction.
fn combine(terms: Vec<(Connector, Option<FilterNode>)>) -> Option<FilterNode> {
    let mut alternatives: Vec<Vec<Option<FilterNode>>> = Vec::new();
    for (connector, node) in terms {
        match alternatives.last_mut() {
            Some(conjunction) if connector == Connector::And => conjunction.push(node),
            _ => alternatives.push(vec![node]),
        }
    }

    let mut alternatives = alternatives
        .into_iter()
        .map(|conjunction| conjunction.into_iter().flatten().collect::<Vec<_>>())
        .filter(|conjunction| !conjunction.is_empty())
        .map(|mut conjunction| {
            if conjunction.len() == 1 {
                conjunction.remove(0)
            } else {
                FilterNode::And(conjunction)
            }
        })
        .collect::<Vec<_>>();

    match alternatives.len() {
        0 => None,
        1 => Some(alternatives.remove(0)),
        _ => Some(FilterNode::Or(alternatives)),
    }
}
