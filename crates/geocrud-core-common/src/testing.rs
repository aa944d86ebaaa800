//! In-memory database double.
//!
//! [`MockDatabase`] implements [`Database`] without a server. Tests register rules
//! that answer statements containing a substring, inspect the recorded statements and
//! transaction events afterwards, and rely on the built-in emulation of PostgreSQL
//! value casts used by field validation (`SELECT CAST(CAST(:value AS <source>) AS
//! <target>) AS value`).
//!
//! Like PostgreSQL, a failed statement inside a transaction aborts it: further
//! statements fail until the transaction or an enclosing savepoint is rolled back.
//!
//! ```
//! use geocrud_core_common::testing::{MockDatabase, rows};
//! use geocrud_core_common::db::{Database, Params};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let db = MockDatabase::new();
//! db.on_query("FROM \"public\".\"roads\"", rows(json!([{"id": 1}])));
//! let mut conn = db.connect().await.unwrap();
//! let result = conn.execute("SELECT id FROM \"public\".\"roads\"", &Params::new()).await.unwrap();
//! assert_eq!(result[0]["id"], json!(1));
//! # }
//! ```

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::{Number, Value};

use crate::db::{Connection, Database, DbError, DbErrorKind, DbResult, Params, Row};

/// Something that happened on a mock connection.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A connection was opened.
    Connect,
    /// `BEGIN`
    Begin,
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
    /// `SAVEPOINT name`
    Savepoint(String),
    /// `ROLLBACK TO SAVEPOINT name`
    RollbackToSavepoint(String),
    /// `RELEASE SAVEPOINT name`
    ReleaseSavepoint(String),
    /// A statement with its bound parameters.
    Execute {
        /// Statement text.
        sql: String,
        /// Bound parameters.
        params: Params,
    },
}

type Responder = Arc<dyn Fn(&str, &Params) -> DbResult<Vec<Row>> + Send + Sync>;

struct Rule {
    pattern: String,
    responder: Responder,
}

#[derive(Default)]
struct MockState {
    rules: Vec<Rule>,
    events: Vec<MockEvent>,
}

/// Rule-driven fake database shared by all connections it opens.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<MockState>>,
}

impl MockDatabase {
    /// Creates a database with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers statements containing `pattern` with `rows`.
    ///
    /// Rules are tried in registration order; the first match wins. Statements that
    /// match no rule return no rows.
    pub fn on_query(&self, pattern: impl Into<String>, rows: Vec<Row>) -> &Self {
        self.on_fn(pattern, move |_, _| Ok(rows.clone()))
    }

    /// Fails statements containing `pattern` with `error`.
    pub fn on_error(&self, pattern: impl Into<String>, error: DbError) -> &Self {
        self.on_fn(pattern, move |_, _| Err(error.clone()))
    }

    /// Answers statements containing `pattern` by calling `f`.
    pub fn on_fn<F>(&self, pattern: impl Into<String>, f: F) -> &Self
    where
        F: Fn(&str, &Params) -> DbResult<Vec<Row>> + Send + Sync + 'static,
    {
        self.state().rules.push(Rule {
            pattern: pattern.into(),
            responder: Arc::new(f),
        });
        self
    }

    /// Returns every recorded event in order.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    /// Returns the executed statements in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|(sql, _)| sql).collect()
    }

    /// Returns the executed statements with their parameters.
    #[must_use]
    pub fn executed(&self) -> Vec<(String, Params)> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Execute { sql, params } => Some((sql.clone(), params.clone())),
                _ => None,
            })
            .collect()
    }

    /// Forgets recorded events, keeping the rules.
    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    fn record(&self, event: MockEvent) {
        self.state().events.push(event);
    }

    fn respond(&self, sql: &str, params: &Params) -> DbResult<Vec<Row>> {
        let responder = self
            .state()
            .rules
            .iter()
            .find(|r| sql.contains(&r.pattern))
            .map(|r| Arc::clone(&r.responder));
        match responder {
            Some(f) => f(sql, params),
            None => emulate_cast(sql, params).unwrap_or_else(|| Ok(Vec::new())),
        }
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        self.record(MockEvent::Connect);
        Ok(Box::new(MockConnection {
            db: self.clone(),
            in_transaction: false,
            aborted: false,
            savepoints: Vec::new(),
        }))
    }
}

struct MockConnection {
    db: MockDatabase,
    in_transaction: bool,
    aborted: bool,
    savepoints: Vec<String>,
}

impl MockConnection {
    fn require_transaction(&self, what: &str) -> DbResult<()> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(DbError::new(
                DbErrorKind::Other,
                format!("{what} can only be used in transaction blocks"),
            ))
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<Vec<Row>> {
        self.db.record(MockEvent::Execute {
            sql: sql.to_string(),
            params: params.clone(),
        });
        if self.aborted {
            return Err(DbError::new(
                DbErrorKind::Other,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        let result = self.db.respond(sql, params);
        if result.is_err() && self.in_transaction {
            self.aborted = true;
        }
        result
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.db.record(MockEvent::Begin);
        self.in_transaction = true;
        self.aborted = false;
        self.savepoints.clear();
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.db.record(MockEvent::Commit);
        self.require_transaction("COMMIT")?;
        self.in_transaction = false;
        self.savepoints.clear();
        if self.aborted {
            self.aborted = false;
            return Err(DbError::new(
                DbErrorKind::Other,
                "commit of aborted transaction was rolled back",
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.db.record(MockEvent::Rollback);
        self.in_transaction = false;
        self.aborted = false;
        self.savepoints.clear();
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.db.record(MockEvent::Savepoint(name.to_string()));
        self.require_transaction("SAVEPOINT")?;
        if self.aborted {
            return Err(DbError::new(
                DbErrorKind::Other,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        self.savepoints.push(name.to_string());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.db
            .record(MockEvent::RollbackToSavepoint(name.to_string()));
        self.require_transaction("ROLLBACK TO SAVEPOINT")?;
        match self.savepoints.iter().rposition(|s| s == name) {
            Some(pos) => {
                self.savepoints.truncate(pos + 1);
                self.aborted = false;
                Ok(())
            },
            None => Err(DbError::new(
                DbErrorKind::Other,
                format!("savepoint \"{name}\" does not exist"),
            )),
        }
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.db.record(MockEvent::ReleaseSavepoint(name.to_string()));
        self.require_transaction("RELEASE SAVEPOINT")?;
        match self.savepoints.iter().rposition(|s| s == name) {
            Some(pos) => {
                self.savepoints.truncate(pos);
                Ok(())
            },
            None => Err(DbError::new(
                DbErrorKind::Other,
                format!("savepoint \"{name}\" does not exist"),
            )),
        }
    }
}

/// Converts a JSON array of objects into rows.
///
/// Non-object entries are skipped.
#[must_use]
pub fn rows(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    }
}

static CAST_PROBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+CAST\(CAST\(:value AS ([a-z][a-z ]*)\) AS (.+)\) AS value\s*;?\s*$")
        .unwrap()
});

/// Emulates `SELECT CAST(CAST(:value AS <source>) AS <target>) AS value`.
fn emulate_cast(sql: &str, params: &Params) -> Option<DbResult<Vec<Row>>> {
    let caps = CAST_PROBE.captures(sql)?;
    let source = caps.get(1)?.as_str().trim().to_ascii_lowercase();
    let target = caps.get(2)?.as_str().trim().to_ascii_lowercase();
    let input = params.get("value").cloned().unwrap_or(Value::Null);

    let result = Cast::from_param(&input, &source)
        .and_then(|v| v.into_target(&target))
        .map(|value| {
            let mut row = Row::new();
            row.insert("value".to_string(), value);
            vec![row]
        });
    Some(result)
}

/// A value after the inner cast.
enum Cast {
    Null,
    Numeric(f64, Option<i64>),
    Boolean(bool),
    Text(String),
}

fn data_error(message: String) -> DbError {
    DbError::new(DbErrorKind::Data, message)
}

fn cannot_cast(from: &str, to: &str) -> DbError {
    DbError::new(
        DbErrorKind::Programming,
        format!("cannot cast type {from} to {to}"),
    )
}

fn invalid_syntax(ty: &str, input: &str) -> DbError {
    data_error(format!("invalid input syntax for type {ty}: \"{input}\""))
}

impl Cast {
    fn from_param(input: &Value, source: &str) -> DbResult<Self> {
        if input.is_null() {
            return Ok(Cast::Null);
        }
        match source {
            "numeric" => match input {
                Value::Number(n) => Ok(Cast::Numeric(n.as_f64().unwrap_or(f64::NAN), n.as_i64())),
                other => {
                    let text = text_of(other);
                    text.trim()
                        .parse::<f64>()
                        .map(|f| Cast::Numeric(f, text.trim().parse::<i64>().ok()))
                        .map_err(|_| invalid_syntax("numeric", &text))
                },
            },
            "boolean" => match input {
                Value::Bool(b) => Ok(Cast::Boolean(*b)),
                other => parse_bool(&text_of(other)).map(Cast::Boolean),
            },
            _ => Ok(Cast::Text(text_of(input))),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Cast::Numeric(..) => "numeric",
            Cast::Boolean(_) => "boolean",
            Cast::Null | Cast::Text(_) => "text",
        }
    }

    fn into_target(self, target: &str) -> DbResult<Value> {
        if let Cast::Null = self {
            return Ok(Value::Null);
        }
        let (base, modifiers) = split_type_modifiers(target);
        match base.as_str() {
            "smallint" | "int2" => self.to_integer("smallint", i64::from(i16::MIN), i64::from(i16::MAX)),
            "integer" | "int" | "int4" => {
                self.to_integer("integer", i64::from(i32::MIN), i64::from(i32::MAX))
            },
            "bigint" | "int8" => self.to_integer("bigint", i64::MIN, i64::MAX),
            "numeric" | "decimal" => self.to_numeric(&modifiers),
            "real" | "float4" => self.to_float("real", true),
            "double precision" | "float8" | "float" => self.to_float("double precision", false),
            "boolean" | "bool" => match self {
                Cast::Boolean(b) => Ok(Value::Bool(b)),
                Cast::Text(s) => parse_bool(&s).map(Value::Bool),
                other => Err(cannot_cast(other.type_name(), "boolean")),
            },
            "text" | "varchar" | "character varying" | "character" | "char" | "bpchar" => {
                Ok(Value::String(self.into_text()))
            },
            "date" => match self {
                Cast::Text(s) => parse_date(&s)
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .ok_or_else(|| invalid_syntax("date", &s)),
                other => Err(cannot_cast(other.type_name(), "date")),
            },
            "timestamp" | "timestamp without time zone" => match self {
                Cast::Text(s) => parse_timestamp(&s)
                    .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S").to_string()))
                    .ok_or_else(|| invalid_syntax("timestamp", &s)),
                other => Err(cannot_cast(other.type_name(), "timestamp without time zone")),
            },
            "time" | "time without time zone" => match self {
                Cast::Text(s) => parse_time(&s)
                    .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
                    .ok_or_else(|| invalid_syntax("time", &s)),
                other => Err(cannot_cast(other.type_name(), "time without time zone")),
            },
            "uuid" => match self {
                Cast::Text(s) => uuid::Uuid::parse_str(s.trim())
                    .map(|u| Value::String(u.hyphenated().to_string()))
                    .map_err(|_| invalid_syntax("uuid", &s)),
                other => Err(cannot_cast(other.type_name(), "uuid")),
            },
            "json" | "jsonb" => match self {
                Cast::Text(s) => serde_json::from_str::<Value>(&s)
                    .map_err(|_| invalid_syntax(&base, &s)),
                other => Err(cannot_cast(other.type_name(), &base)),
            },
            _ => Ok(Value::String(self.into_text())),
        }
    }

    fn into_text(self) -> String {
        match self {
            Cast::Null => String::new(),
            Cast::Numeric(f, Some(i)) if (i as f64 - f).abs() < f64::EPSILON => i.to_string(),
            Cast::Numeric(f, _) => f.to_string(),
            Cast::Boolean(b) => b.to_string(),
            Cast::Text(s) => s,
        }
    }

    fn to_integer(self, ty: &str, min: i64, max: i64) -> DbResult<Value> {
        let out_of_range = || data_error(format!("{ty} out of range"));
        let value = match self {
            Cast::Numeric(_, Some(i)) => i,
            Cast::Numeric(f, None) => {
                let rounded = f.round();
                if !rounded.is_finite() || rounded < min as f64 || rounded > max as f64 {
                    return Err(out_of_range());
                }
                rounded as i64
            },
            Cast::Boolean(b) if ty == "integer" => i64::from(b),
            Cast::Text(s) => {
                let trimmed = s.trim();
                let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
                match digits.parse::<i64>() {
                    Ok(i) => i,
                    Err(_) if is_integer_literal(digits) => {
                        return Err(data_error(format!(
                            "value \"{s}\" is out of range for type {ty}"
                        )));
                    },
                    Err(_) => return Err(invalid_syntax(ty, &s)),
                }
            },
            other => return Err(cannot_cast(other.type_name(), ty)),
        };
        if value < min || value > max {
            return Err(out_of_range());
        }
        Ok(Value::from(value))
    }

    fn to_numeric(self, modifiers: &[u32]) -> DbResult<Value> {
        let value = match self {
            Cast::Numeric(f, _) => f,
            Cast::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid_syntax("numeric", &s))?,
            other => return Err(cannot_cast(other.type_name(), "numeric")),
        };
        let value = match modifiers {
            [precision, scale] => {
                let factor = 10f64.powi(i32::try_from(*scale).unwrap_or(i32::MAX));
                let rounded = (value * factor).round() / factor;
                let limit = 10f64.powi(
                    i32::try_from(precision.saturating_sub(*scale)).unwrap_or(i32::MAX),
                );
                if rounded.abs() >= limit {
                    return Err(data_error("numeric field overflow".to_string()));
                }
                rounded
            },
            [precision] => {
                let rounded = value.round();
                if rounded.abs() >= 10f64.powi(i32::try_from(*precision).unwrap_or(i32::MAX)) {
                    return Err(data_error("numeric field overflow".to_string()));
                }
                rounded
            },
            _ => value,
        };
        Number::from_f64(value)
            .map(Value::Number)
            .ok_or_else(|| data_error("numeric value is not finite".to_string()))
    }

    fn to_float(self, ty: &str, single: bool) -> DbResult<Value> {
        let value = match self {
            Cast::Numeric(f, _) => f,
            Cast::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid_syntax(ty, &s))?,
            other => return Err(cannot_cast(other.type_name(), ty)),
        };
        if single && value.is_finite() && value.abs() > f64::from(f32::MAX) {
            return Err(data_error(format!("value out of range: overflow for type {ty}")));
        }
        Number::from_f64(value)
            .map(Value::Number)
            .ok_or_else(|| data_error(format!("{ty} value is not finite")))
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn split_type_modifiers(target: &str) -> (String, Vec<u32>) {
    match target.split_once('(') {
        Some((base, rest)) => {
            let modifiers = rest
                .trim_end_matches(')')
                .split(',')
                .filter_map(|m| m.trim().parse::<u32>().ok())
                .collect();
            (base.trim().to_string(), modifiers)
        },
        None => (target.trim().to_string(), Vec::new()),
    }
}

fn parse_bool(input: &str) -> DbResult<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid_syntax("boolean", input)),
    }
}

fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"]
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .or_else(|| parse_timestamp(s).map(|t| t.date()))
}

fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_time(input: &str) -> Option<NaiveTime> {
    let s = input.trim();
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(s, f).ok())
}
