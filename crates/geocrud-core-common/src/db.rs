//! Database handle traits.
//!
//! The provider never talks to a driver directly. It receives [`Database`] handles
//! (one for reads, one for writes, possibly the same) and opens a [`Connection`] per
//! operation. Statements use named `:param` placeholders; values are JSON values and
//! rows come back as ordered JSON objects keyed by column name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// One result row, keyed by column name in select order.
pub type Row = Map<String, Value>;

/// Named parameters bound to a statement.
pub type Params = BTreeMap<String, Value>;

/// Category of a database failure.
///
/// The first four mirror the DB-API error classes that a write boundary is allowed
/// to translate into a commit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Invalid data for the target type (bad cast, out of range).
    Data,
    /// Constraint violation (unique, foreign key, check, not null).
    Integrity,
    /// Internal engine error (e.g. spatial function failures).
    Internal,
    /// Malformed statement, unknown column or type.
    Programming,
    /// Connection could not be established or was lost.
    Connection,
    /// Anything else.
    Other,
}

impl DbErrorKind {
    /// Returns `true` for the categories a write boundary reports as a commit failure.
    #[must_use]
    pub fn is_commit_failure(self) -> bool {
        matches!(
            self,
            DbErrorKind::Data
                | DbErrorKind::Integrity
                | DbErrorKind::Internal
                | DbErrorKind::Programming
        )
    }

    /// Returns the display form of this category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DbErrorKind::Data => "data error",
            DbErrorKind::Integrity => "integrity error",
            DbErrorKind::Internal => "internal error",
            DbErrorKind::Programming => "programming error",
            DbErrorKind::Connection => "connection error",
            DbErrorKind::Other => "database error",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a database handle.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DbError {
    /// Failure category.
    pub kind: DbErrorKind,
    /// Primary engine message.
    pub message: String,
    /// Optional engine detail text (e.g. the offending key of a unique violation).
    pub detail: Option<String>,
}

impl DbError {
    /// Creates an error without detail text.
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches engine detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience result alias for database calls.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// A source of connections.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

/// An open connection.
///
/// Statements run in autocommit mode unless [`Connection::begin`] was called.
#[async_trait]
pub trait Connection: Send {
    /// Executes a statement with named `:param` placeholders and returns all rows.
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<Vec<Row>>;

    /// Starts a transaction.
    async fn begin(&mut self) -> DbResult<()>;

    /// Commits the current transaction.
    async fn commit(&mut self) -> DbResult<()>;

    /// Rolls back the current transaction.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Creates a named savepoint inside the current transaction.
    async fn savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Rolls back to a named savepoint, keeping the outer transaction usable.
    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Releases a named savepoint.
    async fn release_savepoint(&mut self, name: &str) -> DbResult<()>;
}

#[async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        (**self).connect().await
    }
}

/// Scoped savepoint on a borrowed connection.
///
/// Statements executed through the guard run inside the savepoint. Every path out
/// of a probe must end in [`Savepoint::rollback`], which undoes the savepoint's work
/// and releases it, leaving the enclosing transaction usable even if a statement
/// inside the savepoint failed.
pub struct Savepoint<'c> {
    conn: &'c mut dyn Connection,
    name: String,
    open: bool,
}

impl<'c> Savepoint<'c> {
    /// Creates the savepoint `name` on `conn`.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the savepoint cannot be created.
    pub async fn open(conn: &'c mut dyn Connection, name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        conn.savepoint(&name).await?;
        Ok(Self {
            conn,
            name,
            open: true,
        })
    }

    /// Executes a statement inside the savepoint.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the savepoint stays open and must still be rolled back.
    pub async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<Vec<Row>> {
        self.conn.execute(sql, params).await
    }

    /// Rolls back to and releases the savepoint.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the rollback fails.
    pub async fn rollback(mut self) -> DbResult<()> {
        self.open = false;
        self.conn.rollback_to_savepoint(&self.name).await?;
        self.conn.release_savepoint(&self.name).await
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if self.open {
            log::warn!(
                "savepoint {} dropped without rollback; enclosing transaction must be rolled back",
                self.name
            );
        }
    }
}

/// Builds a [`Params`] map from `name => value` pairs.
#[macro_export]
macro_rules! params {
    () => { $crate::db::Params::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut params = $crate::db::Params::new();
        $(params.insert(::std::string::String::from($name), $crate::__serde_json::Value::from($value));)+
        params
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_failure_kinds() {
        assert!(DbErrorKind::Data.is_commit_failure());
        assert!(DbErrorKind::Integrity.is_commit_failure());
        assert!(DbErrorKind::Internal.is_commit_failure());
        assert!(DbErrorKind::Programming.is_commit_failure());
        assert!(!DbErrorKind::Connection.is_commit_failure());
        assert!(!DbErrorKind::Other.is_commit_failure());
    }

    #[test]
    fn test_error_display() {
        let err = DbError::new(DbErrorKind::Integrity, "duplicate key value")
            .with_detail("Key (name)=(a) already exists.");
        assert_eq!(err.to_string(), "integrity error: duplicate key value");
        assert_eq!(err.detail.as_deref(), Some("Key (name)=(a) already exists."));
    }

    #[test]
    fn test_params_macro() {
        let params = params! { "id" => 5, "name" => "x" };
        assert_eq!(params.len(), 2);
        assert_eq!(params["id"], Value::from(5));
        assert!(params!().is_empty());
    }
}
