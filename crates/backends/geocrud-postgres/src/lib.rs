//! PostgreSQL backend for `geocrud`.
//!
//! [`PostgresDatabase`] implements [`Database`] on `tokio-postgres`. Each
//! [`Database::connect`] opens a fresh session and spawns its connection task on the
//! current Tokio runtime.
//!
//! Row-returning statements are wrapped as
//! `WITH q AS (<statement>) SELECT row_to_json(q)::text FROM q`, so every column
//! arrives as JSON regardless of its type (geometries are already serialized by the
//! statement itself) and column order is preserved.
//!
//! ```no_run
//! use geocrud_core_common::{Database, Params};
//! use geocrud_postgres::PostgresDatabase;
//!
//! # async fn run() -> geocrud_core_common::DbResult<()> {
//! let db = PostgresDatabase::from_dsn("host=localhost user=geo dbname=gis")?;
//! let mut conn = db.connect().await?;
//! let rows = conn.execute("SELECT 1 AS one", &Params::new()).await?;
//! assert_eq!(rows[0]["one"], 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod params;

use std::fmt;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls};

use geocrud_core_common::{Connection, Database, DbError, DbErrorKind, DbResult, Params, Row};

use crate::error::from_driver;
use crate::params::{TextParam, bind, rewrite_placeholders};

/// Connection factory for one PostgreSQL database.
#[derive(Clone)]
pub struct PostgresDatabase {
    config: Config,
}

impl fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the config carries the password
        f.debug_struct("PostgresDatabase")
            .field("dbname", &self.config.get_dbname())
            .field("user", &self.config.get_user())
            .finish_non_exhaustive()
    }
}

impl PostgresDatabase {
    /// Creates a factory from a driver configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Creates a factory from a key/value or URL connection string.
    ///
    /// # Errors
    ///
    /// Returns a [`DbErrorKind::Connection`] error if the string does not parse.
    pub fn from_dsn(dsn: &str) -> DbResult<Self> {
        let config = dsn.parse::<Config>().map_err(|e| {
            DbError::new(DbErrorKind::Connection, format!("invalid connection string: {e}"))
        })?;
        Ok(Self::new(config))
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| DbError::new(DbErrorKind::Connection, e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::warn!("PostgreSQL connection closed with error: {err}");
            }
        });
        log::debug!("Opened PostgreSQL session");
        Ok(Box::new(PostgresConnection { client }))
    }
}

/// One PostgreSQL session.
pub struct PostgresConnection {
    client: Client,
}

impl PostgresConnection {
    async fn batch(&self, sql: &str) -> DbResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| from_driver(&e))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<Vec<Row>> {
        let positional = rewrite_placeholders(sql);
        let values = bind(&positional.names, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        let Some(wrapped) = json_rows_sql(&positional.sql) else {
            self.client
                .execute(positional.sql.as_str(), &refs)
                .await
                .map_err(|e| from_driver(&e))?;
            return Ok(Vec::new());
        };

        let rows = self
            .client
            .query(wrapped.as_str(), &refs)
            .await
            .map_err(|e| from_driver(&e))?;
        rows.iter()
            .map(|row| {
                let text: String = row.try_get(0).map_err(|e| from_driver(&e))?;
                serde_json::from_str::<Row>(&text).map_err(|e| {
                    DbError::new(DbErrorKind::Other, format!("undecodable row: {e}"))
                })
            })
            .collect()
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.batch("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.batch(&format!("SAVEPOINT {}", quote_ident(name))).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.batch(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.batch(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The JSON-row form of a row-returning statement, `None` for other statements.
///
/// The outer query is a bare scan of `q` with no join, grouping or sort of its own,
/// so rows come back in the order the inner statement produced them. `index` relies
/// on this for its `ORDER BY`; the wrapper must never add clauses that reorder.
fn json_rows_sql(sql: &str) -> Option<String> {
    let trimmed = sql.trim_start();
    let head = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let returns_rows = matches!(head.as_str(), "SELECT" | "WITH" | "VALUES")
        || trimmed.to_ascii_uppercase().contains(" RETURNING ");
    returns_rows.then(|| format!("WITH q AS ({trimmed}) SELECT row_to_json(q)::text FROM q"))
}
