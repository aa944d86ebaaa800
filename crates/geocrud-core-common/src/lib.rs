//! Common types and traits shared across `geocrud` crates.
//!
//! This crate holds the abstractions that both `geocrud-core` and the database
//! backends depend on, so backends never need the core: the dialect registry, the
//! database handle traits, and an in-memory database for tests.

pub mod db;
pub mod dialects;
pub mod testing;

#[doc(hidden)]
pub use serde_json as __serde_json;

// Re-export commonly used types
pub use db::{Connection, Database, DbError, DbErrorKind, DbResult, Params, Row, Savepoint};
pub use dialects::{Dialect, DialectCapabilities, DialectInfo, SupportStatus, find_dialect};
