//! Registry of the SQL dialects a dataset can be served from.
//!
//! Every dataset names a backend in its configuration (`postgres`, `mssql`, ...). This
//! module maps those names onto a [`Dialect`] and records how far each dialect is
//! supported: SQL generation, a bundled database backend, and a database-side window
//! aggregate for the overall extent of a feature index.
//!
//! # Examples
//!
//! ```
//! use geocrud_core_common::dialects::{Dialect, find_dialect};
//!
//! let info = find_dialect("PostgreSQL").expect("postgres alias should resolve");
//! assert_eq!(info.dialect, Dialect::Postgis);
//! assert!(info.capabilities.backend.is_supported());
//! ```

use std::fmt;
use std::str::FromStr;

/// Support status of a dialect capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportStatus {
    /// The capability is implemented.
    Supported,
    /// The dialect cannot provide the capability.
    NotSupported,
    /// The capability is planned but not shipped.
    Planned,
}

impl SupportStatus {
    /// Returns `true` if the capability is implemented.
    ///
    /// # Examples
    ///
    /// ```
    /// use geocrud_core_common::dialects::SupportStatus;
    ///
    /// assert!(SupportStatus::Supported.is_supported());
    /// assert!(!SupportStatus::Planned.is_supported());
    /// ```
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self, SupportStatus::Supported)
    }

    /// Returns `true` if the capability is supported or planned.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self, SupportStatus::NotSupported)
    }

    /// Returns the display form of this status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            SupportStatus::Supported => "Supported",
            SupportStatus::NotSupported => "Not Supported",
            SupportStatus::Planned => "Planned",
        }
    }
}

/// SQL dialects with a spatial mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL with the PostGIS extension.
    Postgis,
    /// Microsoft SQL Server spatial types.
    MsSql,
}

impl Dialect {
    /// Canonical backend name as used in dataset configuration.
    #[must_use]
    pub const fn backend_name(self) -> &'static str {
        match self {
            Dialect::Postgis => "postgres",
            Dialect::MsSql => "mssql",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.backend_name())
    }
}

/// Error returned when a backend name matches no registered dialect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dialect '{name}'")]
pub struct UnknownDialect {
    /// The name that failed to resolve.
    pub name: String,
}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        find_dialect(s)
            .map(|info| info.dialect)
            .ok_or_else(|| UnknownDialect {
                name: s.to_string(),
            })
    }
}

/// Capabilities of a dialect.
#[derive(Debug, Clone, Copy)]
pub struct DialectCapabilities {
    /// Spatial SQL fragments can be generated for this dialect.
    pub sql: SupportStatus,
    /// A database backend ships with this workspace.
    pub backend: SupportStatus,
    /// The overall extent of an index query is computed by a window aggregate.
    pub window_extent: SupportStatus,
}

/// Registry entry for one dialect.
#[derive(Debug, Clone)]
pub struct DialectInfo {
    /// Canonical backend name (e.g. `"postgres"`).
    pub short_name: &'static str,
    /// Descriptive name for display.
    pub long_name: &'static str,
    /// Alternative names accepted in configuration.
    pub aliases: &'static [&'static str],
    /// The dialect this entry describes.
    pub dialect: Dialect,
    /// What is implemented for this dialect.
    pub capabilities: DialectCapabilities,
}

impl DialectInfo {
    /// Creates a registry entry.
    #[must_use]
    pub const fn new(
        dialect: Dialect,
        long_name: &'static str,
        aliases: &'static [&'static str],
        sql: SupportStatus,
        backend: SupportStatus,
        window_extent: SupportStatus,
    ) -> Self {
        Self {
            short_name: dialect.backend_name(),
            long_name,
            aliases,
            dialect,
            capabilities: DialectCapabilities {
                sql,
                backend,
                window_extent,
            },
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.short_name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Returns every registered dialect.
#[must_use]
pub fn get_dialects() -> Vec<DialectInfo> {
    vec![
        DialectInfo::new(
            Dialect::Postgis,
            "PostgreSQL / PostGIS",
            &["postgresql", "postgis", "pg"],
            SupportStatus::Supported,
            SupportStatus::Supported,
            SupportStatus::Supported,
        ),
        DialectInfo::new(
            Dialect::MsSql,
            "Microsoft SQL Server (spatial)",
            &["sqlserver", "mssql-server", "tsql"],
            SupportStatus::Supported,
            SupportStatus::Planned,
            SupportStatus::NotSupported,
        ),
    ]
}

/// Finds a dialect by backend name or alias, ignoring ASCII case.
#[must_use]
pub fn find_dialect(name: &str) -> Option<DialectInfo> {
    let name = name.trim();
    get_dialects().into_iter().find(|d| d.matches(name))
}

/// Returns the canonical names of all dialects.
#[must_use]
pub fn get_dialect_names() -> Vec<&'static str> {
    get_dialects().iter().map(|d| d.short_name).collect()
}
