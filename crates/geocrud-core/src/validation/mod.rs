//! Feature payload validation.
//!
//! Validation runs in three phases and stops at the first phase that reports
//! anything:
//!
//! 1. structure: GeoJSON shape, permitted properties, CRS ([`ValidationReport::validation_errors`])
//! 2. geometry: parse, validity, emptiness, repeated vertices and type, checked by
//!    the database ([`ValidationReport::geometry_errors`])
//! 3. fields: every provided value is cast by the database to the column type and
//!    checked against its constraints ([`ValidationReport::data_errors`])
//!
//! Phases 2 and 3 share one read connection inside a transaction that is always
//! rolled back. Each database probe runs in its own [`Savepoint`] so a failed cast
//! never leaves the transaction aborted for the next probe.
//!
//! After a clean field phase the payload's `readOnly` properties and empty hidden
//! properties are removed. Repeating validation on the stripped payload yields the
//! same report.
//!
//! [`Savepoint`]: geocrud_core_common::Savepoint

mod fields;
mod geojson;
mod geometry;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use geocrud_core_common::{Connection, Database, DbResult};

use crate::config::DatasetConfig;
use crate::i18n::Translator;
use crate::spatial::SpatialDialect;

pub use geometry::has_z;
pub(crate) use geometry::flag;

/// One geometry problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeometryError {
    /// Problem description
    pub reason: String,
    /// WKT location of the problem, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl GeometryError {
    /// Creates an error without location.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            location: None,
        }
    }

    /// Attaches a WKT location.
    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {location}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Validation result. At most one category is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Structural problems
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    /// Geometry problems
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub geometry_errors: Vec<GeometryError>,
    /// Field type and constraint problems
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_errors: Vec<String>,
}

impl ValidationReport {
    /// Returns `true` if the feature is valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validation_errors.is_empty()
            && self.geometry_errors.is_empty()
            && self.data_errors.is_empty()
    }

    /// All messages on one line.
    #[must_use]
    pub fn summary(&self) -> String {
        self.messages().join("; ")
    }

    /// One message per line, prefixed with the category.
    #[must_use]
    pub fn details(&self) -> String {
        let (category, messages) = if !self.validation_errors.is_empty() {
            ("validation_errors", self.messages())
        } else if !self.geometry_errors.is_empty() {
            ("geometry_errors", self.messages())
        } else {
            ("data_errors", self.messages())
        };
        messages
            .iter()
            .map(|m| format!("  {category}: {m}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn messages(&self) -> Vec<String> {
        self.validation_errors
            .iter()
            .cloned()
            .chain(self.geometry_errors.iter().map(ToString::to_string))
            .chain(self.data_errors.iter().cloned())
            .collect()
    }
}

/// Per-call working state of the validator. Never shared between calls.
#[derive(Debug, Default)]
pub(crate) struct ValidationScratch {
    /// Concrete types of `USER-DEFINED` columns, looked up once per call
    resolved_types: BTreeMap<String, String>,
    /// Savepoints opened so far
    probes: usize,
}

impl ValidationScratch {
    fn next_savepoint(&mut self, prefix: &str) -> String {
        self.probes += 1;
        format!("{prefix}_{}", self.probes)
    }
}

/// Validates feature payloads against one dataset.
pub struct FeatureValidator<'a> {
    config: &'a DatasetConfig,
    dialect: &'a dyn SpatialDialect,
    db: &'a dyn Database,
    tr: &'a dyn Translator,
}

impl<'a> FeatureValidator<'a> {
    /// Creates a validator using `db` for geometry and cast probes.
    #[must_use]
    pub fn new(
        config: &'a DatasetConfig,
        dialect: &'a dyn SpatialDialect,
        db: &'a dyn Database,
        tr: &'a dyn Translator,
    ) -> Self {
        Self {
            config,
            dialect,
            db,
            tr,
        }
    }

    /// Validates `feature`, stripping `readOnly` and empty hidden properties if the
    /// payload is otherwise valid.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`](geocrud_core_common::DbError) only for failures outside
    /// the anticipated probe errors, e.g. a lost connection.
    pub async fn validate(&self, feature: &mut Value, new_feature: bool) -> DbResult<ValidationReport> {
        let mut report = ValidationReport {
            validation_errors: geojson::check_structure(feature, new_feature, self.config, self.tr),
            ..ValidationReport::default()
        };
        if !report.is_empty() {
            return Ok(report);
        }

        let raw_geometry = self
            .config
            .geometry_column
            .as_ref()
            .and_then(|_| feature.get("geometry"))
            .filter(|g| !g.is_null())
            .cloned();
        if raw_geometry.is_none() && self.config.fields.is_empty() {
            return Ok(report);
        }

        let mut conn = self.db.connect().await?;
        conn.begin().await?;
        let outcome = self
            .probe(&mut *conn, feature, raw_geometry.as_ref(), &mut report)
            .await;
        let rollback = conn.rollback().await;
        outcome?;
        rollback?;
        Ok(report)
    }

    async fn probe(
        &self,
        conn: &mut dyn Connection,
        feature: &mut Value,
        raw_geometry: Option<&Value>,
        report: &mut ValidationReport,
    ) -> DbResult<()> {
        let mut scratch = ValidationScratch::default();
        if let Some(raw_geometry) = raw_geometry {
            report.geometry_errors = geometry::check_geometry(
                &mut *conn,
                self.dialect,
                self.config,
                raw_geometry,
                self.tr,
                &mut scratch,
            )
            .await?;
            if !report.is_empty() {
                return Ok(());
            }
        }
        report.data_errors =
            fields::check_fields(conn, self.config, feature, self.dialect, self.tr, &mut scratch)
                .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_summary() {
        let report = ValidationReport {
            geometry_errors: vec![
                GeometryError::new("Self-intersection").at("POINT(1 1)"),
                GeometryError::new("Duplicated point"),
            ],
            ..ValidationReport::default()
        };
        assert!(!report.is_empty());
        assert_eq!(
            report.summary(),
            "Self-intersection at POINT(1 1); Duplicated point"
        );
        assert_eq!(
            report.details(),
            "  geometry_errors: Self-intersection at POINT(1 1)\n  geometry_errors: Duplicated point"
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"geometry_errors": [
                {"reason": "Self-intersection", "location": "POINT(1 1)"},
                {"reason": "Duplicated point"}
            ]})
        );
    }

    #[test]
    fn test_scratch_savepoint_names() {
        let mut scratch = ValidationScratch::default();
        assert_eq!(scratch.next_savepoint("geometry_probe"), "geometry_probe_1");
        assert_eq!(scratch.next_savepoint("field_probe"), "field_probe_2");
    }
}
