//! Geometry checks, evaluated by the database.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use geocrud_core_common::{Connection, DbErrorKind, DbResult, Row, Savepoint, params};

use super::{GeometryError, ValidationScratch};
use crate::config::{DatasetConfig, GeometryType};
use crate::i18n::Translator;
use crate::spatial::SpatialDialect;

const GEOMETRY_PARAM: &str = "geom";

/// Returns `true` if any coordinate tuple in a GeoJSON coordinate array has three
/// ordinates.
///
/// ```
/// use geocrud_core::validation::has_z;
/// use serde_json::json;
///
/// assert!(has_z(&json!([[0, 0], [1, 1, 5]])));
/// assert!(!has_z(&json!([[[0, 0], [1, 0], [1, 1], [0, 0]]])));
/// ```
#[must_use]
pub fn has_z(coordinates: &Value) -> bool {
    match coordinates {
        Value::Array(items) if items.iter().any(Value::is_array) => items.iter().any(has_z),
        Value::Array(items) => items.len() == 3,
        _ => false,
    }
}

fn geometry_has_z(geometry: &Value) -> bool {
    match geometry.get("geometries") {
        Some(Value::Array(members)) => members.iter().any(geometry_has_z),
        _ => geometry.get("coordinates").is_some_and(has_z),
    }
}

/// Parses and checks `raw` on `conn`, which must be inside a transaction.
pub(super) async fn check_geometry(
    conn: &mut dyn Connection,
    dialect: &dyn SpatialDialect,
    config: &DatasetConfig,
    raw: &Value,
    tr: &dyn Translator,
    scratch: &mut ValidationScratch,
) -> DbResult<Vec<GeometryError>> {
    let param = match dialect.encode_raw_geometry(raw) {
        Ok(param) => param,
        Err(err) => return Ok(vec![GeometryError::new(err.message)]),
    };
    let params = params! { GEOMETRY_PARAM => param };

    let name = scratch.next_savepoint("geometry_probe");
    let mut savepoint = Savepoint::open(&mut *conn, name).await?;
    let parse_sql = dialect.geometry_parse_sql(GEOMETRY_PARAM);
    log::debug!("geometry parse probe: {parse_sql}");
    if let Err(err) = savepoint.execute(&parse_sql, &params).await {
        savepoint.rollback().await?;
        return match err.kind {
            DbErrorKind::Internal | DbErrorKind::Data => {
                Ok(vec![GeometryError::new(dialect.clean_engine_message(&err.message))])
            },
            _ => Err(err),
        };
    }

    let check_sql = dialect.geometry_check_sql(GEOMETRY_PARAM);
    log::debug!("geometry check: {check_sql}");
    let rows = savepoint.execute(&check_sql, &params).await;
    savepoint.rollback().await?;
    let rows = rows?;
    let Some(row) = rows.first() else {
        return Ok(Vec::new());
    };

    let mut errors = Vec::new();
    if !flag(row, "valid").unwrap_or(true) {
        let reason =
            text(row, "reason").unwrap_or_else(|| tr.tr("validation.invalid_geojson_geom", &[]));
        let error = GeometryError::new(reason);
        errors.push(match text(row, "location") {
            Some(location) => error.at(location),
            None => error,
        });
    } else if flag(row, "is_empty").unwrap_or(false) {
        errors.push(GeometryError::new(tr.tr("validation.empty_or_incomplete_geom", &[])));
    }
    if !errors.is_empty() {
        return Ok(errors);
    }

    if let Some(wkt) = text(row, "wkt_geom") {
        for vertex in repeated_vertices(&wkt) {
            errors.push(
                GeometryError::new(tr.tr("validation.duplicate_point", &[]))
                    .at(format!("POINT({vertex})")),
            );
        }
    }
    if !errors.is_empty() {
        return Ok(errors);
    }

    let mut detected = text(row, "geom_type").unwrap_or_default().to_uppercase();
    if geometry_has_z(raw) {
        detected.push('Z');
    }
    if let Some(expected) = config.geometry_type.filter(|t| !t.is_any()) {
        if !type_matches(&expected, &detected, config.relaxed_z_match) {
            errors.push(GeometryError::new(tr.tr(
                "validation.invalid_geom_type",
                &[detected.as_str(), expected.db_name().as_str()],
            )));
        }
    }
    Ok(errors)
}

fn type_matches(expected: &GeometryType, detected: &str, relaxed_z: bool) -> bool {
    let expected = expected.db_name();
    if relaxed_z {
        expected.trim_end_matches('Z') == detected.trim_end_matches('Z')
    } else {
        expected == detected
    }
}

/// Innermost parenthesized WKT group: one ring or line.
static WKT_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([^()]+)\)").unwrap());

/// Vertices equal to their predecessor within one parenthesized WKT group.
fn repeated_vertices(wkt: &str) -> Vec<String> {
    let mut repeated = Vec::new();
    for group in WKT_GROUP.captures_iter(wkt) {
        let vertices: Vec<&str> = group[1].split(',').map(str::trim).collect();
        for pair in vertices.windows(2) {
            if pair[0] == pair[1] {
                repeated.push(pair[1].to_string());
            }
        }
    }
    repeated
}

/// Boolean-like column: `true`/`false`, `1`/`0` or `t`/`f`.
pub(crate) fn flag(row: &Row, column: &str) -> Option<bool> {
    match row.get(column)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.as_str() {
            "t" | "true" | "1" => Some(true),
            "f" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
