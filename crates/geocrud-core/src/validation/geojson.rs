//! Structural checks on the raw payload.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::{DatasetConfig, GeometryKind};
use crate::i18n::Translator;

static CRS_URN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^urn:ogc:def:crs:EPSG::\d{1,6}$").unwrap());

/// Checks the GeoJSON shape of `feature`.
pub(super) fn check_structure(
    feature: &Value,
    new_feature: bool,
    config: &DatasetConfig,
    tr: &dyn Translator,
) -> Vec<String> {
    let mut errors = Vec::new();

    if feature.get("type").and_then(Value::as_str) != Some("Feature") {
        errors.push(tr.tr("validation.geojson_must_be_feature", &[]));
    }

    let geometry = feature.get("geometry");
    let has_geometry = geometry.is_some_and(|g| !g.is_null());
    match geometry {
        None if new_feature && !config.allow_null_geometry => {
            errors.push(tr.tr("validation.missing_geojson_geom", &[]));
        },
        Some(Value::Null) if !config.allow_null_geometry => {
            errors.push(tr.tr("validation.geom_not_null", &[]));
        },
        Some(geometry) if !geometry.is_null() => check_geometry_shape(geometry, tr, &mut errors),
        _ => {},
    }

    match feature.get("properties") {
        None => errors.push(tr.tr("validation.missing_geojson_props", &[])),
        Some(Value::Object(properties)) => {
            for (attribute, value) in properties {
                if !config.attributes.contains(attribute) {
                    errors.push(
                        tr.tr("validation.feature_prop_cannot_be_set", &[attribute.as_str()]),
                    );
                    continue;
                }
                let is_json = config.field(attribute).is_some_and(|f| f.is_json());
                if matches!(value, Value::Array(_) | Value::Object(_)) && !is_json {
                    errors.push(tr.tr("validation.invalid_type_for_prop", &[attribute.as_str()]));
                }
            }
        },
        Some(_) => errors.push(tr.tr("validation.invalid_geojson_props", &[])),
    }

    match feature.get("crs") {
        Some(crs) if !crs.is_null() => check_crs(Some(crs), tr, &mut errors),
        _ if has_geometry => check_crs(None, tr, &mut errors),
        _ => {},
    }

    errors
}

fn check_geometry_shape(geometry: &Value, tr: &dyn Translator, errors: &mut Vec<String>) {
    let Value::Object(geometry) = geometry else {
        errors.push(tr.tr("validation.invalid_geojson_geom", &[]));
        return;
    };

    let kind = match geometry.get("type") {
        None => {
            errors.push(tr.tr("validation.missing_geojson_geom_type", &[]));
            None
        },
        Some(Value::String(name)) => match GeometryKind::parse(name) {
            Some(kind) if kind_name_matches(kind, name) => Some(kind),
            _ => {
                errors.push(tr.tr("validation.invalid_geojson_geom_type", &[]));
                None
            },
        },
        Some(_) => {
            errors.push(tr.tr("validation.invalid_geojson_geom_type", &[]));
            None
        },
    };

    // collections carry member geometries instead of coordinates
    let member_key = if kind == Some(GeometryKind::GeometryCollection) {
        "geometries"
    } else {
        "coordinates"
    };
    match geometry.get(member_key) {
        None => errors.push(tr.tr("validation.missing_geojson_geom_coo", &[])),
        Some(Value::Array(_)) => {},
        Some(_) => errors.push(tr.tr("validation.invalid_geojson_geom_coo", &[])),
    }
}

/// GeoJSON type names are case-sensitive: `LineString`, not `LINESTRING`.
fn kind_name_matches(kind: GeometryKind, name: &str) -> bool {
    let expected = match kind {
        GeometryKind::Point => "Point",
        GeometryKind::LineString => "LineString",
        GeometryKind::Polygon => "Polygon",
        GeometryKind::MultiPoint => "MultiPoint",
        GeometryKind::MultiLineString => "MultiLineString",
        GeometryKind::MultiPolygon => "MultiPolygon",
        GeometryKind::GeometryCollection => "GeometryCollection",
    };
    expected == name
}

fn check_crs(crs: Option<&Value>, tr: &dyn Translator, errors: &mut Vec<String>) {
    let crs = match crs {
        None => {
            errors.push(tr.tr("validation.missing_geojson_crs", &[]));
            return;
        },
        Some(Value::Object(crs)) => crs,
        Some(_) => {
            errors.push(tr.tr("validation.invalid_geojson_crs", &[]));
            return;
        },
    };

    if crs.get("type").and_then(Value::as_str) != Some("name") {
        errors.push(tr.tr("validation.geojson_crs_must_be_type_name", &[]));
    }

    match crs.get("properties") {
        None => errors.push(tr.tr("validation.missing_geojson_crs_props", &[])),
        Some(Value::Object(properties)) => {
            let is_urn = properties
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| CRS_URN.is_match(name));
            if !is_urn {
                errors.push(tr.tr("validation.geojson_crs_is_not_ogc_urn", &[]));
            }
        },
        Some(_) => errors.push(tr.tr("validation.invalid_geojson_crs_props", &[])),
    }
}
