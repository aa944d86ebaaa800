//! Message catalog for user-facing error text.
//!
//! Every message the provider hands back to a client goes through a [`Translator`].
//! [`DefaultTranslator`] carries the English catalog and can be overlaid with a JSON
//! object of `key -> template` pairs for other languages. Templates use `{}` as
//! positional placeholders.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Resolves message keys to localized text.
pub trait Translator: Send + Sync {
    /// Returns the message for `key` with `args` substituted in order.
    fn tr(&self, key: &str, args: &[&str]) -> String;
}

/// English catalog with optional overrides.
#[derive(Debug, Clone, Default)]
pub struct DefaultTranslator {
    overrides: HashMap<String, String>,
}

impl DefaultTranslator {
    /// Creates a translator with the built-in English catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides a single template.
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), template.into());
        self
    }

    /// Loads overrides from a JSON object of string templates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the text is not a JSON object of strings.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let overrides: HashMap<String, String> =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidOption {
                option: "translations".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { overrides })
    }

    /// Loads overrides from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidOption {
            option: "translations".to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    fn template(&self, key: &str) -> Option<&str> {
        self.overrides
            .get(key)
            .map(String::as_str)
            .or_else(|| catalog(key))
    }
}

impl Translator for DefaultTranslator {
    fn tr(&self, key: &str, args: &[&str]) -> String {
        match self.template(key) {
            Some(template) => substitute(template, args),
            None => key.to_string(),
        }
    }
}

/// Replaces each `{}` in `template` with the next argument.
///
/// Surplus placeholders are kept verbatim; surplus arguments are ignored.
#[must_use]
pub fn substitute(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(arg) => out.push_str(arg),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

fn catalog(key: &str) -> Option<&'static str> {
    let text = match key {
        "validation.geojson_must_be_feature" => "GeoJSON must be of type Feature",
        "validation.invalid_geojson_feature" => "Invalid GeoJSON feature",
        "validation.missing_geojson_geom" => "Missing GeoJSON geometry",
        "validation.geom_not_null" => "Geometry may not be null",
        "validation.invalid_geojson_geom" => "Invalid GeoJSON geometry",
        "validation.missing_geojson_geom_type" => "Missing GeoJSON geometry type",
        "validation.invalid_geojson_geom_type" => "Invalid GeoJSON geometry type",
        "validation.missing_geojson_geom_coo" => "Missing GeoJSON geometry coordinates",
        "validation.invalid_geojson_geom_coo" => "Invalid GeoJSON geometry coordinates",
        "validation.missing_geojson_props" => "Missing GeoJSON properties",
        "validation.invalid_geojson_props" => "Invalid GeoJSON properties",
        "validation.feature_prop_cannot_be_set" => "Feature property '{}' can not be set",
        "validation.invalid_type_for_prop" => "Invalid type for feature property '{}'",
        "validation.missing_geojson_crs" => "Missing GeoJSON CRS",
        "validation.invalid_geojson_crs" => "Invalid GeoJSON CRS",
        "validation.geojson_crs_must_be_type_name" => "GeoJSON CRS must be of type 'name'",
        "validation.missing_geojson_crs_props" => "Missing GeoJSON CRS properties",
        "validation.invalid_geojson_crs_props" => "Invalid GeoJSON CRS properties",
        "validation.geojson_crs_is_not_ogc_urn" => {
            "GeoJSON CRS is not an OGC CRS URN (e.g. 'urn:ogc:def:crs:EPSG::4326')"
        },
        "validation.empty_or_incomplete_geom" => "Empty or incomplete geometry",
        "validation.duplicate_point" => "Duplicated point",
        "validation.invalid_geom_type" => "Invalid geometry type: {} is not a {}",
        "validation.invalid_value" => "Invalid value for '{}' for type {}",
        "validation.value_must_be_shorter_than" => {
            "Value for '{}' must be shorter than {} characters"
        },
        "validation.value_must_be_geq_to" => "Value for '{}' must be greater than or equal to {}",
        "validation.value_must_be_leq_to" => "Value for '{}' must be less than or equal to {}",
        "validation.invalid_value_for" => "Invalid value for '{}'",
        "validation.missing_required_value_for" => "Missing required value for '{}'",
        "validation.value_for_cannot_be_blank" => "Value for '{}' can not be blank",
        "filter.empty_expression" => "Empty expression",
        "filter.invalid_json" => "Invalid JSON",
        "filter.not_an_array" => "Not an array",
        "filter.invalid_concatenation" => "Invalid concatenation operator '{}'",
        "filter.concatenation_position" => "Incorrect concatenation operator position for '{}'",
        "filter.empty_list" => "Empty list in expression",
        "filter.entry_count" => "Incorrect number of entries in {}",
        "filter.invalid_column" => "Invalid column name in {}",
        "filter.unknown_column" => "Column name not found or permission error in {}",
        "filter.invalid_operator" => "Invalid operator in {}",
        "filter.invalid_value_type" => "Invalid value type in {}",
        "filter.invalid_entry" => "Invalid entry: {}",
        "request.invalid_bbox" => "Invalid bounding box",
        "request.invalid_crs" => "Invalid CRS",
        "request.invalid_filter" => "Invalid filter expression",
        "request.invalid_filter_geom" => "Invalid filter geometry",
        "request.method_not_allowed" => "Method '{}' not allowed for this dataset",
        "request.not_found" => "Feature not found",
        "request.feature_validation_failed" => "Feature validation failed",
        "request.feature_commit_failed" => "Feature commit failed",
        _ => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_substitution() {
        let tr = DefaultTranslator::new();
        assert_eq!(
            tr.tr("validation.invalid_geom_type", &["LINESTRING", "POLYGON"]),
            "Invalid geometry type: LINESTRING is not a POLYGON"
        );
        assert_eq!(
            tr.tr("validation.value_must_be_shorter_than", &["name", "10"]),
            "Value for 'name' must be shorter than 10 characters"
        );
    }

    #[test]
    fn test_unknown_key_returned_verbatim() {
        let tr = DefaultTranslator::new();
        assert_eq!(tr.tr("validation.unknown", &["x"]), "validation.unknown");
    }

    #[test]
    fn test_overrides() {
        let tr = DefaultTranslator::from_json_str(
            r#"{"validation.duplicate_point": "Doppelter Punkt"}"#,
        )
        .unwrap()
        .with_override("validation.invalid_value_for", "Ungültiger Wert für '{}'");
        assert_eq!(tr.tr("validation.duplicate_point", &[]), "Doppelter Punkt");
        assert_eq!(tr.tr("validation.invalid_value_for", &["a"]), "Ungültiger Wert für 'a'");
        assert_eq!(tr.tr("validation.geom_not_null", &[]), "Geometry may not be null");
    }

    #[test]
    fn test_invalid_overrides() {
        let err = DefaultTranslator::from_json_str("[1, 2]").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { ref option, .. } if option == "translations"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("de.json");
        std::fs::write(&path, r#"{"request.not_found": "Nicht gefunden"}"#).unwrap();
        let tr = DefaultTranslator::from_file(&path).unwrap();
        assert_eq!(tr.tr("request.not_found", &[]), "Nicht gefunden");
        assert!(DefaultTranslator::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_substitute_surplus() {
        assert_eq!(substitute("{} and {}", &["a"]), "a and {}");
        assert_eq!(substitute("plain", &["a"]), "plain");
    }
}
