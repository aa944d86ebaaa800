//! Dataset configuration.
//!
//! A [`DatasetConfig`] is the permission-resolved description of one dataset: the
//! table, its primary key, the attributes the caller may see and write, per-field
//! constraints, geometry metadata, join tables and CRUD flags. It is produced by the
//! permission layer (usually as JSON) and is never mutated by the provider.
//!
//! # Examples
//!
//! ```
//! use geocrud_core::config::{DatasetConfig, FieldSpec, GeometryType};
//!
//! let config = DatasetConfig::builder("qwc_geodb", "edit_polygons", "id")
//!     .with_attribute("name", FieldSpec::new("character varying"))
//!     .with_geometry("geom", GeometryType::parse("Polygon").unwrap(), 2056)
//!     .with_writable(true)
//!     .build()
//!     .expect("valid config");
//!
//! assert!(config.permissions().creatable);
//! assert_eq!(config.attributes, vec!["name"]);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use geocrud_core_common::{Database, Dialect, find_dialect};

use crate::error::{ConfigError, dialect_not_found};

fn default_backend() -> String {
    "postgres".to_string()
}

/// Permission-resolved configuration of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Database schema of the base table.
    pub schema: String,
    /// Base table name.
    pub table_name: String,
    /// Primary key column.
    pub primary_key: String,
    /// Permitted attributes, in output order.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Field metadata by attribute name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Join tables by name, referenced from [`JoinField::table`].
    #[serde(default)]
    pub jointables: BTreeMap<String, JoinTable>,
    /// Geometry column, `None` for datasets without geometry.
    #[serde(default)]
    pub geometry_column: Option<String>,
    /// Expected geometry type; `None` behaves like the `Geometry` wildcard.
    #[serde(default)]
    pub geometry_type: Option<GeometryType>,
    /// Native SRID of the geometry column.
    #[serde(default)]
    pub srid: Option<i32>,
    /// Whether features may have a NULL geometry.
    #[serde(default)]
    pub allow_null_geometry: bool,
    /// Default for the create/update/delete flags.
    #[serde(default)]
    pub writable: bool,
    /// Create permission; defaults to `writable`.
    #[serde(default)]
    pub creatable: Option<bool>,
    /// Read permission; defaults to `true`.
    #[serde(default)]
    pub readable: Option<bool>,
    /// Update permission; defaults to `writable`.
    #[serde(default)]
    pub updatable: Option<bool>,
    /// Delete permission; defaults to `writable`.
    #[serde(default)]
    pub deletable: Option<bool>,
    /// Backend name, resolved through the dialect registry.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Pre-authorized row filter appended to every row-level query.
    #[serde(default)]
    pub datasource_filter: Option<String>,
    /// Connection name for reads.
    #[serde(default)]
    pub database_read: Option<String>,
    /// Connection name for writes; falls back to `database_read`.
    #[serde(default)]
    pub database_write: Option<String>,
    /// Compare geometry types without the `Z` suffix.
    #[serde(default)]
    pub relaxed_z_match: bool,
}

/// Field metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Native type name (`integer`, `character varying`, `USER-DEFINED`, ...) or a
    /// logical alias such as `json`, `jsonb` or `file`.
    #[serde(default = "FieldSpec::default_data_type")]
    pub data_type: String,
    /// Value constraints.
    #[serde(default)]
    pub constraints: FieldConstraints,
    /// Source of a joined attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joinfield: Option<JoinField>,
}

impl FieldSpec {
    fn default_data_type() -> String {
        "text".to_string()
    }

    /// Creates a field of `data_type` without constraints.
    #[must_use]
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            constraints: FieldConstraints::default(),
            joinfield: None,
        }
    }

    /// Sets the constraints.
    #[must_use]
    pub fn with_constraints(mut self, constraints: FieldConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Marks the field as sourced from `field` of join table `table`.
    #[must_use]
    pub fn with_joinfield(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.joinfield = Some(JoinField {
            table: table.into(),
            field: field.into(),
        });
        self
    }

    /// Returns `true` for `json` and `jsonb` fields.
    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self.data_type.as_str(), "json" | "jsonb")
    }
}

/// Constraints on a field value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    /// Managed by the database; never written or validated.
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
    /// Must be present, non-null and non-blank.
    #[serde(default)]
    pub required: bool,
    /// Never returned on reads.
    #[serde(default)]
    pub hidden: bool,
    /// Maximum length of the value's text form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxlength: Option<usize>,
    /// Inclusive lower bound (number or numeric string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    /// Inclusive upper bound (number or numeric string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    /// Precision of a `numeric` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_precision: Option<u32>,
    /// Scale of a `numeric` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_scale: Option<u32>,
    /// Enumerated permitted values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ValueOption>,
    /// The stored value is a serialized list of enumerated values.
    #[serde(default, rename = "allowMulti")]
    pub allow_multi: bool,
    /// Lazy foreign enumeration as `table:key_column:label_column`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyvalrel: Option<String>,
    /// Drop the attribute when its column does not exist.
    #[serde(default)]
    pub only_if_exists: bool,
}

/// One enumerated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueOption {
    /// Stored value.
    pub value: Value,
    /// Display label.
    #[serde(default)]
    pub label: String,
}

/// Source column of a joined attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinField {
    /// Key into [`DatasetConfig::jointables`].
    pub table: String,
    /// Column in the join table.
    pub field: String,
}

/// A table joined to the base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    /// Schema of the join table; defaults to the base schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Join table name.
    pub table_name: String,
    /// Column of the base table holding the join value.
    #[serde(rename = "targetField")]
    pub target_field: String,
    /// Column of the join table matched against `target_field`.
    #[serde(rename = "joinField")]
    pub join_field: String,
}

/// Resolved CRUD permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    /// Features may be created.
    pub creatable: bool,
    /// Features may be listed and read.
    pub readable: bool,
    /// Features may be updated.
    pub updatable: bool,
    /// Features may be deleted.
    pub deletable: bool,
}

/// OGC simple geometry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    /// POINT
    Point,
    /// LINESTRING
    LineString,
    /// POLYGON
    Polygon,
    /// MULTIPOINT
    MultiPoint,
    /// MULTILINESTRING
    MultiLineString,
    /// MULTIPOLYGON
    MultiPolygon,
    /// GEOMETRYCOLLECTION
    GeometryCollection,
}

impl GeometryKind {
    const ALL: [GeometryKind; 7] = [
        GeometryKind::Point,
        GeometryKind::LineString,
        GeometryKind::Polygon,
        GeometryKind::MultiPoint,
        GeometryKind::MultiLineString,
        GeometryKind::MultiPolygon,
        GeometryKind::GeometryCollection,
    ];

    /// Upper-case type name as reported by the database.
    #[must_use]
    pub fn db_name(self) -> &'static str {
        match self {
            GeometryKind::Point => "POINT",
            GeometryKind::LineString => "LINESTRING",
            GeometryKind::Polygon => "POLYGON",
            GeometryKind::MultiPoint => "MULTIPOINT",
            GeometryKind::MultiLineString => "MULTILINESTRING",
            GeometryKind::MultiPolygon => "MULTIPOLYGON",
            GeometryKind::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }

    /// Parses a GeoJSON or database type name, ignoring case.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.db_name().eq_ignore_ascii_case(name))
    }
}

/// Configured geometry type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryType {
    /// Any geometry is accepted.
    Any,
    /// A specific kind, optionally with Z ordinates.
    Typed {
        /// The simple geometry kind
        kind: GeometryKind,
        /// Whether coordinates carry Z
        z: bool,
    },
}

impl GeometryType {
    /// Parses names like `Geometry`, `Polygon`, `POINTZ` or `MultiLineString Z`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let compact: String = name.split_whitespace().collect();
        if compact.eq_ignore_ascii_case("geometry") {
            return Some(GeometryType::Any);
        }
        if let Some(kind) = GeometryKind::parse(&compact) {
            return Some(GeometryType::Typed { kind, z: false });
        }
        let base = compact
            .strip_suffix('Z')
            .or_else(|| compact.strip_suffix('z'))?;
        GeometryKind::parse(base).map(|kind| GeometryType::Typed { kind, z: true })
    }

    /// Returns `true` for the wildcard.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, GeometryType::Any)
    }

    /// Canonical name: `GEOMETRY` or the upper-case kind with a `Z` suffix if 3D.
    #[must_use]
    pub fn db_name(&self) -> String {
        match self {
            GeometryType::Any => "GEOMETRY".to_string(),
            GeometryType::Typed { kind, z } => {
                format!("{}{}", kind.db_name(), if *z { "Z" } else { "" })
            },
        }
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.db_name())
    }
}

impl Serialize for GeometryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.db_name())
    }
}

impl<'de> Deserialize<'de> for GeometryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        GeometryType::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown geometry type '{name}'")))
    }
}

impl DatasetConfig {
    /// Starts a builder for a dataset on `schema.table` keyed by `primary_key`.
    #[must_use]
    pub fn builder(
        schema: impl Into<String>,
        table_name: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> DatasetConfigBuilder {
        DatasetConfigBuilder {
            config: DatasetConfig {
                schema: schema.into(),
                table_name: table_name.into(),
                primary_key: primary_key.into(),
                attributes: Vec::new(),
                fields: BTreeMap::new(),
                jointables: BTreeMap::new(),
                geometry_column: None,
                geometry_type: None,
                srid: None,
                allow_null_geometry: false,
                writable: false,
                creatable: None,
                readable: None,
                updatable: None,
                deletable: None,
                backend: default_backend(),
                datasource_filter: None,
                database_read: None,
                database_write: None,
                relaxed_z_match: false,
            },
        }
    }

    /// Parses a configuration from JSON and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for malformed JSON, or any error from
    /// [`DatasetConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: DatasetConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidOption {
                option: "dataset".to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved CRUD permissions.
    #[must_use]
    pub fn permissions(&self) -> Permissions {
        Permissions {
            creatable: self.creatable.unwrap_or(self.writable),
            readable: self.readable.unwrap_or(true),
            updatable: self.updatable.unwrap_or(self.writable),
            deletable: self.deletable.unwrap_or(self.writable),
        }
    }

    /// Resolves the configured backend to a dialect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownDialect`] if the backend name is unknown.
    pub fn dialect(&self) -> Result<Dialect, ConfigError> {
        find_dialect(&self.backend)
            .map(|d| d.dialect)
            .ok_or_else(|| dialect_not_found(&self.backend))
    }

    /// Field metadata of `attribute`, if any.
    #[must_use]
    pub fn field(&self, attribute: &str) -> Option<&FieldSpec> {
        self.fields.get(attribute)
    }

    /// Returns `true` if `attribute` is hidden on reads.
    #[must_use]
    pub fn is_hidden(&self, attribute: &str) -> bool {
        self.field(attribute)
            .is_some_and(|f| f.constraints.hidden)
    }

    /// Checks required options and internal references.
    ///
    /// # Errors
    ///
    /// Returns the first problem found as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (option, value) in [
            ("schema", &self.schema),
            ("table_name", &self.table_name),
            ("primary_key", &self.primary_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    option: option.to_string(),
                });
            }
        }

        self.dialect()?;

        if let Some(geometry_column) = &self.geometry_column {
            if geometry_column.trim().is_empty() {
                return Err(ConfigError::InvalidOption {
                    option: "geometry_column".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            match self.srid {
                None => {
                    return Err(ConfigError::MissingRequired {
                        option: "srid".to_string(),
                    });
                },
                Some(srid) if srid <= 0 => {
                    return Err(ConfigError::InvalidOption {
                        option: "srid".to_string(),
                        message: format!("{srid} is not a positive SRID"),
                    });
                },
                Some(_) => {},
            }
        }

        let mut seen = std::collections::HashSet::new();
        for attribute in &self.attributes {
            if !seen.insert(attribute) {
                return Err(ConfigError::InvalidOption {
                    option: "attributes".to_string(),
                    message: format!("duplicate attribute '{attribute}'"),
                });
            }
        }

        for (attribute, field) in &self.fields {
            if let Some(joinfield) = &field.joinfield {
                if !self.jointables.contains_key(&joinfield.table) {
                    return Err(ConfigError::InvalidOption {
                        option: "fields".to_string(),
                        message: format!(
                            "attribute '{attribute}' joins unknown table '{}'",
                            joinfield.table
                        ),
                    });
                }
            }
            if let (Some(p), Some(s)) = (
                field.constraints.numeric_precision,
                field.constraints.numeric_scale,
            ) {
                if s > p {
                    return Err(ConfigError::InvalidOption {
                        option: "fields".to_string(),
                        message: format!(
                            "attribute '{attribute}' has numeric scale {s} above precision {p}"
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Builder for [`DatasetConfig`].
#[derive(Debug, Clone)]
pub struct DatasetConfigBuilder {
    config: DatasetConfig,
}

impl DatasetConfigBuilder {
    /// Appends a permitted attribute with its field metadata.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, field: FieldSpec) -> Self {
        let name = name.into();
        self.config.attributes.push(name.clone());
        self.config.fields.insert(name, field);
        self
    }

    /// Registers a join table under `name`.
    #[must_use]
    pub fn with_jointable(mut self, name: impl Into<String>, table: JoinTable) -> Self {
        self.config.jointables.insert(name.into(), table);
        self
    }

    /// Sets the geometry column, type and native SRID.
    #[must_use]
    pub fn with_geometry(
        mut self,
        column: impl Into<String>,
        geometry_type: GeometryType,
        srid: i32,
    ) -> Self {
        self.config.geometry_column = Some(column.into());
        self.config.geometry_type = Some(geometry_type);
        self.config.srid = Some(srid);
        self
    }

    /// Allows NULL geometries.
    #[must_use]
    pub fn with_allow_null_geometry(mut self, allow: bool) -> Self {
        self.config.allow_null_geometry = allow;
        self
    }

    /// Sets the default for the create, update and delete permissions.
    #[must_use]
    pub fn with_writable(mut self, writable: bool) -> Self {
        self.config.writable = writable;
        self
    }

    /// Overrides individual permissions.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.config.creatable = Some(permissions.creatable);
        self.config.readable = Some(permissions.readable);
        self.config.updatable = Some(permissions.updatable);
        self.config.deletable = Some(permissions.deletable);
        self
    }

    /// Sets the backend name.
    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.config.backend = backend.into();
        self
    }

    /// Sets the row-level datasource filter.
    #[must_use]
    pub fn with_datasource_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.datasource_filter = Some(filter.into());
        self
    }

    /// Compares geometry types without the `Z` suffix.
    #[must_use]
    pub fn with_relaxed_z_match(mut self, relaxed: bool) -> Self {
        self.config.relaxed_z_match = relaxed;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns any error from [`DatasetConfig::validate`].
    pub fn build(self) -> Result<DatasetConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Read and write database handles of a dataset.
#[derive(Clone)]
pub struct DbHandles {
    /// Handle for read-only queries and validation probes.
    pub read: Arc<dyn Database>,
    /// Handle for write transactions.
    pub write: Arc<dyn Database>,
}

impl DbHandles {
    /// Uses separate handles for reads and writes.
    #[must_use]
    pub fn new(read: Arc<dyn Database>, write: Arc<dyn Database>) -> Self {
        Self { read, write }
    }

    /// Uses one handle for reads and writes.
    #[must_use]
    pub fn shared(db: Arc<dyn Database>) -> Self {
        Self {
            read: Arc::clone(&db),
            write: db,
        }
    }
}

impl fmt::Debug for DbHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbHandles").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> Value {
        json!({
            "schema": "qwc_geodb",
            "table_name": "edit_points",
            "primary_key": "id",
            "attributes": ["name", "type", "owner"],
            "fields": {
                "name": {"data_type": "character varying", "constraints": {"maxlength": 32, "required": true}},
                "type": {"data_type": "smallint", "constraints": {"values": [{"value": 1, "label": "A"}]}},
                "owner": {"data_type": "text", "joinfield": {"table": "owners", "field": "name"}}
            },
            "jointables": {
                "owners": {"schema": "public", "table_name": "owners", "targetField": "owner_id", "joinField": "id"}
            },
            "geometry_column": "geom",
            "geometry_type": "POINTZ",
            "srid": 2056,
            "writable": true,
            "deletable": false
        })
    }

    #[test]
    fn test_deserialize_and_permissions() {
        let config = DatasetConfig::from_json_str(&sample_json().to_string()).unwrap();
        assert_eq!(config.backend, "postgres");
        assert_eq!(
            config.geometry_type,
            Some(GeometryType::Typed {
                kind: GeometryKind::Point,
                z: true
            })
        );
        assert_eq!(config.fields["name"].constraints.maxlength, Some(32));
        assert_eq!(config.jointables["owners"].target_field, "owner_id");
        let perms = config.permissions();
        assert!(perms.creatable && perms.readable && perms.updatable);
        assert!(!perms.deletable);
    }

    #[test]
    fn test_read_only_defaults() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("writable");
        value.as_object_mut().unwrap().remove("deletable");
        let config: DatasetConfig = serde_json::from_value(value).unwrap();
        let perms = config.permissions();
        assert!(perms.readable);
        assert!(!perms.creatable && !perms.updatable && !perms.deletable);
    }

    #[test]
    fn test_validate_errors() {
        let mut value = sample_json();
        value["backend"] = json!("oracle");
        let err = DatasetConfig::from_json_str(&value.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDialect { .. }));

        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("srid");
        let err = DatasetConfig::from_json_str(&value.to_string()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                option: "srid".to_string()
            }
        );

        let mut value = sample_json();
        value["fields"]["owner"]["joinfield"]["table"] = json!("nowhere");
        let err = DatasetConfig::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("joins unknown table 'nowhere'"));

        let err = DatasetConfig::builder("s", " ", "id").build().unwrap_err();
        assert_eq!(err.to_string(), "Missing required option: table_name");
    }

    #[test]
    fn test_geometry_type_names() {
        assert_eq!(GeometryType::parse("Geometry"), Some(GeometryType::Any));
        assert_eq!(
            GeometryType::parse("MultiPolygon").map(|t| t.db_name()),
            Some("MULTIPOLYGON".to_string())
        );
        assert_eq!(
            GeometryType::parse("LineString Z").map(|t| t.db_name()),
            Some("LINESTRINGZ".to_string())
        );
        assert_eq!(GeometryType::parse("Curve"), None);
    }

    #[test]
    fn test_bounds_from_strings() {
        let constraints: FieldConstraints =
            serde_json::from_value(json!({"min": "-9223372036854775808", "max": 10})).unwrap();
        assert_eq!(constraints.min, Some(json!("-9223372036854775808")));
        assert_eq!(constraints.max, Some(json!(10)));
    }
}
