//! Spatial dialect adapters.
//!
//! A [`SpatialDialect`] maps the spatial and statement-level operations the provider
//! needs onto one database dialect. Two strategies ship: [`PostgisDialect`] and
//! [`MsSqlDialect`]. The strategy is picked once per dataset with [`create_dialect`],
//! keyed by the [`Dialect`] resolved from the configured backend name.
//!
//! All methods return SQL fragments. Geometry inputs are always bound parameters;
//! SRIDs are integers and the only values interpolated into fragments.
//!
//! # Examples
//!
//! ```
//! use geocrud_core::spatial::create_dialect;
//! use geocrud_core_common::Dialect;
//!
//! let postgis = create_dialect(Dialect::Postgis);
//! assert_eq!(
//!     postgis.transform("\"geom\"", Some(2056), Some(4326)),
//!     "ST_Transform(\"geom\", 4326)"
//! );
//! assert_eq!(postgis.transform("\"geom\"", Some(2056), Some(2056)), "\"geom\"");
//!
//! let mssql = create_dialect(Dialect::MsSql);
//! assert_eq!(mssql.quote_ident("name"), "[name]");
//! ```

mod mssql;
mod postgis;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use geocrud_core_common::Dialect;

pub use mssql::MsSqlDialect;
pub use postgis::PostgisDialect;

/// Severity prefix of an engine message, e.g. `ERROR:` or `Msg 6522, Level 16:`.
static ENGINE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-ZÄÖÜÉÈ]+|Msg \d+[^:]*):\s*").unwrap());

/// Shared PostGIS strategy, used where no dataset dialect is in scope.
pub static POSTGIS: PostgisDialect = PostgisDialect;

/// SQL type used to carry a raw JSON value into a cast probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastSource {
    /// JSON numbers
    Numeric,
    /// JSON booleans
    Boolean,
    /// JSON strings
    Text,
}

impl CastSource {
    /// Picks the source type for a JSON value; `None` for null and containers.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(_) => Some(CastSource::Numeric),
            Value::Bool(_) => Some(CastSource::Boolean),
            Value::String(_) => Some(CastSource::Text),
            _ => None,
        }
    }
}

/// Geometry could not be converted between GeoJSON and the dialect's wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Geometry conversion failed: {message}")]
pub struct GeometryCodecError {
    /// Converter message
    pub message: String,
}

impl GeometryCodecError {
    pub(crate) fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Dialect-specific SQL generation.
pub trait SpatialDialect: Send + Sync + fmt::Debug {
    /// The dialect this strategy implements.
    fn dialect(&self) -> Dialect;

    /// Quotes an identifier.
    fn quote_ident(&self, name: &str) -> String;

    /// Quoted `schema.table`.
    fn qualified_table(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Parses the bound geometry parameter without assigning an SRID.
    fn parse_geometry(&self, param: &str) -> String;

    /// Parses the bound geometry parameter and assigns `srid`.
    fn geom_from_geojson(&self, param: &str, srid: i32) -> String;

    /// Serializes a geometry expression to the dialect's output form.
    fn geom_to_geojson(&self, geom_sql: &str) -> String;

    /// Reprojects a geometry expression to `target_srid`.
    fn transform_to(&self, geom_sql: &str, target_srid: i32) -> String;

    /// Reprojects from `source` to `target`; passes through when they match or
    /// either is unknown.
    fn transform(&self, geom_sql: &str, source: Option<i32>, target: Option<i32>) -> String {
        match (source, target) {
            (Some(source), Some(target)) if source != target => {
                self.transform_to(geom_sql, target)
            },
            _ => geom_sql.to_string(),
        }
    }

    /// Per-row envelope as `BOX(minx miny,maxx maxy)` text.
    fn bbox(&self, geom_sql: &str) -> String;

    /// Window aggregate yielding the extent of all rows, if the dialect has one.
    fn overall_extent(&self, geom_sql: &str) -> Option<String>;

    /// Aggregate yielding the extent of all rows as `BOX(...)` text.
    fn extent_aggregate(&self, geom_sql: &str) -> String;

    /// Envelope built from the `:minx`, `:miny`, `:maxx` and `:maxy` parameters.
    fn make_envelope(&self, srid: i32) -> String;

    /// Boolean predicate: `geom_sql` intersects `other_sql`.
    fn intersects(&self, geom_sql: &str, other_sql: &str) -> String;

    /// Validity flag of a geometry.
    fn is_valid(&self, geom_sql: &str) -> String;

    /// Reason text of an invalid geometry.
    fn validation_reason(&self, geom_sql: &str) -> String;

    /// WKT location of the first validity problem, or NULL.
    fn invalid_location(&self, geom_sql: &str) -> String;

    /// Emptiness flag of a geometry.
    fn is_empty(&self, geom_sql: &str) -> String;

    /// WKT text of a geometry.
    fn as_text(&self, geom_sql: &str) -> String;

    /// Upper-case type name of a geometry, e.g. `POLYGON`.
    fn geometry_type(&self, geom_sql: &str) -> String;

    /// Statement that only parses the bound geometry.
    fn geometry_parse_sql(&self, param: &str) -> String {
        format!("SELECT {} AS geom", self.parse_geometry(param))
    }

    /// Statement returning `valid`, `reason`, `location`, `is_empty`, `wkt_geom` and
    /// `geom_type` of the bound geometry in one row.
    fn geometry_check_sql(&self, param: &str) -> String {
        format!(
            "WITH feature AS (SELECT {parse} AS geom) \
             SELECT {valid} AS valid, {reason} AS reason, {location} AS location, \
             {empty} AS is_empty, {wkt} AS wkt_geom, {kind} AS geom_type FROM feature",
            parse = self.parse_geometry(param),
            valid = self.is_valid("geom"),
            reason = self.validation_reason("geom"),
            location = self.invalid_location("geom"),
            empty = self.is_empty("geom"),
            wkt = self.as_text("geom"),
            kind = self.geometry_type("geom"),
        )
    }

    /// Strips localized severity prefixes (`ERROR:`, `FEHLER:`, ...) from an engine message.
    fn clean_engine_message(&self, message: &str) -> String {
        ENGINE_PREFIX.replace(message.trim(), "").trim().to_string()
    }

    /// Cast probe: `SELECT CAST(CAST(:value AS <source>) AS <target>) AS value`.
    fn cast_probe_sql(&self, source: CastSource, target_type: &str) -> String;

    /// Catalog query for the concrete type of a user-defined column.
    ///
    /// Binds `:schema`, `:table` and `:column`; returns `defined_type`.
    fn catalog_type_sql(&self) -> String;

    /// Catalog query for the columns of a table.
    ///
    /// Binds `:schema` and `:table`; returns `column_name`.
    fn columns_sql(&self) -> String;

    /// `SELECT` statement; `limit_one` restricts the result to the first row.
    fn select_sql(
        &self,
        columns: &str,
        from: &str,
        where_clause: Option<&str>,
        order_by: Option<&str>,
        limit_one: bool,
    ) -> String;

    /// `INSERT` returning the primary key. An empty column list inserts defaults.
    fn insert_sql(&self, table: &str, columns: &[String], values: &[String], pk: &str)
    -> String;

    /// `UPDATE` of `columns` returning the primary key. `columns` is never empty.
    fn update_sql(
        &self,
        table: &str,
        columns: &[String],
        values: &[String],
        where_clause: &str,
        pk: &str,
    ) -> String;

    /// `DELETE` returning the primary key.
    fn delete_sql(&self, table: &str, where_clause: &str, pk: &str) -> String;

    /// Existence probe returning one row with a boolean-like `exists` column.
    fn exists_sql(&self, table: &str, where_clause: &str) -> String;

    /// Bind value for a GeoJSON geometry.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryCodecError`] if the geometry cannot be converted.
    fn encode_geometry_param(
        &self,
        geometry: &geojson::Geometry,
    ) -> Result<Value, GeometryCodecError>;

    /// Bind value for an unchecked GeoJSON geometry object from a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryCodecError`] if the object is not a GeoJSON geometry.
    fn encode_raw_geometry(&self, raw: &Value) -> Result<Value, GeometryCodecError> {
        let geometry: geojson::Geometry =
            serde_json::from_value(raw.clone()).map_err(GeometryCodecError::new)?;
        self.encode_geometry_param(&geometry)
    }

    /// Converts the output of [`SpatialDialect::geom_to_geojson`] back to GeoJSON.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryCodecError`] if the value cannot be parsed.
    fn decode_geometry(&self, value: &Value) -> Result<geojson::Geometry, GeometryCodecError>;
}

/// Creates the strategy for `dialect`.
#[must_use]
pub fn create_dialect(dialect: Dialect) -> Box<dyn SpatialDialect> {
    match dialect {
        Dialect::Postgis => Box::new(PostgisDialect),
        Dialect::MsSql => Box::new(MsSqlDialect),
    }
}

/// Parses GeoJSON geometry text.
pub(crate) fn geometry_from_json_text(text: &str) -> Result<geojson::Geometry, GeometryCodecError> {
    serde_json::from_str(text).map_err(GeometryCodecError::new)
}
