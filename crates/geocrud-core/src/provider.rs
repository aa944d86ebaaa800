//! Dataset features provider.
//!
//! [`DatasetFeaturesProvider`] owns one permission-resolved [`DatasetConfig`] and
//! implements the feature operations on it: `index`, `show`, `create`, `update`,
//! `destroy`, `exists`, `extent` and `keyvals`. It composes the filter parser, the
//! spatial dialect, the projection resolver and the validator into single
//! parameterized statements.
//!
//! Reads run on one connection of the read database. Writes validate first (on the
//! read database, always rolled back) and then run in exactly one transaction on the
//! write database, which is committed on success and rolled back on any error.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use geocrud_core::config::{DatasetConfig, DbHandles, FieldSpec};
//! use geocrud_core::i18n::DefaultTranslator;
//! use geocrud_core::provider::{DatasetFeaturesProvider, IndexQuery};
//! use geocrud_core_common::testing::{MockDatabase, rows};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let db = MockDatabase::new();
//! db.on_query("FROM \"public\".\"trees\"", rows(json!([{"id": 1, "species": "oak"}])));
//!
//! let config = DatasetConfig::builder("public", "trees", "id")
//!     .with_attribute("species", FieldSpec::new("text"))
//!     .build()
//!     .unwrap();
//! let provider = DatasetFeaturesProvider::new(
//!     config,
//!     DbHandles::shared(Arc::new(db)),
//!     Arc::new(DefaultTranslator::new()),
//! )
//! .unwrap();
//!
//! let collection = provider.index(&IndexQuery::new()).await.unwrap();
//! assert_eq!(collection.number_matched, 1);
//! assert_eq!(collection.crs, None);
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use geocrud_core_common::{Connection, DbError, DbErrorKind, DbResult, Params, Row, params};

use crate::bbox::Bbox;
use crate::config::{DatasetConfig, DbHandles, FieldSpec, Permissions, ValueOption};
use crate::error::{
    ConfigError, GeoCrudError, Operation, ParseError, Result, ValidationFailure,
};
use crate::feature::{Crs, Feature, FeatureCollection, FeatureId};
use crate::filter::FilterParser;
use crate::i18n::Translator;
use crate::projection::{Projection, resolve_projection};
use crate::spatial::{SpatialDialect, create_dialect};
use crate::validation::{FeatureValidator, GeometryError, ValidationReport, flag};

const GEOMETRY_ALIAS: &str = "__geometry";
const BBOX_ALIAS: &str = "__bbox";
const EXTENT_ALIAS: &str = "__extent";
const ID_PARAM: &str = "__id";
const GEOMETRY_PARAM: &str = "__geom";
const FILTER_GEOMETRY_PARAM: &str = "__filter_geom";

/// Options of [`DatasetFeaturesProvider::index`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexQuery {
    /// Only features intersecting this box, given in `srid`
    pub bbox: Option<Bbox>,
    /// Client SRID of `bbox`, `filter_geom` and the returned geometries
    pub srid: Option<i32>,
    /// JSON filter expression
    pub filter: Option<String>,
    /// Only features intersecting this geometry, given in `srid`
    pub filter_geom: Option<geojson::Geometry>,
    /// Attribute subset to return
    pub fields: Option<Vec<String>>,
    /// Window size
    pub limit: Option<usize>,
    /// Window start
    pub offset: Option<usize>,
    /// Comma-separated sort keys, `-` for descending, `<id>` for the primary key
    pub sort: Option<String>,
}

impl IndexQuery {
    /// Creates a query returning every feature.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the result to features intersecting `bbox`.
    #[must_use]
    pub fn with_bbox(mut self, bbox: Bbox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Sets the client SRID.
    #[must_use]
    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    /// Sets the filter expression.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Restricts the result to features intersecting `geometry`.
    #[must_use]
    pub fn with_filter_geom(mut self, geometry: geojson::Geometry) -> Self {
        self.filter_geom = Some(geometry);
        self
    }

    /// Restricts the returned attributes.
    #[must_use]
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Sets the window size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the window start.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the sort keys.
    #[must_use]
    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }
}

/// A `keyvalrel` constraint: `<dataset>:<key column>:<value column>`.
///
/// The referenced dataset is resolved by the caller; its provider's
/// [`DatasetFeaturesProvider::keyvals`] yields the options.
///
/// ```
/// use geocrud_core::provider::KeyValRel;
///
/// let rel = KeyValRel::parse("landuse_types:code:label").unwrap();
/// assert_eq!(rel.dataset, "landuse_types");
/// assert_eq!(rel.key_field, "code");
/// assert_eq!(rel.value_field, "label");
/// assert!(KeyValRel::parse("landuse_types:code").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValRel {
    /// Dataset holding the options
    pub dataset: String,
    /// Column stored in the referencing field
    pub key_field: String,
    /// Column shown to users
    pub value_field: String,
}

impl KeyValRel {
    /// Parses `dataset:key:value`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] unless the input has exactly three
    /// non-empty parts.
    pub fn parse(input: &str) -> std::result::Result<Self, ConfigError> {
        match input.split(':').map(str::trim).collect::<Vec<_>>().as_slice() {
            [dataset, key, value] if !dataset.is_empty() && !key.is_empty() && !value.is_empty() => {
                Ok(Self {
                    dataset: (*dataset).to_string(),
                    key_field: (*key).to_string(),
                    value_field: (*value).to_string(),
                })
            },
            _ => Err(ConfigError::InvalidOption {
                option: "keyvalrel".to_string(),
                message: format!("'{input}' is not '<dataset>:<key>:<value>'"),
            }),
        }
    }
}

/// Conjunction of SQL predicates with their parameters.
#[derive(Debug, Default)]
struct WhereClause {
    parts: Vec<String>,
    params: Params,
}

impl WhereClause {
    fn push(&mut self, predicate: impl Into<String>) {
        self.parts.push(predicate.into());
    }

    fn joined(&self) -> String {
        self.parts.join(" AND ")
    }

    fn sql(&self) -> Option<String> {
        (!self.parts.is_empty()).then(|| self.joined())
    }
}

/// Column list, value expressions and parameters of an `INSERT` or `UPDATE`.
#[derive(Debug, Default)]
struct WriteValues {
    columns: Vec<String>,
    values: Vec<String>,
    params: Params,
}

impl WriteValues {
    fn push(&mut self, column: String, value: String) {
        self.columns.push(column);
        self.values.push(value);
    }
}

/// Feature operations on one dataset.
pub struct DatasetFeaturesProvider {
    config: DatasetConfig,
    dialect: Box<dyn SpatialDialect>,
    db: DbHandles,
    tr: Arc<dyn Translator>,
    permissions: Permissions,
    table_sql: String,
}

impl std::fmt::Debug for DatasetFeaturesProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetFeaturesProvider")
            .field("table", &self.table_sql)
            .field("dialect", &self.dialect)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

impl DatasetFeaturesProvider {
    /// Creates a provider for `config`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of [`DatasetConfig::validate`], including an
    /// unknown backend dialect.
    pub fn new(
        config: DatasetConfig,
        db: DbHandles,
        tr: Arc<dyn Translator>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let dialect = create_dialect(config.dialect()?);
        let table_sql = dialect.qualified_table(&config.schema, &config.table_name);
        Ok(Self {
            permissions: config.permissions(),
            config,
            dialect,
            db,
            tr,
            table_sql,
        })
    }

    /// Creates a provider after dropping `only_if_exists` attributes whose column is
    /// missing from the database.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::Config`] for an invalid configuration and
    /// [`GeoCrudError::Database`] if the column catalog cannot be read.
    pub async fn open(
        mut config: DatasetConfig,
        db: DbHandles,
        tr: Arc<dyn Translator>,
    ) -> Result<Self> {
        config.validate()?;
        let dialect = create_dialect(config.dialect()?);

        let conditional = config
            .attributes
            .iter()
            .filter(|a| config.field(a).is_some_and(|f| f.constraints.only_if_exists))
            .cloned()
            .collect::<Vec<_>>();
        if !conditional.is_empty() {
            let mut conn = db.read.connect().await?;
            let mut catalog: BTreeMap<(String, String), HashSet<String>> = BTreeMap::new();
            for attribute in conditional {
                let (schema, table, column) = source_column(&config, &attribute);
                let key = (schema, table);
                if !catalog.contains_key(&key) {
                    let columns = existing_columns(&mut *conn, &*dialect, &key.0, &key.1).await?;
                    catalog.insert(key.clone(), columns);
                }
                if !catalog.get(&key).is_some_and(|columns| columns.contains(&column)) {
                    log::warn!(
                        "Dropping attribute '{attribute}': column {}.{}.{column} does not exist",
                        key.0,
                        key.1
                    );
                    config.attributes.retain(|a| *a != attribute);
                }
            }
        }

        Ok(Self::new(config, db, tr)?)
    }

    /// The dataset configuration in effect.
    #[must_use]
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Resolved CRUD permissions.
    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// The dialect strategy of the dataset.
    #[must_use]
    pub fn dialect(&self) -> &dyn SpatialDialect {
        &*self.dialect
    }

    /// Validator bound to this dataset and its read database.
    #[must_use]
    pub fn validator(&self) -> FeatureValidator<'_> {
        FeatureValidator::new(&self.config, &*self.dialect, &*self.db.read, &*self.tr)
    }

    /// Validates `payload` without writing it.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::Database`] if a probe fails unexpectedly.
    pub async fn validate(&self, payload: &mut Value, new_feature: bool) -> Result<ValidationReport> {
        Ok(self.validator().validate(payload, new_feature).await?)
    }

    /// Attributes whose options come from another dataset, with their relation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for a malformed `keyvalrel`.
    pub fn keyvalrels(&self) -> std::result::Result<BTreeMap<String, KeyValRel>, ConfigError> {
        self.config
            .fields
            .iter()
            .filter(|(attribute, _)| self.config.attributes.contains(attribute))
            .filter_map(|(attribute, field)| {
                field
                    .constraints
                    .keyvalrel
                    .as_deref()
                    .map(|rel| KeyValRel::parse(rel).map(|rel| (attribute.clone(), rel)))
            })
            .collect()
    }

    /// Lists features.
    ///
    /// The collection keeps one slot per matching row; rows outside the
    /// `offset`/`limit` window are `None`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::PermissionDenied`] if the dataset is not readable,
    /// [`GeoCrudError::Parse`] for an invalid filter and [`GeoCrudError::Database`]
    /// if the query fails.
    pub async fn index(&self, query: &IndexQuery) -> Result<FeatureCollection> {
        self.require(self.permissions.readable, Operation::Read)?;

        let mut projection = self.projection(query.fields.as_deref());
        let mut clause = self.datasource_clause();
        let stored = self.stored_geometry();
        let srid = query.srid.or(self.config.srid);

        if let (Some(bbox), Some((geom, dataset_srid))) = (query.bbox, &stored) {
            let client_srid = query.srid.unwrap_or(*dataset_srid);
            let envelope = self.dialect.transform(
                &self.dialect.make_envelope(client_srid),
                Some(client_srid),
                Some(*dataset_srid),
            );
            clause.push(self.dialect.intersects(geom, &envelope));
            clause.params.extend(params! {
                "minx" => bbox.min_x(),
                "miny" => bbox.min_y(),
                "maxx" => bbox.max_x(),
                "maxy" => bbox.max_y(),
            });
        }

        if let Some(filter) = &query.filter {
            self.apply_filter(&mut projection, filter, &mut clause)?;
        }

        if let (Some(filter_geom), Some((geom, dataset_srid))) = (&query.filter_geom, &stored) {
            let client_srid = query.srid.unwrap_or(*dataset_srid);
            let param = self.dialect.encode_geometry_param(filter_geom).map_err(|e| {
                ParseError::InvalidFilterGeometry {
                    message: e.message,
                }
            })?;
            let other = self.dialect.transform(
                &self.dialect.geom_from_geojson(FILTER_GEOMETRY_PARAM, client_srid),
                Some(client_srid),
                Some(*dataset_srid),
            );
            clause.push(self.dialect.intersects(geom, &other));
            clause.params.insert(FILTER_GEOMETRY_PARAM.to_string(), param);
        }

        let order_by = self.order_by(&mut projection, query.sort.as_deref());
        let sql = self.dialect.select_sql(
            &self.select_columns(&projection, srid, true),
            &projection.from_sql(&self.table_sql),
            clause.sql().as_deref(),
            order_by.as_deref(),
            false,
        );
        log::debug!("index: {sql}");

        let mut conn = self.db.read.connect().await?;
        let rows = conn.execute(&sql, &clause.params).await?;

        let features = rows
            .iter()
            .map(|row| self.feature_from_row(row, &projection, srid))
            .collect::<Result<Vec<_>>>()?;

        let bbox = match &stored {
            None => None,
            Some((geom, _)) if self.dialect.overall_extent(geom).is_some() => rows
                .first()
                .and_then(|row| row.get(EXTENT_ALIAS))
                .and_then(Value::as_str)
                .and_then(Bbox::from_box2d),
            // no window aggregate: fold the per-row envelopes
            Some(_) => features
                .iter()
                .filter_map(|f| f.bbox)
                .reduce(|extent, bbox| extent.union(&bbox)),
        };

        let number_matched = features.len();
        let features = window(features, query.offset, query.limit);
        let number_returned = features.iter().flatten().count();

        Ok(FeatureCollection {
            kind: "FeatureCollection".to_string(),
            features,
            crs: stored.and(srid).map(Crs::epsg),
            bbox,
            number_matched,
            number_returned,
        })
    }

    /// Returns one feature.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::NotFound`] if no row has the id or the row is outside
    /// the datasource filter.
    pub async fn show(
        &self,
        id: &FeatureId,
        srid: Option<i32>,
        fields: Option<&[String]>,
    ) -> Result<Feature> {
        self.require(self.permissions.readable, Operation::Read)?;
        let srid = srid.or(self.config.srid);
        let mut conn = self.db.read.connect().await?;
        self.select_by_id(&mut *conn, &id.to_value(), srid, fields, true)
            .await?
            .ok_or_else(|| not_found(id))
    }

    /// Validates and inserts a feature, returning the stored row.
    ///
    /// Geometries are read in the CRS of the payload and returned in it.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::Validation`] for an invalid payload and
    /// [`GeoCrudError::Commit`] if the database rejects the row.
    pub async fn create(&self, payload: Value) -> Result<Feature> {
        self.require(self.permissions.creatable, Operation::Create)?;
        let feature = self.validated(payload, true).await?;
        let srid = feature.client_srid(self.config.srid);
        let values = self.write_values(&feature, srid)?;
        let sql = self.dialect.insert_sql(
            &self.table_sql,
            &values.columns,
            &values.values,
            &self.config.primary_key,
        );
        log::debug!("create: {sql}");

        let created = self.write(&sql, &values.params, srid).await?.ok_or_else(|| {
            DbError::new(DbErrorKind::Other, "INSERT returned no primary key")
        })?;
        log::info!(
            "Created feature {} in {}",
            display_id(created.id.as_ref()),
            self.table_sql
        );
        Ok(created)
    }

    /// Validates and updates a feature, returning the stored row.
    ///
    /// Properties absent from the payload keep their value. A payload without any
    /// writable column only re-reads the row.
    ///
    /// # Errors
    ///
    /// As [`DatasetFeaturesProvider::create`], plus [`GeoCrudError::NotFound`].
    pub async fn update(&self, id: &FeatureId, payload: Value) -> Result<Feature> {
        self.require(self.permissions.updatable, Operation::Update)?;
        let feature = self.validated(payload, false).await?;
        let srid = feature.client_srid(self.config.srid);
        let values = self.write_values(&feature, srid)?;

        if values.columns.is_empty() {
            let mut conn = self.db.read.connect().await?;
            return self
                .select_by_id(&mut *conn, &id.to_value(), srid, None, true)
                .await?
                .ok_or_else(|| not_found(id));
        }

        let clause = self.key_clause(id);
        let sql = self.dialect.update_sql(
            &self.table_sql,
            &values.columns,
            &values.values,
            &clause.joined(),
            &self.config.primary_key,
        );
        log::debug!("update: {sql}");

        let mut params = values.params;
        params.extend(clause.params);
        let updated = self.write(&sql, &params, srid).await?.ok_or_else(|| not_found(id))?;
        log::info!("Updated feature {id} in {}", self.table_sql);
        Ok(updated)
    }

    /// Deletes a feature. Returns `true` if exactly one row was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::PermissionDenied`] or [`GeoCrudError::Database`].
    pub async fn destroy(&self, id: &FeatureId) -> Result<bool> {
        self.require(self.permissions.deletable, Operation::Delete)?;
        let clause = self.key_clause(id);
        let sql = self
            .dialect
            .delete_sql(&self.table_sql, &clause.joined(), &self.config.primary_key);
        log::debug!("destroy: {sql}");

        let mut conn = self.db.write.connect().await?;
        conn.begin().await?;
        let outcome = conn.execute(&sql, &clause.params).await;
        match outcome {
            Ok(rows) if rows.len() == 1 => {
                conn.commit().await?;
                log::info!("Deleted feature {id} from {}", self.table_sql);
                Ok(true)
            },
            Ok(_) => {
                conn.rollback().await?;
                Ok(false)
            },
            Err(err) => {
                rollback_quietly(&mut *conn).await;
                Err(err.into())
            },
        }
    }

    /// Returns `true` if a row with `id` exists inside the datasource filter.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::Database`] if the probe fails.
    pub async fn exists(&self, id: &FeatureId) -> Result<bool> {
        let clause = self.key_clause(id);
        let sql = self.dialect.exists_sql(&self.table_sql, &clause.joined());
        log::debug!("exists: {sql}");
        let mut conn = self.db.read.connect().await?;
        let rows = conn.execute(&sql, &clause.params).await?;
        Ok(rows.first().and_then(|row| flag(row, "exists")).unwrap_or(false))
    }

    /// Extent of the matching features in `srid`, `None` without geometry or rows.
    ///
    /// # Errors
    ///
    /// As [`DatasetFeaturesProvider::index`].
    pub async fn extent(&self, srid: Option<i32>, filter: Option<&str>) -> Result<Option<Bbox>> {
        self.require(self.permissions.readable, Operation::Read)?;
        let Some((geom, dataset_srid)) = self.stored_geometry() else {
            return Ok(None);
        };

        let mut projection = self.projection(Some(&[][..]));
        let mut clause = self.datasource_clause();
        if let Some(filter) = filter {
            self.apply_filter(&mut projection, filter, &mut clause)?;
        }

        let geom = self
            .dialect
            .transform(&geom, Some(dataset_srid), Some(srid.unwrap_or(dataset_srid)));
        let columns = format!(
            "{} AS {}",
            self.dialect.extent_aggregate(&geom),
            self.dialect.quote_ident(EXTENT_ALIAS)
        );
        let sql = self.dialect.select_sql(
            &columns,
            &projection.from_sql(&self.table_sql),
            clause.sql().as_deref(),
            None,
            false,
        );
        log::debug!("extent: {sql}");

        let mut conn = self.db.read.connect().await?;
        let rows = conn.execute(&sql, &clause.params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(EXTENT_ALIAS))
            .and_then(Value::as_str)
            .and_then(Bbox::from_box2d))
    }

    /// All `(key, value)` pairs of two columns of the table, ordered by value.
    ///
    /// Ignores the datasource filter and bounding boxes.
    ///
    /// # Errors
    ///
    /// Returns [`GeoCrudError::Database`] if the query fails.
    pub async fn keyvals(&self, key_field: &str, value_field: &str) -> Result<Vec<ValueOption>> {
        let label = self.dialect.quote_ident(value_field);
        let columns = format!(
            "{} AS {}, {label} AS {}",
            self.dialect.quote_ident(key_field),
            self.dialect.quote_ident("value"),
            self.dialect.quote_ident("label"),
        );
        let sql = self
            .dialect
            .select_sql(&columns, &self.table_sql, None, Some(&label), false);
        log::debug!("keyvals: {sql}");

        let mut conn = self.db.read.connect().await?;
        let rows = conn.execute(&sql, &Params::new()).await?;
        Ok(rows
            .iter()
            .map(|row| ValueOption {
                value: row.get("value").cloned().unwrap_or(Value::Null),
                label: match row.get("label") {
                    Some(Value::String(label)) => label.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
            })
            .collect())
    }

    fn require(&self, allowed: bool, operation: Operation) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(GeoCrudError::PermissionDenied { operation })
        }
    }

    /// Projection of the visible attributes, narrowed to `fields`.
    fn projection(&self, fields: Option<&[String]>) -> Projection {
        let visible = self
            .config
            .attributes
            .iter()
            .filter(|a| !self.config.is_hidden(a))
            .filter(|a| fields.is_none_or(|f| f.contains(a)))
            .cloned()
            .collect::<Vec<_>>();
        resolve_projection(&self.config, &*self.dialect, Some(&visible))
    }

    /// Stored geometry expression and dataset SRID.
    fn stored_geometry(&self) -> Option<(String, i32)> {
        let column = self.config.geometry_column.as_ref()?;
        let srid = self.config.srid?;
        Some((Projection::base_column(&*self.dialect, column), srid))
    }

    fn datasource_clause(&self) -> WhereClause {
        let mut clause = WhereClause::default();
        if let Some(filter) = &self.config.datasource_filter {
            clause.push(format!("({filter})"));
        }
        clause
    }

    /// Primary key match on the unaliased table, inside the datasource filter.
    fn key_clause(&self, id: &FeatureId) -> WhereClause {
        let mut clause = WhereClause::default();
        clause.push(format!(
            "{} = :{ID_PARAM}",
            self.dialect.quote_ident(&self.config.primary_key)
        ));
        clause.params.insert(ID_PARAM.to_string(), id.to_value());
        if let Some(filter) = &self.config.datasource_filter {
            clause.push(format!("({filter})"));
        }
        clause
    }

    fn apply_filter(
        &self,
        projection: &mut Projection,
        filter: &str,
        clause: &mut WhereClause,
    ) -> Result<()> {
        let parser = FilterParser::new(&self.config.primary_key, &self.config.attributes)
            .with_dialect(&*self.dialect);
        let Some(node) = parser.parse_expression(Some(filter))? else {
            return Ok(());
        };
        for column in node.columns() {
            projection.require(column);
        }
        let parsed = node.to_sql(
            &|column: &str| {
                projection
                    .column_expr(column)
                    .unwrap_or_else(|| self.dialect.quote_ident(column))
            },
            self.dialect.dialect(),
        );
        if !parsed.is_empty() {
            clause.push(parsed.sql);
            clause.params.extend(parsed.params);
        }
        Ok(())
    }

    fn order_by(&self, projection: &mut Projection, sort: Option<&str>) -> Option<String> {
        let mut keys = Vec::new();
        for key in sort?.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let (name, direction) = match key.strip_prefix('-') {
                Some(name) => (name.trim(), "DESC"),
                None => (key.strip_prefix('+').unwrap_or(key).trim(), "ASC"),
            };
            let name = if name == "<id>" {
                self.config.primary_key.as_str()
            } else {
                name
            };
            if !projection.require(name) {
                log::warn!("Dropping unknown sort key '{name}'");
                continue;
            }
            if let Some(expr) = projection.column_expr(name) {
                keys.push(format!("{expr} {direction}"));
            }
        }
        (!keys.is_empty()).then(|| keys.join(", "))
    }

    fn select_columns(&self, projection: &Projection, srid: Option<i32>, with_extent: bool) -> String {
        let mut columns = projection.select_list();
        if let Some((geom, dataset_srid)) = self.stored_geometry() {
            let geom = self.dialect.transform(&geom, Some(dataset_srid), srid);
            columns.push_str(&format!(
                ", {} AS {}, {} AS {}",
                self.dialect.geom_to_geojson(&geom),
                self.dialect.quote_ident(GEOMETRY_ALIAS),
                self.dialect.bbox(&geom),
                self.dialect.quote_ident(BBOX_ALIAS),
            ));
            if with_extent {
                if let Some(extent) = self.dialect.overall_extent(&geom) {
                    columns.push_str(&format!(
                        ", {extent} AS {}",
                        self.dialect.quote_ident(EXTENT_ALIAS)
                    ));
                }
            }
        }
        columns
    }

    async fn select_by_id(
        &self,
        conn: &mut dyn Connection,
        key: &Value,
        srid: Option<i32>,
        fields: Option<&[String]>,
        honor_datasource_filter: bool,
    ) -> Result<Option<Feature>> {
        let projection = self.projection(fields);
        let mut clause = WhereClause::default();
        clause.push(format!(
            "{} = :{ID_PARAM}",
            Projection::base_column(&*self.dialect, &self.config.primary_key)
        ));
        clause.params.insert(ID_PARAM.to_string(), key.clone());
        if honor_datasource_filter {
            if let Some(filter) = &self.config.datasource_filter {
                clause.push(format!("({filter})"));
            }
        }

        let sql = self.dialect.select_sql(
            &self.select_columns(&projection, srid, false),
            &projection.from_sql(&self.table_sql),
            clause.sql().as_deref(),
            None,
            true,
        );
        log::debug!("show: {sql}");
        let rows = conn.execute(&sql, &clause.params).await?;
        rows.first()
            .map(|row| self.feature_from_row(row, &projection, srid))
            .transpose()
    }

    fn feature_from_row(&self, row: &Row, projection: &Projection, srid: Option<i32>) -> Result<Feature> {
        let mut feature = Feature::new();
        feature.id = row.get(projection.primary_key()).and_then(FeatureId::from_value);
        for attribute in projection.attributes() {
            if attribute == projection.primary_key() {
                continue;
            }
            let value = match row.get(attribute).cloned().unwrap_or(Value::Null) {
                // engines without a JSON column type return text
                Value::String(text) if self.config.field(attribute).is_some_and(FieldSpec::is_json) => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                },
                other => other,
            };
            feature.properties.insert(attribute.clone(), value);
        }

        if self.config.geometry_column.is_some() {
            let geometry = match row.get(GEOMETRY_ALIAS) {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    self.dialect
                        .decode_geometry(value)
                        .map_err(|e| DbError::new(DbErrorKind::Data, e.to_string()))?,
                ),
            };
            feature.geometry = Some(geometry);
            feature.bbox = row
                .get(BBOX_ALIAS)
                .and_then(Value::as_str)
                .and_then(Bbox::from_box2d);
            feature.crs = srid.map(Crs::epsg);
        }
        Ok(feature)
    }

    async fn validated(&self, mut payload: Value, new_feature: bool) -> Result<Feature> {
        let report = self.validator().validate(&mut payload, new_feature).await?;
        if !report.is_empty() {
            return Err(ValidationFailure { report }.into());
        }
        Feature::from_value(payload).map_err(|e| {
            log::debug!("Feature payload rejected after validation: {e}");
            let message = self.tr.tr("validation.invalid_geojson_feature", &[]);
            ValidationFailure {
                report: ValidationReport {
                    validation_errors: vec![message],
                    ..ValidationReport::default()
                },
            }
            .into()
        })
    }

    fn write_values(&self, feature: &Feature, srid: Option<i32>) -> Result<WriteValues> {
        let mut values = WriteValues::default();
        for attribute in &self.config.attributes {
            // joined columns live in another table
            if self.config.field(attribute).is_some_and(|f| f.joinfield.is_some()) {
                continue;
            }
            let column = self.dialect.quote_ident(attribute);
            if feature.defaulted_properties.contains(attribute) {
                values.push(column, "DEFAULT".to_string());
            } else if let Some(value) = feature.properties.get(attribute) {
                let name = format!("__val{}", values.params.len());
                let json = self.config.field(attribute).is_some_and(FieldSpec::is_json);
                let value = match value {
                    Value::Null => Value::Null,
                    // json columns take the serialized text the validator cast
                    _ if json => Value::String(value.to_string()),
                    Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                    other => other.clone(),
                };
                values.push(column, format!(":{name}"));
                values.params.insert(name, value);
            }
        }

        if let (Some(column), Some(geometry)) = (&self.config.geometry_column, &feature.geometry) {
            let column = self.dialect.quote_ident(column);
            match geometry {
                None => values.push(column, "NULL".to_string()),
                Some(geometry) => {
                    let Some(client_srid) = srid else {
                        return Err(ConfigError::MissingRequired {
                            option: "srid".to_string(),
                        }
                        .into());
                    };
                    let param = self.dialect.encode_geometry_param(geometry).map_err(|e| {
                        ValidationFailure {
                            report: ValidationReport {
                                geometry_errors: vec![GeometryError::new(e.message)],
                                ..ValidationReport::default()
                            },
                        }
                    })?;
                    let expr = self.dialect.transform(
                        &self.dialect.geom_from_geojson(GEOMETRY_PARAM, client_srid),
                        Some(client_srid),
                        self.config.srid,
                    );
                    values.push(column, expr);
                    values.params.insert(GEOMETRY_PARAM.to_string(), param);
                },
            }
        }
        Ok(values)
    }

    /// Runs `sql` in one write transaction and re-reads the returned row.
    ///
    /// `Ok(None)` means the statement matched no row; the transaction is rolled back.
    async fn write(&self, sql: &str, params: &Params, srid: Option<i32>) -> Result<Option<Feature>> {
        let mut conn = self.db.write.connect().await?;
        conn.begin().await?;
        let outcome = self.write_and_reselect(&mut *conn, sql, params, srid).await;
        match outcome {
            Ok(Some(feature)) => {
                conn.commit().await.map_err(commit_error)?;
                Ok(Some(feature))
            },
            Ok(None) => {
                conn.rollback().await?;
                Ok(None)
            },
            Err(err) => {
                rollback_quietly(&mut *conn).await;
                Err(err)
            },
        }
    }

    async fn write_and_reselect(
        &self,
        conn: &mut dyn Connection,
        sql: &str,
        params: &Params,
        srid: Option<i32>,
    ) -> Result<Option<Feature>> {
        let rows = conn.execute(sql, params).await.map_err(commit_error)?;
        let Some(key) = rows
            .first()
            .and_then(|row| row.get(&self.config.primary_key))
            .cloned()
        else {
            return Ok(None);
        };
        self.select_by_id(conn, &key, srid, None, false).await
    }
}

/// Anticipated write failures become [`GeoCrudError::Commit`]; anything else
/// propagates as [`GeoCrudError::Database`].
fn commit_error(err: DbError) -> GeoCrudError {
    if err.kind.is_commit_failure() {
        GeoCrudError::Commit(err.into())
    } else {
        GeoCrudError::Database(err)
    }
}

async fn rollback_quietly(conn: &mut dyn Connection) {
    if let Err(err) = conn.rollback().await {
        log::warn!("Rollback after failed write failed: {err}");
    }
}

fn not_found(id: &FeatureId) -> GeoCrudError {
    GeoCrudError::NotFound { id: id.to_string() }
}

fn display_id(id: Option<&FeatureId>) -> String {
    id.map_or_else(|| "?".to_string(), ToString::to_string)
}

/// `(schema, table, column)` holding `attribute`.
fn source_column(config: &DatasetConfig, attribute: &str) -> (String, String, String) {
    let joined = config
        .field(attribute)
        .and_then(|f| f.joinfield.as_ref())
        .and_then(|jf| config.jointables.get(&jf.table).map(|table| (jf, table)));
    match joined {
        Some((joinfield, table)) => (
            table.schema.clone().unwrap_or_else(|| config.schema.clone()),
            table.table_name.clone(),
            joinfield.field.clone(),
        ),
        None => (
            config.schema.clone(),
            config.table_name.clone(),
            attribute.to_string(),
        ),
    }
}

async fn existing_columns(
    conn: &mut dyn Connection,
    dialect: &dyn SpatialDialect,
    schema: &str,
    table: &str,
) -> DbResult<HashSet<String>> {
    let sql = dialect.columns_sql();
    log::debug!("column catalog: {sql}");
    let rows = conn
        .execute(&sql, &params! { "schema" => schema, "table" => table })
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("column_name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

/// Keeps one slot per feature, emptying those outside `[offset, offset + limit)`.
fn window(features: Vec<Feature>, offset: Option<usize>, limit: Option<usize>) -> Vec<Option<Feature>> {
    let start = offset.unwrap_or(0);
    let end = limit.map_or(usize::MAX, |limit| start.saturating_add(limit));
    features
        .into_iter()
        .enumerate()
        .map(|(position, feature)| (start..end).contains(&position).then_some(feature))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use crate::i18n::DefaultTranslator;
    use geocrud_core_common::testing::MockDatabase;

    fn provider(config: DatasetConfig) -> DatasetFeaturesProvider {
        DatasetFeaturesProvider::new(
            config,
            DbHandles::shared(Arc::new(MockDatabase::new())),
            Arc::new(DefaultTranslator::new()),
        )
        .unwrap()
    }

    fn config() -> DatasetConfig {
        DatasetConfig::builder("public", "trees", "id")
            .with_attribute("species", FieldSpec::new("text"))
            .with_attribute("height", FieldSpec::new("numeric"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_window_keeps_positions() {
        let features = (0..5)
            .map(|i| Feature::new().with_property("n", i))
            .collect::<Vec<_>>();
        let slots = window(features.clone(), Some(1), Some(2));
        assert_eq!(slots.len(), 5);
        assert_eq!(
            slots.iter().map(Option::is_some).collect::<Vec<_>>(),
            [false, true, true, false, false]
        );
        assert_eq!(window(features.clone(), None, None).iter().flatten().count(), 5);
        assert_eq!(window(features, Some(4), Some(10)).iter().flatten().count(), 1);
    }

    #[test]
    fn test_order_by() {
        let provider = provider(config());
        let mut projection = provider.projection(None);
        assert_eq!(
            provider
                .order_by(&mut projection, Some("-height, +species,<id>"))
                .as_deref(),
            Some("t0.\"height\" DESC, t0.\"species\" ASC, t0.\"id\" ASC")
        );
        assert_eq!(
            provider.order_by(&mut projection, Some("missing,-height")).as_deref(),
            Some("t0.\"height\" DESC")
        );
        assert_eq!(provider.order_by(&mut projection, Some("missing")), None);
        assert_eq!(provider.order_by(&mut projection, None), None);
    }

    #[test]
    fn test_key_clause_honors_datasource_filter() {
        let config = DatasetConfig::builder("public", "trees", "id")
            .with_datasource_filter("owner = 'parks'")
            .build()
            .unwrap();
        let clause = provider(config).key_clause(&FeatureId::Int(4));
        assert_eq!(clause.joined(), "\"id\" = :__id AND (owner = 'parks')");
        assert_eq!(clause.params[ID_PARAM], serde_json::json!(4));
    }

    #[test]
    fn test_keyvalrel_parse() {
        assert!(KeyValRel::parse("a::c").is_err());
        assert!(KeyValRel::parse("a:b:c:d").is_err());
        let rel = KeyValRel::parse(" types : code : label ").unwrap();
        assert_eq!(rel.dataset, "types");
        assert_eq!(rel.value_field, "label");
    }

    #[test]
    fn test_unknown_backend_rejected_eagerly() {
        let mut config = config();
        config.backend = "oracle".to_string();
        let err = DatasetFeaturesProvider::new(
            config,
            DbHandles::shared(Arc::new(MockDatabase::new())),
            Arc::new(DefaultTranslator::new()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDialect { .. }));
    }
}
