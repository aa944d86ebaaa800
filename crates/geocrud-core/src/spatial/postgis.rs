use serde_json::Value;

use geocrud_core_common::Dialect;

use super::{CastSource, GeometryCodecError, SpatialDialect, geometry_from_json_text};

/// PostGIS strategy.
///
/// Geometries travel as GeoJSON text in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgisDialect;

impl SpatialDialect for PostgisDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgis
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn parse_geometry(&self, param: &str) -> String {
        format!("ST_GeomFromGeoJSON(:{param})")
    }

    fn geom_from_geojson(&self, param: &str, srid: i32) -> String {
        format!("ST_SetSRID(ST_GeomFromGeoJSON(:{param}), {srid})")
    }

    fn geom_to_geojson(&self, geom_sql: &str) -> String {
        // curves have no GeoJSON form
        format!("ST_AsGeoJSON(ST_CurveToLine({geom_sql}))")
    }

    fn transform_to(&self, geom_sql: &str, target_srid: i32) -> String {
        format!("ST_Transform({geom_sql}, {target_srid})")
    }

    fn bbox(&self, geom_sql: &str) -> String {
        format!("Box2D({geom_sql})::text")
    }

    fn overall_extent(&self, geom_sql: &str) -> Option<String> {
        Some(format!("ST_Extent({geom_sql}) OVER ()::text"))
    }

    fn extent_aggregate(&self, geom_sql: &str) -> String {
        format!("ST_Extent({geom_sql})::text")
    }

    fn make_envelope(&self, srid: i32) -> String {
        format!("ST_MakeEnvelope(:minx, :miny, :maxx, :maxy, {srid})")
    }

    fn intersects(&self, geom_sql: &str, other_sql: &str) -> String {
        format!("ST_Intersects({geom_sql}, {other_sql})")
    }

    fn is_valid(&self, geom_sql: &str) -> String {
        format!("ST_IsValid({geom_sql})")
    }

    fn validation_reason(&self, geom_sql: &str) -> String {
        format!("(ST_IsValidDetail({geom_sql})).reason")
    }

    fn invalid_location(&self, geom_sql: &str) -> String {
        format!("ST_AsText((ST_IsValidDetail({geom_sql})).location)")
    }

    fn is_empty(&self, geom_sql: &str) -> String {
        format!("ST_IsEmpty({geom_sql})")
    }

    fn as_text(&self, geom_sql: &str) -> String {
        format!("ST_AsText({geom_sql})")
    }

    fn geometry_type(&self, geom_sql: &str) -> String {
        format!("GeometryType({geom_sql})")
    }

    fn cast_probe_sql(&self, source: CastSource, target_type: &str) -> String {
        let source = match source {
            CastSource::Numeric => "numeric",
            CastSource::Boolean => "boolean",
            CastSource::Text => "text",
        };
        format!("SELECT CAST(CAST(:value AS {source}) AS {target_type}) AS value")
    }

    fn catalog_type_sql(&self) -> String {
        "SELECT udt_schema::text || '.' || udt_name::text AS defined_type \
         FROM information_schema.columns \
         WHERE table_schema = :schema AND table_name = :table AND column_name = :column \
         LIMIT 1"
            .to_string()
    }

    fn columns_sql(&self) -> String {
        "SELECT column_name::text AS column_name FROM information_schema.columns \
         WHERE table_schema = :schema AND table_name = :table"
            .to_string()
    }

    fn select_sql(
        &self,
        columns: &str,
        from: &str,
        where_clause: Option<&str>,
        order_by: Option<&str>,
        limit_one: bool,
    ) -> String {
        let mut sql = format!("SELECT {columns} FROM {from}");
        if let Some(where_clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if limit_one {
            sql.push_str(" LIMIT 1");
        }
        sql
    }

    fn insert_sql(&self, table: &str, columns: &[String], values: &[String], pk: &str) -> String {
        let pk = self.quote_ident(pk);
        if columns.is_empty() {
            return format!("INSERT INTO {table} DEFAULT VALUES RETURNING {pk}");
        }
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING {pk}",
            columns.join(", "),
            values.join(", ")
        )
    }

    fn update_sql(
        &self,
        table: &str,
        columns: &[String],
        values: &[String],
        where_clause: &str,
        pk: &str,
    ) -> String {
        format!(
            "UPDATE {table} SET ({}) = ROW({}) WHERE {where_clause} RETURNING {}",
            columns.join(", "),
            values.join(", "),
            self.quote_ident(pk)
        )
    }

    fn delete_sql(&self, table: &str, where_clause: &str, pk: &str) -> String {
        format!(
            "DELETE FROM {table} WHERE {where_clause} RETURNING {}",
            self.quote_ident(pk)
        )
    }

    fn exists_sql(&self, table: &str, where_clause: &str) -> String {
        format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {where_clause}) AS exists")
    }

    fn encode_geometry_param(
        &self,
        geometry: &geojson::Geometry,
    ) -> Result<Value, GeometryCodecError> {
        serde_json::to_string(geometry)
            .map(Value::String)
            .map_err(GeometryCodecError::new)
    }

    fn encode_raw_geometry(&self, raw: &Value) -> Result<Value, GeometryCodecError> {
        // PostGIS reports its own parse errors, e.g. "Too few ordinates in GeoJSON"
        Ok(Value::String(raw.to_string()))
    }

    fn decode_geometry(&self, value: &Value) -> Result<geojson::Geometry, GeometryCodecError> {
        match value {
            Value::String(text) => geometry_from_json_text(text),
            Value::Object(_) => {
                serde_json::from_value(value.clone()).map_err(GeometryCodecError::new)
            },
            other => Err(GeometryCodecError::new(format!(
                "expected GeoJSON text, got {other}"
            ))),
        }
    }
}
