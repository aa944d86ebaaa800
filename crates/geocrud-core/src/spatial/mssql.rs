use geozero::wkt::Wkt;
use geozero::{ToJson, ToWkt};
use serde_json::Value;

use geocrud_core_common::Dialect;

use super::{CastSource, GeometryCodecError, SpatialDialect, geometry_from_json_text};

/// SQL Server spatial strategy.
///
/// SQL Server has no GeoJSON functions, so geometries are exchanged as WKT and
/// converted on the client. There is no streaming extent aggregate usable as a
/// window function; [`SpatialDialect::overall_extent`] returns `None` and callers
/// fold the per-row envelopes instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsSqlDialect;

impl MsSqlDialect {
    fn box_text(envelope: &str) -> String {
        format!(
            "CONCAT('BOX(', {e}.STPointN(1).STX, ' ', {e}.STPointN(1).STY, ',', \
             {e}.STPointN(3).STX, ' ', {e}.STPointN(3).STY, ')')",
            e = envelope
        )
    }
}

impl SpatialDialect for MsSqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::MsSql
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn parse_geometry(&self, param: &str) -> String {
        format!("geometry::STGeomFromText(:{param}, 0)")
    }

    fn geom_from_geojson(&self, param: &str, srid: i32) -> String {
        format!("geometry::STGeomFromText(:{param}, {srid})")
    }

    fn geom_to_geojson(&self, geom_sql: &str) -> String {
        format!("{geom_sql}.STAsText()")
    }

    fn transform_to(&self, geom_sql: &str, target_srid: i32) -> String {
        format!("{geom_sql}.STTransform({target_srid})")
    }

    fn bbox(&self, geom_sql: &str) -> String {
        Self::box_text(&format!("{geom_sql}.STEnvelope()"))
    }

    fn overall_extent(&self, _geom_sql: &str) -> Option<String> {
        None
    }

    fn extent_aggregate(&self, geom_sql: &str) -> String {
        Self::box_text(&format!("geometry::EnvelopeAggregate({geom_sql})"))
    }

    fn make_envelope(&self, srid: i32) -> String {
        format!(
            "geometry::STGeomFromText(CONCAT('POLYGON((', :minx, ' ', :miny, ',', :maxx, ' ', \
             :miny, ',', :maxx, ' ', :maxy, ',', :minx, ' ', :maxy, ',', :minx, ' ', :miny, \
             '))'), {srid})"
        )
    }

    fn intersects(&self, geom_sql: &str, other_sql: &str) -> String {
        format!("{geom_sql}.STIntersects({other_sql}) = 1")
    }

    fn is_valid(&self, geom_sql: &str) -> String {
        format!("{geom_sql}.STIsValid()")
    }

    fn validation_reason(&self, geom_sql: &str) -> String {
        format!("{geom_sql}.IsValidDetailed()")
    }

    fn invalid_location(&self, _geom_sql: &str) -> String {
        "NULL".to_string()
    }

    fn is_empty(&self, geom_sql: &str) -> String {
        format!("{geom_sql}.STIsEmpty()")
    }

    fn as_text(&self, geom_sql: &str) -> String {
        format!("{geom_sql}.STAsText()")
    }

    fn geometry_type(&self, geom_sql: &str) -> String {
        format!("UPPER({geom_sql}.STGeometryType())")
    }

    fn geometry_check_sql(&self, param: &str) -> String {
        format!(
            "SELECT {valid} AS valid, {reason} AS reason, NULL AS location, \
             {empty} AS is_empty, {wkt} AS wkt_geom, {kind} AS geom_type \
             FROM (SELECT {parse} AS geom) AS feature",
            parse = self.parse_geometry(param),
            valid = self.is_valid("geom"),
            reason = self.validation_reason("geom"),
            empty = self.is_empty("geom"),
            wkt = self.as_text("geom"),
            kind = self.geometry_type("geom"),
        )
    }

    fn cast_probe_sql(&self, source: CastSource, target_type: &str) -> String {
        let source = match source {
            CastSource::Numeric => "float",
            CastSource::Boolean => "bit",
            CastSource::Text => "nvarchar(max)",
        };
        format!("SELECT CAST(CAST(:value AS {source}) AS {target_type}) AS value")
    }

    fn catalog_type_sql(&self) -> String {
        "SELECT TOP 1 DATA_TYPE AS defined_type FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = :schema AND TABLE_NAME = :table AND COLUMN_NAME = :column"
            .to_string()
    }

    fn columns_sql(&self) -> String {
        "SELECT COLUMN_NAME AS column_name FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = :schema AND TABLE_NAME = :table"
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
        let top = if limit_one { "TOP 1 " } else { "" };
        let mut sql = format!("SELECT {top}{columns} FROM {from}");
        if let Some(where_clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        sql
    }

    fn insert_sql(&self, table: &str, columns: &[String], values: &[String], pk: &str) -> String {
        let output = format!("OUTPUT INSERTED.{}", self.quote_ident(pk));
        if columns.is_empty() {
            return format!("INSERT INTO {table} {output} DEFAULT VALUES");
        }
        format!(
            "INSERT INTO {table} ({}) {output} VALUES ({})",
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
        let assignments = columns
            .iter()
            .zip(values)
            .map(|(column, value)| format!("{column} = {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {table} SET {assignments} OUTPUT INSERTED.{} WHERE {where_clause}",
            self.quote_ident(pk)
        )
    }

    fn delete_sql(&self, table: &str, where_clause: &str, pk: &str) -> String {
        format!(
            "DELETE FROM {table} OUTPUT DELETED.{} WHERE {where_clause}",
            self.quote_ident(pk)
        )
    }

    fn exists_sql(&self, table: &str, where_clause: &str) -> String {
        format!(
            "SELECT CASE WHEN EXISTS(SELECT 1 FROM {table} WHERE {where_clause}) \
             THEN 1 ELSE 0 END AS [exists]"
        )
    }

    fn encode_geometry_param(
        &self,
        geometry: &geojson::Geometry,
    ) -> Result<Value, GeometryCodecError> {
        let json = serde_json::to_string(geometry).map_err(GeometryCodecError::new)?;
        geozero::geojson::GeoJson(&json)
            .to_wkt()
            .map(Value::String)
            .map_err(GeometryCodecError::new)
    }

    fn decode_geometry(&self, value: &Value) -> Result<geojson::Geometry, GeometryCodecError> {
        let Value::String(text) = value else {
            return Err(GeometryCodecError::new(format!("expected WKT text, got {value}")));
        };
        let json = Wkt(text.as_str())
            .to_json()
            .map_err(GeometryCodecError::new)?;
        geometry_from_json_text(&json)
    }
}
