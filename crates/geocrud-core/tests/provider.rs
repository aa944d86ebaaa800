use std::sync::Arc;

use geocrud_core::bbox::Bbox;
use geocrud_core::config::{
    DatasetConfig, DbHandles, FieldConstraints, FieldSpec, GeometryType, JoinTable, Permissions,
};
use geocrud_core::error::{GeoCrudError, Operation, ParseError, Result};
use geocrud_core::feature::{Crs, FeatureId};
use geocrud_core::i18n::DefaultTranslator;
use geocrud_core::provider::{DatasetFeaturesProvider, IndexQuery};
use geocrud_core_common::testing::{MockDatabase, MockEvent, rows};
use geocrud_core_common::{DbError, DbErrorKind};
use serde_json::{Value, json};

fn points_config() -> DatasetConfig {
    DatasetConfig::builder("public", "edit_points", "id")
        .with_attribute("name", FieldSpec::new("text"))
        .with_attribute(
            "height",
            FieldSpec::new("integer").with_constraints(FieldConstraints {
                min: Some(json!(0)),
                ..FieldConstraints::default()
            }),
        )
        .with_attribute(
            "owner",
            FieldSpec::new("text").with_joinfield("owners", "name"),
        )
        .with_attribute(
            "created",
            FieldSpec::new("text").with_constraints(FieldConstraints {
                read_only: true,
                ..FieldConstraints::default()
            }),
        )
        .with_attribute(
            "secret",
            FieldSpec::new("text").with_constraints(FieldConstraints {
                hidden: true,
                ..FieldConstraints::default()
            }),
        )
        .with_jointable(
            "owners",
            JoinTable {
                schema: None,
                table_name: "owners".to_string(),
                target_field: "owner_id".to_string(),
                join_field: "id".to_string(),
            },
        )
        .with_geometry("geom", GeometryType::parse("Point").unwrap(), 2056)
        .with_writable(true)
        .with_datasource_filter("deleted IS NOT TRUE")
        .build()
        .unwrap()
}

fn plain_config() -> DatasetConfig {
    DatasetConfig::builder("public", "contacts", "id")
        .with_attribute("name", FieldSpec::new("text"))
        .build()
        .unwrap()
}

fn provider(config: DatasetConfig, db: &MockDatabase) -> DatasetFeaturesProvider {
    DatasetFeaturesProvider::new(
        config,
        DbHandles::shared(Arc::new(db.clone())),
        Arc::new(DefaultTranslator::new()),
    )
    .unwrap()
}

fn point_row(id: i64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "height": 3,
        "owner": "parks",
        "created": "2024-05-01",
        "__geometry": "{\"type\":\"Point\",\"coordinates\":[2606000.0,1228000.0]}",
        "__bbox": "BOX(2606000 1228000,2606000 1228000)"
    })
}

fn valid_point_check() -> Value {
    json!([{
        "valid": true,
        "reason": null,
        "location": null,
        "is_empty": false,
        "wkt_geom": "POINT(2606000 1228000)",
        "geom_type": "POINT"
    }])
}

fn point_payload(srid: i32, properties: Value) -> Value {
    json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [2606000.0, 1228000.0]},
        "crs": {"type": "name", "properties": {"name": format!("urn:ogc:def:crs:EPSG::{srid}")}},
        "properties": properties
    })
}

fn last_statement(db: &MockDatabase, prefix: &str) -> String {
    db.statements()
        .into_iter()
        .rev()
        .find(|s| s.starts_with(prefix))
        .unwrap_or_default()
}

/// Test listing a dataset without geometry
#[tokio::test]
async fn test_index_without_geometry() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query(
        "FROM \"public\".\"contacts\" t0",
        rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])),
    );

    let collection = provider(plain_config(), &db).index(&IndexQuery::new()).await?;

    assert_eq!(collection.number_matched, 2);
    assert_eq!(collection.number_returned, 2);
    assert_eq!(collection.crs, None);
    assert_eq!(collection.bbox, None);
    let value = serde_json::to_value(&collection).unwrap();
    assert_eq!(value["crs"], Value::Null);
    assert_eq!(value["features"][1]["id"], json!(2));
    assert_eq!(value["features"][1]["properties"], json!({"name": "b"}));
    assert_eq!(
        db.statements(),
        ["SELECT t0.\"id\" AS \"id\", t0.\"name\" AS \"name\" FROM \"public\".\"contacts\" t0"]
    );
    Ok(())
}

/// Test that bbox, filter, datasource filter and sort end up in one statement
#[tokio::test]
async fn test_index_composes_where_clause() -> Result<()> {
    let db = MockDatabase::new();
    let mut row = point_row(1, "a");
    row["__extent"] = json!("BOX(2606000 1228000,2607000 1229000)");
    db.on_query("FROM \"public\".\"edit_points\" t0", rows(json!([row])));

    let query = IndexQuery::new()
        .with_bbox(Bbox::new(2_600_000.0, 1_200_000.0, 2_700_000.0, 1_300_000.0))
        .with_filter(r#"[["owner", "=", "parks"]]"#)
        .with_sort("-height");
    let collection = provider(points_config(), &db).index(&query).await?;

    let (sql, params) = db.executed().pop().unwrap();
    assert!(sql.contains(
        "FROM \"public\".\"edit_points\" t0 LEFT JOIN \"public\".\"owners\" t1 ON t0.\"owner_id\" = t1.\"id\""
    ));
    assert!(sql.contains(
        "WHERE (deleted IS NOT TRUE) \
         AND ST_Intersects(t0.\"geom\", ST_MakeEnvelope(:minx, :miny, :maxx, :maxy, 2056)) \
         AND (t1.\"name\" = :v0)"
    ));
    assert!(sql.ends_with("ORDER BY t0.\"height\" DESC"));
    assert!(sql.contains("ST_Extent(t0.\"geom\") OVER ()::text AS \"__extent\""));
    assert!(!sql.contains("secret"));
    assert_eq!(params["minx"], json!(2_600_000.0));
    assert_eq!(params["v0"], json!("parks"));

    assert_eq!(collection.crs, Some(Crs::epsg(2056)));
    assert_eq!(
        collection.bbox,
        Some(Bbox::new(2_606_000.0, 1_228_000.0, 2_607_000.0, 1_229_000.0))
    );
    let feature = collection.returned().next().unwrap();
    assert_eq!(feature.id, Some(FeatureId::Int(1)));
    assert!(!feature.properties.contains_key("secret"));
    assert!(matches!(feature.geometry, Some(Some(_))));
    assert_eq!(
        feature.bbox,
        Some(Bbox::new(2_606_000.0, 1_228_000.0, 2_606_000.0, 1_228_000.0))
    );
    Ok(())
}

/// Test that a client SRID reprojects the envelope and the output
#[tokio::test]
async fn test_index_client_srid() -> Result<()> {
    let db = MockDatabase::new();
    let query = IndexQuery::new()
        .with_srid(4326)
        .with_bbox(Bbox::new(7.0, 46.0, 8.0, 47.0));
    let collection = provider(points_config(), &db).index(&query).await?;

    let sql = last_statement(&db, "SELECT");
    assert!(sql.contains(
        "ST_Intersects(t0.\"geom\", ST_Transform(ST_MakeEnvelope(:minx, :miny, :maxx, :maxy, 4326), 2056))"
    ));
    assert!(sql.contains("ST_AsGeoJSON(ST_CurveToLine(ST_Transform(t0.\"geom\", 4326)))"));
    assert_eq!(collection.crs, Some(Crs::epsg(4326)));
    assert_eq!(collection.number_matched, 0);
    assert_eq!(collection.bbox, None);
    Ok(())
}

/// Test that rows outside the window become placeholders
#[tokio::test]
async fn test_index_pagination_keeps_positions() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query(
        "FROM \"public\".\"contacts\" t0",
        rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}, {"id": 3, "name": "c"}])),
    );

    let query = IndexQuery::new().with_offset(1).with_limit(1);
    let collection = provider(plain_config(), &db).index(&query).await?;

    assert_eq!(collection.number_matched, 3);
    assert_eq!(collection.number_returned, 1);
    assert_eq!(collection.features.len(), 3);
    let value = serde_json::to_value(&collection).unwrap();
    assert_eq!(value["features"][0], json!({}));
    assert_eq!(value["features"][1]["id"], json!(2));
    assert_eq!(value["features"][2], json!({}));
    Ok(())
}

/// Test that SQL Server folds per-row envelopes on the client
#[tokio::test]
async fn test_index_mssql_extent_fold() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query(
        "FROM [public].[edit_points] t0",
        rows(json!([
            {"id": 1, "name": "a", "__geometry": "POINT(1 2)", "__bbox": "BOX(1 2,1 2)"},
            {"id": 2, "name": "b", "__geometry": "POINT(5 6)", "__bbox": "BOX(5 6,5 6)"}
        ])),
    );
    let mut config = points_config();
    config.backend = "mssql".to_string();

    let collection = provider(config, &db).index(&IndexQuery::new()).await?;

    assert_eq!(collection.bbox, Some(Bbox::new(1.0, 2.0, 5.0, 6.0)));
    let first = collection.returned().next().unwrap();
    assert_eq!(
        first.geometry.as_ref().and_then(Option::as_ref).map(|g| g.value.clone()),
        Some(geojson::Value::Point(vec![1.0, 2.0]))
    );
    let sql = last_statement(&db, "SELECT");
    assert!(sql.contains("t0.[geom].STAsText() AS [__geometry]"));
    assert!(!sql.contains("__extent"));
    Ok(())
}

/// Test that an invalid filter never reaches the database
#[tokio::test]
async fn test_index_rejects_unknown_filter_column() {
    let db = MockDatabase::new();
    let query = IndexQuery::new().with_filter(r#"[["name", "=", "a"], "and", ["count", ">", 5]]"#);

    let err = provider(points_config(), &db).index(&query).await.unwrap_err();

    match err {
        GeoCrudError::Parse(ParseError::Filter(issues)) => {
            assert_eq!(issues.len(), 1);
            assert!(issues[0].entry.contains("count"));
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(db.events().is_empty());
}

/// Test that filter values only ever travel as parameters
#[tokio::test]
async fn test_index_filter_values_are_bound() -> Result<()> {
    let db = MockDatabase::new();
    let query = IndexQuery::new()
        .with_filter(r#"[["name", "=", "x'; DROP TABLE edit_points; --"], "or", ["?legacy", "=", 1]]"#);

    provider(points_config(), &db).index(&query).await?;

    let (sql, params) = db.executed().pop().unwrap();
    assert!(!sql.contains("DROP TABLE"));
    assert!(!sql.contains("legacy"));
    assert!(sql.contains("t0.\"name\" = :v0"));
    assert_eq!(params["v0"], json!("x'; DROP TABLE edit_points; --"));
    Ok(())
}

/// Test that an empty filter text is an error rather than "no filter"
#[tokio::test]
async fn test_index_empty_filter() {
    let db = MockDatabase::new();
    let err = provider(plain_config(), &db)
        .index(&IndexQuery::new().with_filter(""))
        .await
        .unwrap_err();
    assert!(matches!(err, GeoCrudError::Parse(ParseError::EmptyExpression)));
}

/// Test intersecting with a filter geometry
#[tokio::test]
async fn test_index_filter_geometry() -> Result<()> {
    let db = MockDatabase::new();
    let polygon = geojson::Geometry::new(geojson::Value::Polygon(vec![vec![
        vec![0.0, 0.0],
        vec![1.0, 0.0],
        vec![1.0, 1.0],
        vec![0.0, 0.0],
    ]]));

    provider(points_config(), &db)
        .index(&IndexQuery::new().with_filter_geom(polygon))
        .await?;

    let (sql, params) = db.executed().pop().unwrap();
    assert!(sql.contains(
        "ST_Intersects(t0.\"geom\", ST_SetSRID(ST_GeomFromGeoJSON(:__filter_geom), 2056))"
    ));
    assert!(params["__filter_geom"].as_str().unwrap().contains("Polygon"));
    Ok(())
}

/// Test the permission gates of the read operations
#[tokio::test]
async fn test_reads_require_permission() {
    let db = MockDatabase::new();
    let config = DatasetConfig {
        readable: Some(false),
        ..points_config()
    };
    let provider = provider(config, &db);

    for err in [
        provider.index(&IndexQuery::new()).await.unwrap_err(),
        provider.show(&FeatureId::Int(1), None, None).await.unwrap_err(),
        provider.extent(None, None).await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            GeoCrudError::PermissionDenied {
                operation: Operation::Read
            }
        ));
    }
    assert!(db.events().is_empty());
}

/// Test showing one feature inside the datasource filter
#[tokio::test]
async fn test_show() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([point_row(1, "a")])));

    let feature = provider(points_config(), &db)
        .show(&FeatureId::Int(1), None, None)
        .await?;

    assert_eq!(feature.id, Some(FeatureId::Int(1)));
    assert_eq!(feature.crs, Some(Crs::epsg(2056)));
    assert!(feature.bbox.is_some());
    assert_eq!(
        feature.properties.keys().collect::<Vec<_>>(),
        ["name", "height", "owner", "created"]
    );
    let (sql, params) = db.executed().pop().unwrap();
    assert!(sql.ends_with("WHERE t0.\"id\" = :__id AND (deleted IS NOT TRUE) LIMIT 1"));
    assert_eq!(params["__id"], json!(1));
    Ok(())
}

/// Test showing a field subset
#[tokio::test]
async fn test_show_field_subset() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([{"id": "a1", "name": "a"}])));
    let fields = vec!["name".to_string()];

    let feature = provider(plain_config(), &db)
        .show(&FeatureId::Str("a1".to_string()), None, Some(fields.as_slice()))
        .await?;

    assert_eq!(feature.id, Some(FeatureId::Str("a1".to_string())));
    assert_eq!(feature.geometry, None);
    assert!(!last_statement(&db, "SELECT").contains("JOIN"));
    Ok(())
}

/// Test that a missing row is reported as not found
#[tokio::test]
async fn test_show_not_found() {
    let db = MockDatabase::new();
    let err = provider(points_config(), &db)
        .show(&FeatureId::Int(9), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GeoCrudError::NotFound { ref id } if id == "9"));
}

/// Test the full create path: validate, insert, re-read, commit
#[tokio::test]
async fn test_create() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("AS wkt_geom", rows(valid_point_check()));
    db.on_query("INSERT INTO", rows(json!([{"id": 7}])));
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([point_row(7, "new")])));

    let payload = point_payload(
        2056,
        json!({"name": "new", "height": 3, "owner": "parks", "created": "ignored"}),
    );
    let feature = provider(points_config(), &db).create(payload).await?;

    assert_eq!(feature.id, Some(FeatureId::Int(7)));
    assert_eq!(feature.properties["name"], json!("new"));
    assert_eq!(
        last_statement(&db, "INSERT"),
        "INSERT INTO \"public\".\"edit_points\" (\"name\", \"height\", \"geom\") \
         VALUES (:__val0, :__val1, ST_SetSRID(ST_GeomFromGeoJSON(:__geom), 2056)) RETURNING \"id\""
    );
    let reselect = last_statement(&db, "SELECT t0.");
    assert!(!reselect.contains("deleted IS NOT TRUE"));

    let events = db.events();
    assert_eq!(events.last(), Some(&MockEvent::Commit));
    // validation ran on its own connection and was rolled back
    assert!(events.contains(&MockEvent::Rollback));
    assert_eq!(
        events.iter().filter(|e| **e == MockEvent::Connect).count(),
        2
    );
    Ok(())
}

/// Test writing defaulted columns and reprojecting client geometries
#[tokio::test]
async fn test_create_defaulted_and_client_srid() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("AS wkt_geom", rows(valid_point_check()));
    db.on_query("INSERT INTO", rows(json!([{"id": 8}])));
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([point_row(8, "x")])));

    let mut payload = point_payload(4326, json!({"name": "x"}));
    payload["defaultedProperties"] = json!(["height"]);
    let feature = provider(points_config(), &db).create(payload).await?;

    assert_eq!(
        last_statement(&db, "INSERT"),
        "INSERT INTO \"public\".\"edit_points\" (\"name\", \"height\", \"geom\") \
         VALUES (:__val0, DEFAULT, ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(:__geom), 4326), 2056)) \
         RETURNING \"id\""
    );
    assert!(
        last_statement(&db, "SELECT t0.")
            .contains("ST_AsGeoJSON(ST_CurveToLine(ST_Transform(t0.\"geom\", 4326)))")
    );
    assert_eq!(feature.crs, Some(Crs::epsg(4326)));
    Ok(())
}

/// Test that a structurally invalid payload is rejected before any query
#[tokio::test]
async fn test_create_null_geometry_rejected() {
    let db = MockDatabase::new();
    let payload = json!({"type": "Feature", "geometry": null, "properties": {"name": "a"}});

    let err = provider(points_config(), &db).create(payload).await.unwrap_err();

    match err {
        GeoCrudError::Validation(failure) => {
            assert_eq!(failure.report.validation_errors, ["Geometry may not be null"]);
            assert!(failure.report.geometry_errors.is_empty());
            assert!(failure.report.data_errors.is_empty());
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(db.statements().is_empty());
}

/// Test that field errors block the write
#[tokio::test]
async fn test_create_data_errors() {
    let db = MockDatabase::new();
    db.on_query("AS wkt_geom", rows(valid_point_check()));

    let payload = point_payload(2056, json!({"height": 2_147_483_648_i64}));
    let err = provider(points_config(), &db).create(payload).await.unwrap_err();

    match err {
        GeoCrudError::Validation(failure) => {
            assert_eq!(
                failure.report.data_errors,
                ["Invalid value for 'height' for type integer"]
            );
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(last_statement(&db, "INSERT").is_empty());
}

/// Test that constraint violations become commit failures and roll back
#[tokio::test]
async fn test_create_commit_failure() {
    let db = MockDatabase::new();
    db.on_query("AS wkt_geom", rows(valid_point_check()));
    db.on_error(
        "INSERT INTO",
        DbError::new(
            DbErrorKind::Integrity,
            "duplicate key value violates unique constraint \"edit_points_name_key\"",
        )
        .with_detail("Key (name)=(a) already exists."),
    );

    let err = provider(points_config(), &db)
        .create(point_payload(2056, json!({"name": "a"})))
        .await
        .unwrap_err();

    match &err {
        GeoCrudError::Commit(failure) => {
            assert_eq!(failure.detail.as_deref(), Some("Key (name)=(a) already exists."));
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_recoverable());
    assert_eq!(err.status_class().code(), 422);
    assert_eq!(db.events().last(), Some(&MockEvent::Rollback));
    assert!(!db.events().contains(&MockEvent::Commit));
}

/// Test that unexpected database errors propagate unchanged
#[tokio::test]
async fn test_create_connection_error_propagates() {
    let db = MockDatabase::new();
    db.on_query("AS wkt_geom", rows(valid_point_check()));
    db.on_error(
        "INSERT INTO",
        DbError::new(DbErrorKind::Connection, "server closed the connection"),
    );

    let err = provider(points_config(), &db)
        .create(point_payload(2056, json!({"name": "a"})))
        .await
        .unwrap_err();

    assert!(matches!(err, GeoCrudError::Database(_)));
    assert_eq!(err.status_class().code(), 500);
}

/// Test the create permission gate
#[tokio::test]
async fn test_create_requires_permission() {
    let db = MockDatabase::new();
    let config = DatasetConfig::builder("public", "edit_points", "id")
        .with_attribute("name", FieldSpec::new("text"))
        .with_permissions(Permissions {
            creatable: false,
            readable: true,
            updatable: true,
            deletable: true,
        })
        .build()
        .unwrap();

    let err = provider(config, &db)
        .create(json!({"type": "Feature", "properties": {"name": "a"}}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GeoCrudError::PermissionDenied {
            operation: Operation::Create
        }
    ));
    assert!(db.events().is_empty());
}

/// Test updating one column inside the datasource filter
#[tokio::test]
async fn test_update() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("UPDATE", rows(json!([{"id": 5}])));
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([point_row(5, "renamed")])));

    let feature = provider(points_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({"type": "Feature", "properties": {"name": "renamed"}}),
        )
        .await?;

    assert_eq!(feature.properties["name"], json!("renamed"));
    let (sql, params) = db
        .executed()
        .into_iter()
        .find(|(sql, _)| sql.starts_with("UPDATE"))
        .unwrap();
    assert_eq!(
        sql,
        "UPDATE \"public\".\"edit_points\" SET (\"name\") = ROW(:__val0) \
         WHERE \"id\" = :__id AND (deleted IS NOT TRUE) RETURNING \"id\""
    );
    assert_eq!(params["__val0"], json!("renamed"));
    assert_eq!(params["__id"], json!(5));
    assert_eq!(db.events().last(), Some(&MockEvent::Commit));
    Ok(())
}

/// Test that an update of only read-only fields writes nothing
#[tokio::test]
async fn test_update_read_only_only() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("WHERE t0.\"id\" = :__id", rows(json!([point_row(5, "a")])));

    let feature = provider(points_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({"type": "Feature", "properties": {"created": "2030-01-01"}}),
        )
        .await?;

    assert_eq!(feature.properties["created"], json!("2024-05-01"));
    assert!(last_statement(&db, "UPDATE").is_empty());
    assert!(!db.events().contains(&MockEvent::Commit));
    Ok(())
}

/// Test updating a row that does not exist
#[tokio::test]
async fn test_update_not_found() {
    let db = MockDatabase::new();

    let err = provider(points_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({"type": "Feature", "properties": {"name": "x"}}),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GeoCrudError::NotFound { ref id } if id == "5"));
    assert_eq!(db.events().last(), Some(&MockEvent::Rollback));
}

fn notes_config() -> DatasetConfig {
    DatasetConfig::builder("public", "notes", "id")
        .with_attribute("meta", FieldSpec::new("jsonb"))
        .with_attribute("tags", FieldSpec::new("json"))
        .with_geometry("geom", GeometryType::Any, 2056)
        .with_allow_null_geometry(true)
        .with_writable(true)
        .build()
        .unwrap()
}

/// Test that json values are written as the same text the validator cast
#[tokio::test]
async fn test_update_json_values_serialized() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("UPDATE", rows(json!([{"id": 5}])));
    db.on_query(
        "WHERE t0.\"id\" = :__id",
        rows(json!([{"id": 5, "meta": "abc", "tags": {"a": 1}}])),
    );

    provider(notes_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({"type": "Feature", "properties": {"meta": "abc", "tags": {"a": 1}}}),
        )
        .await?;

    let executed = db.executed();
    let probe_values: Vec<&Value> = executed
        .iter()
        .filter(|(sql, _)| sql.starts_with("SELECT CAST("))
        .map(|(_, params)| &params["value"])
        .collect();
    assert_eq!(probe_values, [&json!("\"abc\""), &json!("{\"a\":1}")]);

    let (_, params) = executed
        .iter()
        .find(|(sql, _)| sql.starts_with("UPDATE"))
        .unwrap();
    assert_eq!(params["__val0"], json!("\"abc\""));
    assert_eq!(params["__val1"], json!("{\"a\":1}"));
    Ok(())
}

/// Test that a malformed CRS is rejected even without geometry
#[tokio::test]
async fn test_update_rejects_crs_without_geometry() {
    let db = MockDatabase::new();

    let err = provider(notes_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({
                "type": "Feature",
                "geometry": null,
                "crs": "EPSG:2056",
                "properties": {"meta": 1}
            }),
        )
        .await
        .unwrap_err();

    match err {
        GeoCrudError::Validation(failure) => {
            assert_eq!(failure.report.validation_errors, ["Invalid GeoJSON CRS"]);
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(last_statement(&db, "UPDATE").is_empty());
}

/// Test that payload members failing to decode are reported through the translator
#[tokio::test]
async fn test_update_rejects_malformed_bbox() {
    let db = MockDatabase::new();

    let err = provider(notes_config(), &db)
        .update(
            &FeatureId::Int(5),
            json!({"type": "Feature", "bbox": "everywhere", "properties": {"meta": 1}}),
        )
        .await
        .unwrap_err();

    match err {
        GeoCrudError::Validation(failure) => {
            assert_eq!(failure.report.validation_errors, ["Invalid GeoJSON feature"]);
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(last_statement(&db, "UPDATE").is_empty());
}

/// Test deleting rows
#[tokio::test]
async fn test_destroy() -> Result<()> {
    let db = MockDatabase::new();
    db.on_fn("DELETE FROM", |_, params| {
        Ok(if params["__id"] == json!(3) {
            rows(json!([{"id": 3}]))
        } else {
            Vec::new()
        })
    });
    let provider = provider(points_config(), &db);

    assert!(provider.destroy(&FeatureId::Int(3)).await?);
    assert_eq!(
        last_statement(&db, "DELETE"),
        "DELETE FROM \"public\".\"edit_points\" WHERE \"id\" = :__id AND (deleted IS NOT TRUE) RETURNING \"id\""
    );
    assert_eq!(db.events().last(), Some(&MockEvent::Commit));

    assert!(!provider.destroy(&FeatureId::Int(4)).await?);
    assert_eq!(db.events().last(), Some(&MockEvent::Rollback));
    Ok(())
}

/// Test the delete permission gate
#[tokio::test]
async fn test_destroy_requires_permission() {
    let db = MockDatabase::new();
    let config = DatasetConfig {
        deletable: Some(false),
        ..points_config()
    };
    let err = provider(config, &db)
        .destroy(&FeatureId::Int(3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GeoCrudError::PermissionDenied {
            operation: Operation::Delete
        }
    ));
}

/// Test the existence probe
#[tokio::test]
async fn test_exists() -> Result<()> {
    let db = MockDatabase::new();
    db.on_fn("SELECT EXISTS", |_, params| {
        Ok(rows(json!([{"exists": params["__id"] == json!(1)}])))
    });
    let provider = provider(points_config(), &db);

    assert!(provider.exists(&FeatureId::Int(1)).await?);
    assert!(!provider.exists(&FeatureId::Int(2)).await?);
    assert_eq!(
        last_statement(&db, "SELECT"),
        "SELECT EXISTS(SELECT 1 FROM \"public\".\"edit_points\" \
         WHERE \"id\" = :__id AND (deleted IS NOT TRUE)) AS exists"
    );
    Ok(())
}

/// Test the extent aggregate
#[tokio::test]
async fn test_extent() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query("ST_Extent(", rows(json!([{"__extent": "BOX(1 2,3 4)"}])));

    let extent = provider(points_config(), &db)
        .extent(Some(4326), Some(r#"[["name", "=", "a"]]"#))
        .await?;

    assert_eq!(extent, Some(Bbox::new(1.0, 2.0, 3.0, 4.0)));
    let (sql, params) = db.executed().pop().unwrap();
    assert_eq!(
        sql,
        "SELECT ST_Extent(ST_Transform(t0.\"geom\", 4326))::text AS \"__extent\" \
         FROM \"public\".\"edit_points\" t0 WHERE (deleted IS NOT TRUE) AND (t0.\"name\" = :v0)"
    );
    assert_eq!(params["v0"], json!("a"));
    Ok(())
}

/// Test that a dataset without geometry has no extent
#[tokio::test]
async fn test_extent_without_geometry() -> Result<()> {
    let db = MockDatabase::new();
    assert_eq!(provider(plain_config(), &db).extent(None, None).await?, None);
    assert!(db.events().is_empty());
    Ok(())
}

/// Test listing key/value pairs
#[tokio::test]
async fn test_keyvals() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query(
        "ORDER BY",
        rows(json!([{"value": 1, "label": "Alpha"}, {"value": 2, "label": null}])),
    );

    let options = provider(points_config(), &db).keyvals("code", "title").await?;

    assert_eq!(options.len(), 2);
    assert_eq!(options[0].value, json!(1));
    assert_eq!(options[0].label, "Alpha");
    assert_eq!(options[1].label, "");
    assert_eq!(
        last_statement(&db, "SELECT"),
        "SELECT \"code\" AS \"value\", \"title\" AS \"label\" FROM \"public\".\"edit_points\" ORDER BY \"title\""
    );
    Ok(())
}

/// Test dropping conditional attributes whose column is missing
#[tokio::test]
async fn test_open_drops_missing_columns() -> Result<()> {
    let db = MockDatabase::new();
    db.on_query(
        "information_schema.columns",
        rows(json!([{"column_name": "id"}, {"column_name": "name"}])),
    );
    let config = DatasetConfig::builder("public", "contacts", "id")
        .with_attribute("name", FieldSpec::new("text"))
        .with_attribute(
            "legacy",
            FieldSpec::new("text").with_constraints(FieldConstraints {
                only_if_exists: true,
                ..FieldConstraints::default()
            }),
        )
        .build()
        .unwrap();

    let provider = DatasetFeaturesProvider::open(
        config,
        DbHandles::shared(Arc::new(db.clone())),
        Arc::new(DefaultTranslator::new()),
    )
    .await?;

    assert_eq!(provider.config().attributes, ["name"]);
    let (_, params) = db.executed().pop().unwrap();
    assert_eq!(params["schema"], json!("public"));
    assert_eq!(params["table"], json!("contacts"));
    Ok(())
}
