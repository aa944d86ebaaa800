//! Field type and constraint checks.
//!
//! Every provided value is cast by the database to its column type inside its own
//! savepoint, so the engine decides what a valid `date`, `uuid` or `numeric(5,2)` is.
//! Constraints are then checked against the cast value.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use geocrud_core_common::{Connection, DbErrorKind, DbResult, Savepoint, params};

use super::ValidationScratch;
use crate::config::{DatasetConfig, FieldConstraints, FieldSpec};
use crate::i18n::Translator;
use crate::spatial::{CastSource, SpatialDialect};

/// Checks the provided properties of `feature`, then strips `readOnly` and empty
/// hidden properties and checks required ones.
pub(super) async fn check_fields(
    conn: &mut dyn Connection,
    config: &DatasetConfig,
    feature: &mut Value,
    dialect: &dyn SpatialDialect,
    tr: &dyn Translator,
    scratch: &mut ValidationScratch,
) -> DbResult<Vec<String>> {
    let mut errors = Vec::new();
    if config.fields.is_empty() {
        return Ok(errors);
    }
    let Some(properties) = feature.get_mut("properties").and_then(Value::as_object_mut) else {
        return Ok(errors);
    };

    for (attribute, input) in properties.iter() {
        let Some(field) = config.field(attribute) else {
            continue;
        };
        let constraints = &field.constraints;
        if constraints.read_only || input.is_null() {
            continue;
        }

        let data_type =
            resolve_type(&mut *conn, config, attribute, field, dialect, scratch).await?;
        let invalid_value =
            || tr.tr("validation.invalid_value", &[attribute.as_str(), data_type.as_str()]);

        let input = if field.is_json() {
            Value::String(input.to_string())
        } else {
            input.clone()
        };
        let Some(source) = CastSource::of(&input) else {
            errors.push(invalid_value());
            continue;
        };
        let Some(value) = cast(&mut *conn, dialect, source, &data_type, &input, scratch).await?
        else {
            errors.push(invalid_value());
            continue;
        };
        if value.is_null() {
            continue;
        }

        // the engine would silently accept 0 and 1
        if matches!(data_type.as_str(), "boolean" | "bool")
            && matches!(&input, Value::Number(n) if n.is_i64() || n.is_u64())
        {
            errors.push(invalid_value());
            continue;
        }

        errors.extend(check_constraints(
            attribute,
            &data_type,
            constraints,
            &value,
            tr,
        ));
    }

    strip_and_require(config, properties, tr, &mut errors);
    Ok(errors)
}

/// Cast target of a field: the catalog type for `USER-DEFINED` columns, a precise
/// `numeric(p,s)` when precision is configured.
async fn resolve_type(
    conn: &mut dyn Connection,
    config: &DatasetConfig,
    attribute: &str,
    field: &FieldSpec,
    dialect: &dyn SpatialDialect,
    scratch: &mut ValidationScratch,
) -> DbResult<String> {
    let constraints = &field.constraints;
    match field.data_type.as_str() {
        "USER-DEFINED" => {
            if let Some(resolved) = scratch.resolved_types.get(attribute) {
                return Ok(resolved.clone());
            }
            let sql = dialect.catalog_type_sql();
            log::debug!("catalog type lookup: {sql}");
            let params = params! {
                "schema" => config.schema.as_str(),
                "table" => config.table_name.as_str(),
                "column" => attribute,
            };
            let rows = conn.execute(&sql, &params).await?;
            let resolved = rows
                .first()
                .and_then(|row| row.get("defined_type"))
                .and_then(Value::as_str)
                .unwrap_or(field.data_type.as_str())
                .to_string();
            scratch
                .resolved_types
                .insert(attribute.to_string(), resolved.clone());
            Ok(resolved)
        },
        "numeric" => Ok(match constraints.numeric_precision {
            Some(precision) => format!(
                "numeric({precision},{})",
                constraints.numeric_scale.unwrap_or(0)
            ),
            None => "numeric".to_string(),
        }),
        "file" => Ok("text".to_string()),
        other => Ok(other.to_string()),
    }
}

/// Casts `input` to `data_type` inside a savepoint.
///
/// Returns `None` if the engine rejects the value.
async fn cast(
    conn: &mut dyn Connection,
    dialect: &dyn SpatialDialect,
    source: CastSource,
    data_type: &str,
    input: &Value,
    scratch: &mut ValidationScratch,
) -> DbResult<Option<Value>> {
    let name = scratch.next_savepoint("field_probe");
    let mut savepoint = Savepoint::open(conn, name).await?;
    let sql = dialect.cast_probe_sql(source, data_type);
    log::debug!("cast probe: {sql}");
    let result = savepoint
        .execute(&sql, &params! { "value" => input.clone() })
        .await;
    savepoint.rollback().await?;

    match result {
        Ok(rows) => Ok(Some(
            rows.into_iter()
                .next()
                .and_then(|mut row| row.remove("value"))
                .unwrap_or(Value::Null),
        )),
        Err(err) if matches!(err.kind, DbErrorKind::Data | DbErrorKind::Programming) => {
            log::debug!("cast to {data_type} rejected: {}", err.message);
            Ok(None)
        },
        Err(err) => Err(err),
    }
}

fn check_constraints(
    attribute: &str,
    data_type: &str,
    constraints: &FieldConstraints,
    value: &Value,
    tr: &dyn Translator,
) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(maxlength) = constraints.maxlength {
        if text_of(value).chars().count() > maxlength {
            errors.push(tr.tr(
                "validation.value_must_be_shorter_than",
                &[attribute, maxlength.to_string().as_str()],
            ));
        }
    }

    let exact = matches!(data_type, "bigint" | "int8");
    if let Some(min) = &constraints.min {
        if compare(value, min, exact) == Some(Ordering::Less) {
            errors.push(tr.tr(
                "validation.value_must_be_geq_to",
                &[attribute, text_of(min).as_str()],
            ));
        }
    }
    if let Some(max) = &constraints.max {
        if compare(value, max, exact) == Some(Ordering::Greater) {
            errors.push(tr.tr(
                "validation.value_must_be_leq_to",
                &[attribute, text_of(max).as_str()],
            ));
        }
    }

    if !constraints.values.is_empty() && value.as_str() != Some("") {
        let allowed: Vec<String> = constraints.values.iter().map(|o| text_of(&o.value)).collect();
        let permitted = if constraints.allow_multi {
            multi_values(value).is_some_and(|items| items.iter().all(|i| allowed.contains(i)))
        } else {
            allowed.contains(&text_of(value))
        };
        if !permitted {
            errors.push(tr.tr("validation.invalid_value_for", &[attribute]));
        }
    }

    errors
}

/// Removes `readOnly` and empty hidden properties, then reports missing required ones.
fn strip_and_require(
    config: &DatasetConfig,
    properties: &mut Map<String, Value>,
    tr: &dyn Translator,
    errors: &mut Vec<String>,
) {
    for (attribute, field) in &config.fields {
        let constraints = &field.constraints;
        if constraints.read_only {
            properties.shift_remove(attribute);
            continue;
        }
        if constraints.hidden && properties.get(attribute).is_some_and(is_blank) {
            properties.shift_remove(attribute);
        }
        if constraints.required {
            match properties.get(attribute) {
                None | Some(Value::Null) => {
                    errors.push(tr.tr(
                        "validation.missing_required_value_for",
                        &[attribute.as_str()],
                    ));
                },
                Some(Value::String(s)) if s.is_empty() => {
                    errors.push(tr.tr(
                        "validation.value_for_cannot_be_blank",
                        &[attribute.as_str()],
                    ));
                },
                Some(_) => {},
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    value.is_null() || value.as_str() == Some("")
}

/// Compares a cast value with a bound; integers exactly when `exact`, else as floats.
fn compare(value: &Value, bound: &Value, exact: bool) -> Option<Ordering> {
    if exact {
        if let (Some(v), Some(b)) = (as_i64(value), as_i64(bound)) {
            return Some(v.cmp(&b));
        }
    }
    as_f64(value)?.partial_cmp(&as_f64(bound)?)
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Text form used for length and membership checks.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Elements of a multi-value: a JSON array, its text, or a `{a,b}` array literal.
fn multi_values(value: &Value) -> Option<Vec<String>> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                items
            } else {
                let inner = text.strip_prefix('{')?.strip_suffix('}')?;
                return Some(
                    inner
                        .split(',')
                        .map(|item| item.trim().trim_matches('"').to_string())
                        .filter(|item| !item.is_empty())
                        .collect(),
                );
            }
        },
        _ => return None,
    };
    Some(items.iter().map(text_of).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValueOption;
    use crate::i18n::DefaultTranslator;
    use crate::spatial::PostgisDialect;
    use geocrud_core_common::testing::{MockDatabase, MockEvent, rows};
    use geocrud_core_common::Database;
    use serde_json::json;

    fn constraints(value: Value) -> FieldConstraints {
        serde_json::from_value(value).unwrap()
    }

    fn options(values: &[i64]) -> Vec<ValueOption> {
        values
            .iter()
            .map(|v| ValueOption {
                value: json!(v),
                label: format!("option {v}"),
            })
            .collect()
    }

    async fn run(db: &MockDatabase, config: &DatasetConfig, properties: Value) -> (Vec<String>, Value) {
        let mut feature = json!({"type": "Feature", "properties": properties});
        let mut conn = db.connect().await.unwrap();
        conn.begin().await.unwrap();
        let mut scratch = ValidationScratch::default();
        let errors = check_fields(
            &mut *conn,
            config,
            &mut feature,
            &PostgisDialect,
            &DefaultTranslator::new(),
            &mut scratch,
        )
        .await
        .unwrap();
        conn.rollback().await.unwrap();
        (errors, feature["properties"].clone())
    }

    fn typed(name: &str, data_type: &str) -> DatasetConfig {
        DatasetConfig::builder("public", "t", "id")
            .with_attribute(name, FieldSpec::new(data_type))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_integer_boundaries() {
        let db = MockDatabase::new();
        let config = typed("count", "integer");
        for valid in [json!(2_147_483_647), json!(-2_147_483_648_i64), json!("12")] {
            let (errors, _) = run(&db, &config, json!({"count": valid})).await;
            assert!(errors.is_empty(), "{valid}: {errors:?}");
        }
        for invalid in [json!(2_147_483_648_i64), json!(-2_147_483_649_i64), json!("abc")] {
            let (errors, _) = run(&db, &config, json!({"count": invalid})).await;
            assert_eq!(errors, ["Invalid value for 'count' for type integer"], "{invalid}");
        }
    }

    #[tokio::test]
    async fn test_failed_probe_does_not_abort_later_probes() {
        let db = MockDatabase::new();
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute("a", FieldSpec::new("smallint"))
            .with_attribute("b", FieldSpec::new("date"))
            .build()
            .unwrap();
        let (errors, _) = run(&db, &config, json!({"a": 40000, "b": "2024-02-29"})).await;
        assert_eq!(errors, ["Invalid value for 'a' for type smallint"]);
        let events = db.events();
        assert!(events.contains(&MockEvent::RollbackToSavepoint("field_probe_1".into())));
        assert!(events.contains(&MockEvent::ReleaseSavepoint("field_probe_2".into())));
    }

    #[tokio::test]
    async fn test_numeric_precision() {
        let db = MockDatabase::new();
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute(
                "price",
                FieldSpec::new("numeric").with_constraints(constraints(
                    json!({"numeric_precision": 5, "numeric_scale": 2}),
                )),
            )
            .build()
            .unwrap();
        let (errors, _) = run(&db, &config, json!({"price": 999.99})).await;
        assert!(errors.is_empty());
        let (errors, _) = run(&db, &config, json!({"price": 1000})).await;
        assert_eq!(errors, ["Invalid value for 'price' for type numeric(5,2)"]);
    }

    #[tokio::test]
    async fn test_bigint_bounds_from_strings() {
        let db = MockDatabase::new();
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute(
                "big",
                FieldSpec::new("bigint").with_constraints(constraints(
                    json!({"min": "-9223372036854775808", "max": "9007199254740993"}),
                )),
            )
            .build()
            .unwrap();
        let (errors, _) = run(&db, &config, json!({"big": i64::MIN})).await;
        assert!(errors.is_empty());
        let (errors, _) = run(&db, &config, json!({"big": 9_007_199_254_740_994_i64})).await;
        assert_eq!(
            errors,
            ["Value for 'big' must be less than or equal to 9007199254740993"]
        );
    }

    #[tokio::test]
    async fn test_length_and_range() {
        let db = MockDatabase::new();
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute(
                "name",
                FieldSpec::new("character varying")
                    .with_constraints(constraints(json!({"maxlength": 5}))),
            )
            .with_attribute(
                "ratio",
                FieldSpec::new("double precision")
                    .with_constraints(constraints(json!({"min": 0, "max": 1}))),
            )
            .build()
            .unwrap();
        let (errors, _) = run(&db, &config, json!({"name": "abcdef", "ratio": -0.5})).await;
        assert_eq!(
            errors,
            [
                "Value for 'name' must be shorter than 5 characters",
                "Value for 'ratio' must be greater than or equal to 0"
            ]
        );
        let (errors, _) = run(&db, &config, json!({"name": "abcde", "ratio": 1})).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_boolean_rejects_integers() {
        let db = MockDatabase::new();
        let config = typed("flag", "boolean");
        let (errors, _) = run(&db, &config, json!({"flag": 1})).await;
        assert_eq!(errors, ["Invalid value for 'flag' for type boolean"]);
        let (errors, _) = run(&db, &config, json!({"flag": "yes"})).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_enumerated_values() {
        let db = MockDatabase::new();
        let single = FieldConstraints {
            values: options(&[1, 2]),
            ..FieldConstraints::default()
        };
        let multi = FieldConstraints {
            values: options(&[1, 2, 3]),
            allow_multi: true,
            ..FieldConstraints::default()
        };
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute("kind", FieldSpec::new("smallint").with_constraints(single))
            .with_attribute("kinds", FieldSpec::new("text").with_constraints(multi))
            .build()
            .unwrap();

        let (errors, _) = run(&db, &config, json!({"kind": "2", "kinds": "{1,3}"})).await;
        assert!(errors.is_empty(), "{errors:?}");
        let (errors, _) = run(&db, &config, json!({"kind": 3, "kinds": "[1, 4]"})).await;
        assert_eq!(
            errors,
            ["Invalid value for 'kind'", "Invalid value for 'kinds'"]
        );
        let (errors, _) = run(&db, &config, json!({"kinds": "1;2"})).await;
        assert_eq!(errors, ["Invalid value for 'kinds'"]);
        let (errors, _) = run(&db, &config, json!({"kinds": ""})).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_json_values_cast_as_text() {
        let db = MockDatabase::new();
        let config = typed("meta", "jsonb");
        let (errors, _) = run(&db, &config, json!({"meta": {"tags": ["a"]}})).await;
        assert!(errors.is_empty());
        let (sql, params) = db.executed().pop().unwrap();
        assert!(sql.contains("AS jsonb"));
        assert_eq!(params["value"], json!("{\"tags\":[\"a\"]}"));
    }

    #[tokio::test]
    async fn test_user_defined_type_lookup() {
        let db = MockDatabase::new();
        db.on_query("AS defined_type", rows(json!([{"defined_type": "integer"}])));
        let config = typed("level", "USER-DEFINED");
        let (errors, _) = run(&db, &config, json!({"level": "high"})).await;
        assert_eq!(errors, ["Invalid value for 'level' for type integer"]);
        let (_, params) = db.executed().remove(0);
        assert_eq!(params["column"], json!("level"));
        assert_eq!(params["table"], json!("t"));
    }

    #[tokio::test]
    async fn test_read_only_required_hidden() {
        let db = MockDatabase::new();
        let config = DatasetConfig::builder("public", "t", "id")
            .with_attribute(
                "created",
                FieldSpec::new("timestamp")
                    .with_constraints(constraints(json!({"readOnly": true, "required": true}))),
            )
            .with_attribute(
                "secret",
                FieldSpec::new("text").with_constraints(constraints(json!({"hidden": true}))),
            )
            .with_attribute(
                "note",
                FieldSpec::new("text").with_constraints(constraints(json!({"hidden": true}))),
            )
            .with_attribute(
                "name",
                FieldSpec::new("text").with_constraints(constraints(json!({"required": true}))),
            )
            .build()
            .unwrap();

        let (errors, properties) = run(
            &db,
            &config,
            json!({"created": "garbage", "secret": "", "note": "kept", "name": "a"}),
        )
        .await;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(properties, json!({"note": "kept", "name": "a"}));
        // stripping is idempotent
        let (errors, again) = run(&db, &config, properties.clone()).await;
        assert!(errors.is_empty());
        assert_eq!(again, properties);

        let (errors, _) = run(&db, &config, json!({"name": ""})).await;
        assert_eq!(errors, ["Value for 'name' can not be blank"]);
        let (errors, _) = run(&db, &config, json!({"name": null})).await;
        assert_eq!(errors, ["Missing required value for 'name'"]);
        let (errors, _) = run(&db, &config, json!({})).await;
        assert_eq!(errors, ["Missing required value for 'name'"]);
    }

    #[test]
    fn test_multi_values() {
        assert_eq!(multi_values(&json!("[1, \"b\"]")), Some(vec!["1".into(), "b".into()]));
        assert_eq!(multi_values(&json!("{a,\"b c\"}")), Some(vec!["a".into(), "b c".into()]));
        assert_eq!(multi_values(&json!([true])), Some(vec!["true".into()]));
        assert_eq!(multi_values(&json!("a,b")), None);
        assert_eq!(multi_values(&json!(5)), None);
    }
}
