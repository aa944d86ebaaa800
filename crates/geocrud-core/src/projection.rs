//! Projection and join resolution.
//!
//! Attributes are either columns of the base table or, when their field carries a
//! `joinfield`, columns of a configured join table. [`resolve_projection`] turns the
//! permitted attribute list (optionally narrowed to a requested subset) into a
//! select list and one `LEFT JOIN` per join table actually needed.
//!
//! The base table is aliased `t0`; join tables get `t1`, `t2`, ... by their position
//! in the dataset's join table map, so an alias never depends on which attributes a
//! request selects.

use std::collections::BTreeMap;

use crate::config::DatasetConfig;
use crate::spatial::SpatialDialect;

const BASE_ALIAS: &str = "t0";

/// A column reachable from the query.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    /// Qualified expression, e.g. `t1."name"`
    expr: String,
    /// Quoted output name
    label: String,
    /// Join table the column lives in
    join: Option<String>,
}

/// Resolved select list and joins of one query.
#[derive(Debug, Clone)]
pub struct Projection {
    primary_key: String,
    key_column: Column,
    attributes: Vec<String>,
    columns: BTreeMap<String, Column>,
    joins: BTreeMap<String, String>,
    active_joins: Vec<String>,
}

/// Resolves the projection of `config`'s attributes.
///
/// With `requested`, only attributes in that subset are selected and only their
/// joins are emitted. The primary key is always selected.
///
/// # Examples
///
/// ```
/// use geocrud_core::config::{DatasetConfig, FieldSpec, JoinTable};
/// use geocrud_core::projection::resolve_projection;
/// use geocrud_core::spatial::PostgisDialect;
///
/// let config = DatasetConfig::builder("public", "parcels", "id")
///     .with_attribute("number", FieldSpec::new("text"))
///     .with_attribute("owner", FieldSpec::new("text").with_joinfield("owners", "name"))
///     .with_jointable("owners", JoinTable {
///         schema: None,
///         table_name: "owners".into(),
///         target_field: "owner_id".into(),
///         join_field: "id".into(),
///     })
///     .build()
///     .unwrap();
///
/// let projection = resolve_projection(&config, &PostgisDialect, None);
/// assert_eq!(
///     projection.select_list(),
///     r#"t0."id" AS "id", t0."number" AS "number", t1."name" AS "owner""#
/// );
/// assert_eq!(
///     projection.join_sql(),
///     r#"LEFT JOIN "public"."owners" t1 ON t0."owner_id" = t1."id""#
/// );
///
/// let narrow = resolve_projection(&config, &PostgisDialect, Some(&["number".to_string()][..]));
/// assert_eq!(narrow.select_list(), r#"t0."id" AS "id", t0."number" AS "number""#);
/// assert_eq!(narrow.join_sql(), "");
/// ```
#[must_use]
pub fn resolve_projection(
    config: &DatasetConfig,
    dialect: &dyn SpatialDialect,
    requested: Option<&[String]>,
) -> Projection {
    let mut joins = BTreeMap::new();
    let mut aliases = BTreeMap::new();
    for (position, (name, table)) in config.jointables.iter().enumerate() {
        let alias = format!("t{}", position + 1);
        let schema = table.schema.as_deref().unwrap_or(&config.schema);
        let sql = format!(
            "LEFT JOIN {} {alias} ON {BASE_ALIAS}.{} = {alias}.{}",
            dialect.qualified_table(schema, &table.table_name),
            dialect.quote_ident(&table.target_field),
            dialect.quote_ident(&table.join_field),
        );
        joins.insert(name.clone(), sql);
        aliases.insert(name.clone(), alias);
    }

    let mut columns = BTreeMap::new();
    for attribute in &config.attributes {
        let label = dialect.quote_ident(attribute);
        let joinfield = config
            .field(attribute)
            .and_then(|f| f.joinfield.as_ref())
            .and_then(|jf| aliases.get(&jf.table).map(|alias| (jf, alias)));
        let column = match joinfield {
            Some((joinfield, alias)) => Column {
                expr: format!("{alias}.{}", dialect.quote_ident(&joinfield.field)),
                label,
                join: Some(joinfield.table.clone()),
            },
            None => Column {
                expr: format!("{BASE_ALIAS}.{label}"),
                label,
                join: None,
            },
        };
        columns.insert(attribute.clone(), column);
    }

    let key_label = dialect.quote_ident(&config.primary_key);
    let key_column = Column {
        expr: format!("{BASE_ALIAS}.{key_label}"),
        label: key_label,
        join: None,
    };

    let mut projection = Projection {
        primary_key: config.primary_key.clone(),
        key_column,
        attributes: Vec::new(),
        columns,
        joins,
        active_joins: Vec::new(),
    };
    for attribute in &config.attributes {
        if requested.is_none_or(|r| r.contains(attribute)) {
            projection.require(attribute);
            projection.attributes.push(attribute.clone());
        }
    }
    projection
}

impl Projection {
    /// Selected attributes in dataset order.
    #[must_use]
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Primary key column name.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Makes `attribute` usable in expressions, adding its join if needed.
    ///
    /// Returns `false` if the attribute is unknown.
    pub fn require(&mut self, attribute: &str) -> bool {
        if attribute == self.primary_key {
            return true;
        }
        let Some(column) = self.columns.get(attribute) else {
            return false;
        };
        if let Some(table) = &column.join {
            if !self.active_joins.contains(table) {
                self.active_joins.push(table.clone());
            }
        }
        true
    }

    /// SQL expression of `attribute` or the primary key, e.g. `t1."name"`.
    #[must_use]
    pub fn column_expr(&self, attribute: &str) -> Option<String> {
        if attribute == self.primary_key {
            return Some(self.key_column.expr.clone());
        }
        self.columns.get(attribute).map(|c| c.expr.clone())
    }

    /// Base-table expression for a column outside the attribute list, such as the
    /// geometry column.
    #[must_use]
    pub fn base_column(dialect: &dyn SpatialDialect, column: &str) -> String {
        format!("{BASE_ALIAS}.{}", dialect.quote_ident(column))
    }

    /// `t0."pk" AS "pk", t0."a" AS "a", t1."f" AS "b", ...`
    #[must_use]
    pub fn select_list(&self) -> String {
        let key = std::iter::once(&self.key_column);
        let attributes = self
            .attributes
            .iter()
            .filter(|a| **a != self.primary_key)
            .filter_map(|a| self.columns.get(a));
        key.chain(attributes)
            .map(|c| format!("{} AS {}", c.expr, c.label))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Join clauses in alias order, space-separated; empty without joins.
    #[must_use]
    pub fn join_sql(&self) -> String {
        self.joins
            .iter()
            .filter(|(table, _)| self.active_joins.contains(table))
            .map(|(_, sql)| sql.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `FROM` target: the aliased base table followed by the joins.
    #[must_use]
    pub fn from_sql(&self, table_sql: &str) -> String {
        let joins = self.join_sql();
        if joins.is_empty() {
            format!("{table_sql} {BASE_ALIAS}")
        } else {
            format!("{table_sql} {BASE_ALIAS} {joins}")
        }
    }
}
