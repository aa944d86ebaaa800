//! `geocrud-core` is the core library of the `geocrud` project: permission-aware CRUD
//! access to relational and spatial datasets.
//!
//! This crate includes:
//! - **Filter Parser** ([`filter`]): JSON filter expressions to parameterized SQL.
//! - **Spatial Dialects** ([`spatial`]): PostGIS and SQL Server spatial SQL.
//! - **Projection** ([`projection`]): attribute lists to select lists and joins.
//! - **Validation** ([`validation`]): GeoJSON, geometry and field checks, evaluated by
//!   the database where the database is the authority.
//! - **Provider** ([`provider`]): the feature operations on one dataset.
//!
//! Database access goes through the [`geocrud_core_common::Database`] trait, so the
//! provider runs unchanged against a real backend or the in-memory test double.

pub mod bbox;
pub mod config;
pub mod error;
pub mod feature;
pub mod filter;
pub mod i18n;
pub mod projection;
pub mod provider;
pub mod spatial;
pub mod validation;

pub use config::{DatasetConfig, DbHandles, FieldSpec};
pub use error::{GeoCrudError, Result};
pub use feature::{Feature, FeatureCollection, FeatureId};
pub use provider::{DatasetFeaturesProvider, IndexQuery, KeyValRel};
