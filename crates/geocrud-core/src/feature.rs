//! Canonical feature and collection types.
//!
//! Features follow GeoJSON with a name-form CRS. On writes, `geometry` distinguishes
//! an absent key (keep the stored geometry) from an explicit `null` (store NULL).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::bbox::{Bbox, crs_urn};

/// Primary key of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    /// Integer key
    Int(i64),
    /// Any other key, e.g. a UUID
    Str(String),
}

impl FeatureId {
    /// Converts a database value into an id.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(FeatureId::Int).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| FeatureId::Str(format!("{f:.0}")))
            }),
            Value::String(s) => Some(FeatureId::Str(s.clone())),
            _ => None,
        }
    }

    /// Returns the id as a bind value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            FeatureId::Int(i) => Value::from(*i),
            FeatureId::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Int(i) => write!(f, "{i}"),
            FeatureId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FeatureId {
    fn from(id: i64) -> Self {
        FeatureId::Int(id)
    }
}

impl From<&str> for FeatureId {
    fn from(id: &str) -> Self {
        FeatureId::Str(id.to_string())
    }
}

impl FromStr for FeatureId {
    type Err = std::convert::Infallible;

    /// Integers become [`FeatureId::Int`], everything else [`FeatureId::Str`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<i64>()
            .map_or_else(|_| FeatureId::Str(s.to_string()), FeatureId::Int))
    }
}

/// Name-form CRS: `{"type": "name", "properties": {"name": <urn>}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crs {
    /// Always `"name"`
    #[serde(rename = "type")]
    pub kind: String,
    /// CRS name
    pub properties: CrsProperties,
}

/// Properties of a name-form CRS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrsProperties {
    /// CRS URN
    pub name: String,
}

impl Crs {
    /// CRS for an EPSG code.
    #[must_use]
    pub fn epsg(srid: i32) -> Self {
        Self {
            kind: "name".to_string(),
            properties: CrsProperties {
                name: crs_urn(srid),
            },
        }
    }

    /// SRID encoded in the name: the last `:`-separated segment, with `CRS84` as 4326.
    #[must_use]
    pub fn srid(&self) -> Option<i32> {
        let last = self.properties.name.rsplit(':').next()?;
        if last == "CRS84" {
            Some(4326)
        } else {
            last.parse().ok()
        }
    }
}

fn feature_type() -> String {
    "Feature".to_string()
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A GeoJSON-like feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Always `"Feature"`
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    /// Primary key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FeatureId>,
    /// Attribute values
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// `None`: key absent; `Some(None)`: NULL geometry
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub geometry: Option<Option<geojson::Geometry>>,
    /// CRS of the geometry
    #[serde(default)]
    pub crs: Option<Crs>,
    /// Extent of the geometry
    #[serde(default)]
    pub bbox: Option<Bbox>,
    /// Attributes to store as their column default
    #[serde(
        default,
        rename = "defaultedProperties",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub defaulted_properties: Vec<String>,
}

impl Default for Feature {
    fn default() -> Self {
        Self {
            kind: feature_type(),
            id: None,
            properties: Map::new(),
            geometry: None,
            crs: None,
            bbox: None,
            defaulted_properties: Vec::new(),
        }
    }
}

impl Feature {
    /// Creates an empty feature.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Sets the geometry and its CRS.
    #[must_use]
    pub fn with_geometry(mut self, geometry: geojson::Geometry, srid: i32) -> Self {
        self.geometry = Some(Some(geometry));
        self.crs = Some(Crs::epsg(srid));
        self
    }

    /// Converts a validated JSON payload into a feature.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if the payload does not fit the feature shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Client SRID of a write: taken from the CRS, else `default`.
    #[must_use]
    pub fn client_srid(&self, default: Option<i32>) -> Option<i32> {
        self.crs.as_ref().and_then(Crs::srid).or(default)
    }
}

/// A feature collection.
///
/// Rows outside a `limit`/`offset` window are kept as `None` and serialized as `{}`,
/// so positions in `features` match positions in the full result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    /// Always `"FeatureCollection"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Features in result order
    #[serde(serialize_with = "serialize_slots")]
    pub features: Vec<Option<Feature>>,
    /// CRS of all geometries, `None` without geometry
    pub crs: Option<Crs>,
    /// Overall extent, `None` without geometry or rows
    pub bbox: Option<Bbox>,
    /// Number of rows matching the query
    #[serde(rename = "numberMatched")]
    pub number_matched: usize,
    /// Number of features inside the requested window
    #[serde(rename = "numberReturned")]
    pub number_returned: usize,
}

fn serialize_slots<S: Serializer>(
    slots: &[Option<Feature>],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(slots.len()))?;
    for slot in slots {
        match slot {
            Some(feature) => seq.serialize_element(feature)?,
            None => seq.serialize_element(&Map::new())?,
        }
    }
    seq.end()
}

impl FeatureCollection {
    /// Iterates over the features inside the window.
    pub fn returned(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter().flatten()
    }
}
