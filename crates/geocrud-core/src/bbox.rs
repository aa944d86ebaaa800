//! Bounding boxes and CRS identifiers.

use std::fmt;
use std::sync::LazyLock;

use geo_types::{Rect, coord};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

static BOX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*BOX(?:3D)?\(\s*(\S+)\s+(\S+)(?:\s+\S+)?\s*,\s*(\S+)\s+(\S+)(?:\s+\S+)?\s*\)\s*$")
        .unwrap()
});

/// Axis-aligned bounding box, serialized as `[minx, miny, maxx, maxy]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox(Rect<f64>);

impl Bbox {
    /// Creates a box from its corners; swapped corners are normalized.
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self(Rect::new(coord! { x: minx, y: miny }, coord! { x: maxx, y: maxy }))
    }

    /// Parses `"<minx>,<miny>,<maxx>,<maxy>"`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidBbox`] unless the input is four numbers with
    /// `minx <= maxx` and `miny <= maxy`.
    ///
    /// # Examples
    ///
    /// ```
    /// use geocrud_core::bbox::Bbox;
    ///
    /// let bbox = Bbox::parse("2606000,1228000,2607000,1229000").unwrap();
    /// assert_eq!(bbox.to_array(), [2606000.0, 1228000.0, 2607000.0, 1229000.0]);
    /// assert!(Bbox::parse("2607000,1228000,2606000,1229000").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidBbox {
            input: input.to_string(),
        };
        let coords = input
            .split(',')
            .map(|c| c.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        match coords.as_slice() {
            [minx, miny, maxx, maxy]
                if coords.iter().all(|c| c.is_finite()) && minx <= maxx && miny <= maxy =>
            {
                Ok(Self::new(*minx, *miny, *maxx, *maxy))
            },
            _ => Err(invalid()),
        }
    }

    /// Parses database box output such as `BOX(2606000 1228000,2607000 1229000)`.
    ///
    /// `BOX3D` output is accepted; Z values are ignored.
    #[must_use]
    pub fn from_box2d(text: &str) -> Option<Self> {
        let caps = BOX_PATTERN.captures(text)?;
        let mut values = [0.0; 4];
        for (i, value) in values.iter_mut().enumerate() {
            *value = caps.get(i + 1)?.as_str().parse().ok()?;
        }
        Some(Self::new(values[0], values[1], values[2], values[3]))
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn union(&self, other: &Bbox) -> Bbox {
        Bbox::new(
            self.min_x().min(other.min_x()),
            self.min_y().min(other.min_y()),
            self.max_x().max(other.max_x()),
            self.max_y().max(other.max_y()),
        )
    }

    /// Minimum x.
    #[must_use]
    pub fn min_x(&self) -> f64 {
        self.0.min().x
    }

    /// Minimum y.
    #[must_use]
    pub fn min_y(&self) -> f64 {
        self.0.min().y
    }

    /// Maximum x.
    #[must_use]
    pub fn max_x(&self) -> f64 {
        self.0.max().x
    }

    /// Maximum y.
    #[must_use]
    pub fn max_y(&self) -> f64 {
        self.0.max().y
    }

    /// Returns `[minx, miny, maxx, maxy]`.
    #[must_use]
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x(), self.min_y(), self.max_x(), self.max_y()]
    }

    /// The underlying rectangle.
    #[must_use]
    pub fn rect(&self) -> Rect<f64> {
        self.0
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x(),
            self.min_y(),
            self.max_x(),
            self.max_y()
        )
    }
}

impl Serialize for Bbox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bbox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [minx, miny, maxx, maxy] = <[f64; 4]>::deserialize(deserializer)?;
        Ok(Bbox::new(minx, miny, maxx, maxy))
    }
}

/// Parses a CRS identifier and returns its SRID.
///
/// Accepts `EPSG:<srid>`, `urn:ogc:def:crs:EPSG::<srid>` and the CRS84 URN, which
/// maps to 4326.
///
/// # Errors
///
/// Returns [`ParseError::InvalidCrs`] for anything else.
///
/// # Examples
///
/// ```
/// use geocrud_core::bbox::parse_crs;
///
/// assert_eq!(parse_crs("EPSG:2056").unwrap(), 2056);
/// assert_eq!(parse_crs("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap(), 4326);
/// assert!(parse_crs("2056").is_err());
/// ```
pub fn parse_crs(input: &str) -> Result<i32, ParseError> {
    let invalid = || ParseError::InvalidCrs {
        input: input.to_string(),
    };
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("urn:ogc:def:crs:OGC:1.3:CRS84")
        || trimmed.eq_ignore_ascii_case("CRS84")
    {
        return Ok(4326);
    }
    let code = trimmed
        .strip_prefix("EPSG:")
        .or_else(|| trimmed.strip_prefix("urn:ogc:def:crs:EPSG::"))
        .ok_or_else(invalid)?;
    match code.parse::<i32>() {
        Ok(srid) if srid > 0 => Ok(srid),
        _ => Err(invalid()),
    }
}

/// Returns the OGC URN for `srid`.
#[must_use]
pub fn crs_urn(srid: i32) -> String {
    format!("urn:ogc:def:crs:EPSG::{srid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "1,2,3", "1,2,3,4,5", "a,2,3,4", "1,5,3,4", "1,2,nan,4"] {
            assert!(Bbox::parse(input).is_err(), "{input}");
        }
        assert!(Bbox::parse("1, 2, 1, 2").is_ok());
    }

    #[test]
    fn test_from_box2d() {
        let bbox = Bbox::from_box2d("BOX(2606925 1228625,2607000.5 1228700)").unwrap();
        assert_eq!(bbox.to_array(), [2_606_925.0, 1_228_625.0, 2_607_000.5, 1_228_700.0]);
        let bbox = Bbox::from_box2d("BOX3D(-1.5 -2 0,3 4 10)").unwrap();
        assert_eq!(bbox.to_array(), [-1.5, -2.0, 3.0, 4.0]);
        assert!(Bbox::from_box2d("POLYGON((0 0,1 1))").is_none());
    }

    #[test]
    fn test_union_and_serde() {
        let a = Bbox::new(0.0, 0.0, 1.0, 1.0);
        let b = Bbox::new(-1.0, 0.5, 0.5, 3.0);
        let u = a.union(&b);
        assert_eq!(u.to_array(), [-1.0, 0.0, 1.0, 3.0]);
        assert_eq!(serde_json::to_string(&u).unwrap(), "[-1.0,0.0,1.0,3.0]");
        let back: Bbox = serde_json::from_str("[-1,0,1,3]").unwrap();
        assert_eq!(back, u);
    }

    #[test]
    fn test_parse_crs() {
        assert_eq!(parse_crs("urn:ogc:def:crs:EPSG::21781").unwrap(), 21781);
        assert!(parse_crs("EPSG:abc").is_err());
        assert!(parse_crs("EPSG:-1").is_err());
        assert_eq!(crs_urn(2056), "urn:ogc:def:crs:EPSG::2056");
    }
}
