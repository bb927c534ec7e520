//! Parcel and zone geometry.
//!
//! Coordinates are planar metres (Swiss LV95, EPSG:2056), so areas and
//! distances come straight out of Euclidean geometry.

use geo::{Area, BoundingRect, EuclideanDistance, Geometry, Intersects, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("unsupported geometry type {0}: expected Polygon or MultiPolygon")]
    Unsupported(&'static str),

    #[error("empty geometry")]
    Empty,
}

/// A parcel footprint: always a (possibly single-member) multipolygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelGeometry(MultiPolygon<f64>);

impl ParcelGeometry {
    /// Planar area in m².
    pub fn area_m2(&self) -> f64 {
        self.0.unsigned_area()
    }

    pub fn bbox(&self) -> Option<BBox> {
        BBox::of(&self.0)
    }

    /// True when any member polygon touches or overlaps any polygon of `other`.
    pub fn intersects(&self, other: &MultiPolygon<f64>) -> bool {
        self.0
            .iter()
            .any(|a| other.iter().any(|b| a.intersects(b)))
    }

    /// Minimum distance in metres to `other`; 0 when they intersect.
    pub fn distance_to(&self, other: &MultiPolygon<f64>) -> f64 {
        if self.intersects(other) {
            return 0.0;
        }
        self.0
            .iter()
            .flat_map(|a| other.iter().map(move |b| a.euclidean_distance(b)))
            .fold(f64::INFINITY, f64::min)
    }
}

impl From<Polygon<f64>> for ParcelGeometry {
    fn from(p: Polygon<f64>) -> Self {
        Self(MultiPolygon::new(vec![p]))
    }
}

impl From<MultiPolygon<f64>> for ParcelGeometry {
    fn from(mp: MultiPolygon<f64>) -> Self {
        Self(mp)
    }
}

impl TryFrom<Geometry<f64>> for ParcelGeometry {
    type Error = GeometryError;

    fn try_from(g: Geometry<f64>) -> Result<Self, Self::Error> {
        let geom = match g {
            Geometry::Polygon(p) => Self::from(p),
            Geometry::MultiPolygon(mp) => Self::from(mp),
            other => return Err(GeometryError::Unsupported(kind(&other))),
        };
        if geom.0.0.is_empty() {
            return Err(GeometryError::Empty);
        }
        Ok(geom)
    }
}

fn kind(g: &Geometry<f64>) -> &'static str {
    match g {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Axis-aligned bounding box, persisted next to geometries for cheap
/// prefiltering before the exact predicate runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BBox {
    pub fn of(mp: &MultiPolygon<f64>) -> Option<Self> {
        mp.bounding_rect().map(|r| Self {
            xmin: r.min().x,
            ymin: r.min().y,
            xmax: r.max().x,
            ymax: r.max().y,
        })
    }

    /// Grow by `margin` metres on every side.
    pub fn expand(self, margin: f64) -> Self {
        Self {
            xmin: self.xmin - margin,
            ymin: self.ymin - margin,
            xmax: self.xmax + margin,
            ymax: self.ymax + margin,
        }
    }

    pub fn overlaps(&self, other: &BBox) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }
}

/// A cadastral zoning polygon with its normalised regulation code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub code_norm: String,
    pub geometry: MultiPolygon<f64>,
    pub commune_id: String,
}
