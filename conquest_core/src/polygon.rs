//! Geographic polygon and bounding-box value types.

use crate::error::ConquestError;
use conquest_env::Coordinate;
use serde::{Deserialize, Serialize};

/// A closed polygon over WGS84 coordinates.
///
/// The exterior ring is stored without repeating its first vertex (closure
/// is implied). Interior rings appear only as the result of clipping a
/// candidate against a territory lying strictly inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolygon")]
pub struct Polygon {
    exterior: Vec<Coordinate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    holes: Vec<Vec<Coordinate>>,
}

/// Wire form; rings are normalized and checked on the way in.
#[derive(Deserialize)]
struct RawPolygon {
    exterior: Vec<Coordinate>,

    #[serde(default)]
    holes: Vec<Vec<Coordinate>>,
}

impl TryFrom<RawPolygon> for Polygon {
    type Error = ConquestError;

    fn try_from(raw: RawPolygon) -> Result<Self, Self::Error> {
        Polygon::with_holes(raw.exterior, raw.holes)
    }
}

impl Polygon {
    /// Builds a polygon from an exterior ring.
    ///
    /// A trailing vertex equal to the first one is dropped and consecutive
    /// duplicates are collapsed. Fewer than three distinct vertices is a
    /// `DegenerateGeometry` error. Simplicity is NOT checked here; see
    /// `geo_math::validate_polygon`.
    pub fn new(vertices: Vec<Coordinate>) -> Result<Self, ConquestError> {
        Ok(Self {
            exterior: normalize_ring(vertices)?,
            holes: Vec::new(),
        })
    }

    /// Builds a polygon with interior rings.
    pub fn with_holes(
        exterior: Vec<Coordinate>,
        holes: Vec<Vec<Coordinate>>,
    ) -> Result<Self, ConquestError> {
        let exterior = normalize_ring(exterior)?;
        let holes = holes
            .into_iter()
            .map(normalize_ring)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { exterior, holes })
    }

    pub fn exterior(&self) -> &[Coordinate] {
        &self.exterior
    }

    pub fn holes(&self) -> &[Vec<Coordinate>] {
        &self.holes
    }

    /// Exterior ring followed by every hole.
    pub fn rings(&self) -> impl Iterator<Item = &[Coordinate]> {
        std::iter::once(self.exterior.as_slice()).chain(self.holes.iter().map(Vec::as_slice))
    }

    pub fn vertex_count(&self) -> usize {
        self.exterior.len()
    }

    /// Anchor vertex used as the projection origin for planar math.
    pub fn anchor(&self) -> Coordinate {
        self.exterior[0]
    }

    /// Axis-aligned lat/lon bounds of the exterior ring.
    pub fn bounds(&self) -> BoundingBox {
        // exterior is never empty after construction
        BoundingBox::from_coordinates(&self.exterior).unwrap_or(BoundingBox {
            min_latitude: self.exterior[0].latitude(),
            min_longitude: self.exterior[0].longitude(),
            max_latitude: self.exterior[0].latitude(),
            max_longitude: self.exterior[0].longitude(),
        })
    }
}

fn normalize_ring(mut vertices: Vec<Coordinate>) -> Result<Vec<Coordinate>, ConquestError> {
    vertices.dedup();
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }

    let mut distinct: Vec<Coordinate> = Vec::with_capacity(vertices.len());
    for v in &vertices {
        if !distinct.contains(v) {
            distinct.push(*v);
        }
    }
    if distinct.len() < 3 {
        return Err(ConquestError::degenerate(format!(
            "ring has {} distinct vertices, need at least 3",
            distinct.len()
        )));
    }
    Ok(vertices)
}

/// Axis-aligned bounding region in degrees.
///
/// Regions crossing the antimeridian are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Smallest box containing all coordinates, or None for an empty slice.
    pub fn from_coordinates(coords: &[Coordinate]) -> Option<Self> {
        let first = coords.first()?;
        let init = Self {
            min_latitude: first.latitude(),
            min_longitude: first.longitude(),
            max_latitude: first.latitude(),
            max_longitude: first.longitude(),
        };
        Some(coords.iter().skip(1).fold(init, |b, c| Self {
            min_latitude: b.min_latitude.min(c.latitude()),
            min_longitude: b.min_longitude.min(c.longitude()),
            max_latitude: b.max_latitude.max(c.latitude()),
            max_longitude: b.max_longitude.max(c.longitude()),
        }))
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_latitude <= other.max_latitude
            && other.min_latitude <= self.max_latitude
            && self.min_longitude <= other.max_longitude
            && other.min_longitude <= self.max_longitude
    }

    pub fn contains(&self, c: &Coordinate) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&c.latitude())
            && (self.min_longitude..=self.max_longitude).contains(&c.longitude())
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_latitude + self.max_latitude) / 2.0,
            (self.min_longitude + self.max_longitude) / 2.0,
        )
    }

    /// Grows the box by `meters` on every side (clamped to valid ranges).
    pub fn expanded_by_meters(&self, meters: f64) -> Self {
        let dlat = meters / crate::geo_math::METERS_PER_DEGREE;
        let mid_lat = ((self.min_latitude + self.max_latitude) / 2.0).to_radians();
        let dlon = meters / (crate::geo_math::METERS_PER_DEGREE * mid_lat.cos().max(1e-6));
        Self {
            min_latitude: (self.min_latitude - dlat).max(-90.0),
            min_longitude: (self.min_longitude - dlon).max(-180.0),
            max_latitude: (self.max_latitude + dlat).min(90.0),
            max_longitude: (self.max_longitude + dlon).min(180.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn test_polygon_drops_closing_vertex() {
        let p = Polygon::new(vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 1.0), c(0.0, 0.0)]).unwrap();
        assert_eq!(p.vertex_count(), 3);
    }

    #[test]
    fn test_polygon_rejects_too_few_distinct_vertices() {
        let err = Polygon::new(vec![c(0.0, 0.0), c(0.0, 1.0), c(0.0, 0.0), c(0.0, 1.0)]);
        assert!(matches!(err, Err(ConquestError::DegenerateGeometry(_))));
        assert!(Polygon::new(vec![c(0.0, 0.0), c(0.0, 1.0)]).is_err());
    }

    #[test]
    fn test_deserialize_validates_rings() {
        assert!(serde_json::from_str::<Polygon>(r#"{"exterior": []}"#).is_err());
        let two = r#"{"exterior": [{"latitude": 0.0, "longitude": 0.0}, {"latitude": 0.0, "longitude": 1.0}]}"#;
        assert!(serde_json::from_str::<Polygon>(two).is_err());

        let p = Polygon::new(vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 1.0)]).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<Polygon>(&json).unwrap(), p);
    }

    #[test]
    fn test_bounding_box_intersection() {
        let a = BoundingBox::from_coordinates(&[c(0.0, 0.0), c(1.0, 1.0)]).unwrap();
        let b = BoundingBox::from_coordinates(&[c(0.5, 0.5), c(2.0, 2.0)]).unwrap();
        let far = BoundingBox::from_coordinates(&[c(5.0, 5.0), c(6.0, 6.0)]).unwrap();

        assert!(a.intersects(&b));
        assert!(!a.intersects(&far));
        assert!(a.contains(&c(0.5, 0.5)));
        assert!(a.expanded_by_meters(1000.0).contains(&c(-0.005, 0.0)));
    }
}
