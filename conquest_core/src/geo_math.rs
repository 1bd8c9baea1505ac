//! GeoMath - pure geometric primitives for the conquest engine.
//!
//! All planar work happens on a local tangent plane: an equirectangular
//! projection anchored at one vertex of the polygon under test. At the
//! scale of a walked loop (meters to a few kilometers) the distortion is
//! far below GPS noise.
//!
//! - Distances use the haversine formula on the mean earth radius
//! - Areas use the shoelace formula on projected rings
//! - Overlap and difference use `geo`'s boolean operations in the plane

use crate::error::ConquestError;
use crate::polygon::Polygon;
use conquest_env::Coordinate;
use geo::{Area, BooleanOps, HaversineDistance, Intersects, LineString, MultiPolygon, Point};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Mean earth radius (meters), matching `geo`'s haversine radius.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters spanned by one degree of latitude.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Areas at or below this value (m²) are treated as empty.
pub const AREA_TOLERANCE_M2: f64 = 0.01;

/// Vertices closer than this (m) are the same vertex.
const LENGTH_TOLERANCE_M: f64 = 1e-6;

/// Tolerance on the 2D cross product (m²).
const ORIENTATION_TOLERANCE: f64 = 1e-9;

/// Keeps the longitude scale finite near the poles.
const MIN_COS_LATITUDE: f64 = 1e-6;

// ============================================================================
// DISTANCES
// ============================================================================

/// Great-circle distance between two coordinates (meters).
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let pa = Point::new(a.longitude(), a.latitude());
    let pb = Point::new(b.longitude(), b.latitude());
    pa.haversine_distance(&pb)
}

/// Coordinate displaced from `origin` by the given east/north offsets.
pub fn offset_meters(origin: &Coordinate, east_m: f64, north_m: f64) -> Result<Coordinate, ConquestError> {
    LocalFrame::new(*origin).unproject(&Vector2::new(east_m, north_m))
}

// ============================================================================
// LOCAL TANGENT PLANE
// ============================================================================

/// Equirectangular projection around a fixed origin.
///
/// x grows east, y grows north, both in meters.
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    origin: Coordinate,
    meters_per_degree_lon: f64,
}

impl LocalFrame {
    pub fn new(origin: Coordinate) -> Self {
        let cos_lat = origin.latitude().to_radians().cos().max(MIN_COS_LATITUDE);
        Self {
            origin,
            meters_per_degree_lon: METERS_PER_DEGREE * cos_lat,
        }
    }

    pub fn origin(&self) -> Coordinate {
        self.origin
    }

    pub fn project(&self, c: &Coordinate) -> Vector2<f64> {
        Vector2::new(
            (c.longitude() - self.origin.longitude()) * self.meters_per_degree_lon,
            (c.latitude() - self.origin.latitude()) * METERS_PER_DEGREE,
        )
    }

    pub fn unproject(&self, v: &Vector2<f64>) -> Result<Coordinate, ConquestError> {
        Coordinate::new(
            self.origin.latitude() + v.y / METERS_PER_DEGREE,
            self.origin.longitude() + v.x / self.meters_per_degree_lon,
        )
        .map_err(ConquestError::from)
    }

    fn project_ring(&self, ring: &[Coordinate]) -> Vec<Vector2<f64>> {
        ring.iter().map(|c| self.project(c)).collect()
    }

    /// Projects a polygon (with holes) into a planar `geo` polygon.
    pub fn to_planar(&self, polygon: &Polygon) -> geo::Polygon<f64> {
        let to_line = |ring: &[Coordinate]| -> LineString<f64> {
            LineString::from(
                ring.iter()
                    .map(|c| {
                        let v = self.project(c);
                        (v.x, v.y)
                    })
                    .collect::<Vec<_>>(),
            )
        };
        geo::Polygon::new(
            to_line(polygon.exterior()),
            polygon.holes().iter().map(|h| to_line(h.as_slice())).collect(),
        )
    }

    /// Maps a planar `geo` polygon back to coordinates.
    pub fn from_planar(&self, planar: &geo::Polygon<f64>) -> Result<Polygon, ConquestError> {
        let to_ring = |line: &LineString<f64>| -> Result<Vec<Coordinate>, ConquestError> {
            line.coords()
                .map(|c| self.unproject(&Vector2::new(c.x, c.y)))
                .collect()
        };
        let exterior = to_ring(planar.exterior())?;
        let holes = planar
            .interiors()
            .iter()
            .map(to_ring)
            .collect::<Result<Vec<_>, _>>()?;
        Polygon::with_holes(exterior, holes)
    }
}

// ============================================================================
// LOOP CLOSURE
// ============================================================================

/// Parameters for deciding that a path has closed into a loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosure {
    /// The last point must come within this distance of an earlier point
    pub radius_m: f64,

    /// Walked length between the two points; rejects back-and-forth jitter
    pub min_perimeter_m: f64,

    /// Vertices the loop must keep once the closing point is dropped
    pub min_vertices: usize,
}

impl Default for LoopClosure {
    fn default() -> Self {
        Self {
            radius_m: 20.0,
            min_perimeter_m: 60.0,
            min_vertices: 3,
        }
    }
}

/// Index of the earliest point the path's last point closes onto.
///
/// The loop is `path[index..len - 1]`: the final point is the closure
/// and is not repeated as a vertex.
pub fn closed_loop_index(path: &[Coordinate], closure: &LoopClosure) -> Option<usize> {
    let min_vertices = closure.min_vertices.max(3);
    if path.len() < min_vertices + 1 {
        return None;
    }
    let last_idx = path.len() - 1;
    let last = &path[last_idx];

    // cumulative[k] = walked length from path[0] to path[k]
    let mut cumulative = Vec::with_capacity(path.len());
    let mut total = 0.0;
    cumulative.push(0.0);
    for w in path.windows(2) {
        total += distance_meters(&w[0], &w[1]);
        cumulative.push(total);
    }

    (0..=last_idx - min_vertices).find(|&i| {
        total - cumulative[i] >= closure.min_perimeter_m
            && distance_meters(&path[i], last) <= closure.radius_m
    })
}

/// True when the path's last point closes a loop.
pub fn is_closed_loop(path: &[Coordinate], closure: &LoopClosure) -> bool {
    closed_loop_index(path, closure).is_some()
}

// ============================================================================
// AREA & SIMPLICITY
// ============================================================================

/// Signed shoelace area of a planar ring (counter-clockwise positive).
fn shoelace(ring: &[Vector2<f64>]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| ring[i].perp(&ring[(i + 1) % n]))
        .sum::<f64>()
        / 2.0
}

/// Area of a polygon in square meters (holes subtracted). Never negative.
///
/// Degenerate input yields a meaningless value; callers that need a
/// claimable area use `claimable_area`.
pub fn polygon_area(polygon: &Polygon) -> f64 {
    LocalFrame::new(polygon.anchor()).to_planar(polygon).unsigned_area()
}

/// Area of a polygon that passed validation.
pub fn claimable_area(polygon: &Polygon) -> Result<f64, ConquestError> {
    validate_polygon(polygon)?;
    Ok(polygon_area(polygon))
}

#[inline]
fn orientation(a: &Vector2<f64>, b: &Vector2<f64>, c: &Vector2<f64>) -> f64 {
    (b - a).perp(&(c - a))
}

#[inline]
fn within_span(a: &Vector2<f64>, b: &Vector2<f64>, p: &Vector2<f64>) -> bool {
    p.x >= a.x.min(b.x) - LENGTH_TOLERANCE_M
        && p.x <= a.x.max(b.x) + LENGTH_TOLERANCE_M
        && p.y >= a.y.min(b.y) - LENGTH_TOLERANCE_M
        && p.y <= a.y.max(b.y) + LENGTH_TOLERANCE_M
}

/// Planar segment intersection test, including touching endpoints and
/// collinear overlap.
pub fn segments_intersect(
    p1: &Vector2<f64>,
    p2: &Vector2<f64>,
    q1: &Vector2<f64>,
    q2: &Vector2<f64>,
) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    let straddles = |x: f64, y: f64| {
        (x > ORIENTATION_TOLERANCE && y < -ORIENTATION_TOLERANCE)
            || (x < -ORIENTATION_TOLERANCE && y > ORIENTATION_TOLERANCE)
    };
    if straddles(d1, d2) && straddles(d3, d4) {
        return true;
    }

    (d1.abs() <= ORIENTATION_TOLERANCE && within_span(q1, q2, p1))
        || (d2.abs() <= ORIENTATION_TOLERANCE && within_span(q1, q2, p2))
        || (d3.abs() <= ORIENTATION_TOLERANCE && within_span(p1, p2, q1))
        || (d4.abs() <= ORIENTATION_TOLERANCE && within_span(p1, p2, q2))
}

/// Describes why a planar ring is not simple, if it isn't.
fn ring_defect(ring: &[Vector2<f64>]) -> Option<String> {
    let n = ring.len();
    if n < 3 {
        return Some(format!("{} vertices", n));
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if (ring[i] - ring[j]).norm() <= LENGTH_TOLERANCE_M {
                return Some(format!("vertices {} and {} coincide", i, j));
            }
        }
    }

    if shoelace(ring).abs() <= AREA_TOLERANCE_M2 {
        return Some("collinear or near-zero area".to_string());
    }

    // Spikes: the path doubles back along the previous edge
    for i in 0..n {
        let prev = &ring[(i + n - 1) % n];
        let here = &ring[i];
        let next = &ring[(i + 1) % n];
        let a = prev - here;
        let b = next - here;
        let scale = a.norm() * b.norm();
        if a.perp(&b).abs() <= ORIENTATION_TOLERANCE * scale.max(1.0) && a.dot(&b) > 0.0 {
            return Some(format!("spike at vertex {}", i));
        }
    }

    for i in 0..n {
        for j in (i + 2)..n {
            if i == 0 && j == n - 1 {
                continue; // adjacent through the closing edge
            }
            if segments_intersect(&ring[i], &ring[(i + 1) % n], &ring[j], &ring[(j + 1) % n]) {
                return Some(format!("edges {} and {} intersect", i, j));
            }
        }
    }

    None
}

fn rings_cross(a: &[Vector2<f64>], b: &[Vector2<f64>]) -> bool {
    let (na, nb) = (a.len(), b.len());
    (0..na).any(|i| {
        (0..nb).any(|j| segments_intersect(&a[i], &a[(i + 1) % na], &b[j], &b[(j + 1) % nb]))
    })
}

/// Checks that every ring is simple, rings do not touch each other and
/// the remaining area is not negligible.
pub fn validate_polygon(polygon: &Polygon) -> Result<(), ConquestError> {
    let frame = LocalFrame::new(polygon.anchor());
    let rings: Vec<Vec<Vector2<f64>>> = polygon.rings().map(|r| frame.project_ring(r)).collect();

    for (idx, ring) in rings.iter().enumerate() {
        if let Some(defect) = ring_defect(ring) {
            return Err(ConquestError::degenerate(format!("ring {}: {}", idx, defect)));
        }
    }

    for a in 0..rings.len() {
        for b in (a + 1)..rings.len() {
            if rings_cross(&rings[a], &rings[b]) {
                return Err(ConquestError::degenerate(format!("rings {} and {} touch", a, b)));
            }
        }
    }

    if frame.to_planar(polygon).unsigned_area() <= AREA_TOLERANCE_M2 {
        return Err(ConquestError::degenerate("holes cover the exterior"));
    }

    Ok(())
}

/// True when no pair of non-adjacent edges intersects and the polygon
/// has non-negligible area.
pub fn is_simple_polygon(polygon: &Polygon) -> bool {
    validate_polygon(polygon).is_ok()
}

// ============================================================================
// OVERLAP & CLIPPING
// ============================================================================

/// Largest part of a planar multipolygon, by area.
pub(crate) fn largest_part(parts: MultiPolygon<f64>) -> Option<geo::Polygon<f64>> {
    parts
        .into_iter()
        .filter(|p| p.unsigned_area() > AREA_TOLERANCE_M2)
        .max_by(|a, b| {
            a.unsigned_area()
                .partial_cmp(&b.unsigned_area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Point-in-polygon test. Points on an edge count as inside, points in a
/// hole do not.
pub fn contains_point(polygon: &Polygon, point: &Coordinate) -> bool {
    if !polygon.bounds().contains(point) {
        return false;
    }
    let frame = LocalFrame::new(polygon.anchor());
    let v = frame.project(point);
    frame.to_planar(polygon).intersects(&Point::new(v.x, v.y))
}

/// Area shared by two polygons (m²).
pub fn overlap_area(a: &Polygon, b: &Polygon) -> f64 {
    if !a.bounds().intersects(&b.bounds()) {
        return 0.0;
    }
    let frame = LocalFrame::new(a.anchor());
    frame
        .to_planar(a)
        .intersection(&frame.to_planar(b))
        .unsigned_area()
}

/// True when the polygons share more than a negligible area.
///
/// Neighbours that only touch along an edge do not intersect.
pub fn intersects(a: &Polygon, b: &Polygon) -> bool {
    overlap_area(a, b) > AREA_TOLERANCE_M2
}

/// `a` minus `b`.
///
/// Returns None when nothing is left or the remainder is not simple. When
/// the difference splits `a` into several pieces, the largest is kept.
pub fn clip(a: &Polygon, b: &Polygon) -> Option<Polygon> {
    let frame = LocalFrame::new(a.anchor());
    let remainder = largest_part(frame.to_planar(a).difference(&frame.to_planar(b)))?;
    let polygon = frame.from_planar(&remainder).ok()?;
    is_simple_polygon(&polygon).then_some(polygon)
}
