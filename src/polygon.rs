//! Planar geometry over a local equirectangular projection.

use crate::{
    coords::{EARTH_RADIUS_M, GeoPoint},
    error::ReconciliationError,
};
use geo::{Area, BooleanOps, Centroid, LineString, Polygon};

/// Equirectangular projection to meters around `origin`. Accurate to well
/// under 1% over the extent of an analysis block.
#[derive(Clone, Copy, Debug)]
pub struct LocalProjection {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.lat.to_radians().cos(),
        }
    }

    /// Projection centered on the vertex mean of `points`.
    pub fn around(points: &[GeoPoint]) -> Self {
        Self::new(vertex_mean(points))
    }

    pub fn project(&self, point: &GeoPoint) -> (f64, f64) {
        (
            EARTH_RADIUS_M * (point.lng - self.origin.lng).to_radians() * self.cos_lat,
            EARTH_RADIUS_M * (point.lat - self.origin.lat).to_radians(),
        )
    }

    pub fn unproject(&self, (x, y): (f64, f64)) -> GeoPoint {
        GeoPoint {
            lat: self.origin.lat + (y / EARTH_RADIUS_M).to_degrees(),
            lng: self.origin.lng + (x / (EARTH_RADIUS_M * self.cos_lat)).to_degrees(),
        }
    }

    pub fn project_ring(&self, ring: &[GeoPoint]) -> Vec<(f64, f64)> {
        ring.iter().map(|point| self.project(point)).collect()
    }
}

pub fn vertex_mean(points: &[GeoPoint]) -> GeoPoint {
    if points.is_empty() {
        return GeoPoint { lat: 0.0, lng: 0.0 };
    }

    let n = points.len() as f64;

    GeoPoint {
        lat: points.iter().map(|p| p.lat).sum::<f64>() / n,
        lng: points.iter().map(|p| p.lng).sum::<f64>() / n,
    }
}

/// Drops a trailing vertex equal to the first one.
pub fn open_ring<T: PartialEq + Copy>(ring: &[T]) -> &[T] {
    match ring {
        [first, .., last] if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// Repeats the first vertex at the end unless already closed.
pub fn close_ring<T: PartialEq + Copy>(ring: &[T]) -> Vec<T> {
    let mut closed = ring.to_vec();

    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if ring.len() == 1 || first != last {
            closed.push(*first);
        }
    }

    closed
}

/// Area of an open ring in the projected plane.
pub fn planar_area(ring: &[(f64, f64)]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }

    to_polygon(ring).unsigned_area()
}

/// Area-weighted centroid of an open ring; geo falls back to the outline's
/// centroid when the area is zero.
pub fn planar_centroid(ring: &[(f64, f64)]) -> (f64, f64) {
    match to_polygon(ring).centroid() {
        Some(centroid) => centroid.x_y(),
        None => (0.0, 0.0),
    }
}

/// Geographic centroid, computed in a local metric plane.
pub fn geo_centroid(ring: &[GeoPoint]) -> GeoPoint {
    let ring = open_ring(ring);

    let projection = LocalProjection::around(ring);

    projection.unproject(planar_centroid(&projection.project_ring(ring)))
}

/// Checks that an open ring is a usable simple polygon.
pub fn validate_ring(ring: &[GeoPoint]) -> Result<(), ReconciliationError> {
    let ring = open_ring(ring);

    if ring.iter().any(|p| !p.lat.is_finite() || !p.lng.is_finite()) {
        return Err(ReconciliationError::NonFinite);
    }

    let mut distinct: Vec<GeoPoint> = Vec::with_capacity(ring.len());

    for point in ring {
        if distinct.last() != Some(point) {
            distinct.push(*point);
        }
    }

    let distinct = open_ring(&distinct);

    let unique = {
        let mut keys: Vec<(u64, u64)> = distinct
            .iter()
            .map(|p| (p.lat.to_bits(), p.lng.to_bits()))
            .collect();

        keys.sort_unstable();
        keys.dedup();
        keys.len()
    };

    if unique < 3 {
        return Err(ReconciliationError::TooFewVertices(unique));
    }

    let projected = LocalProjection::around(distinct).project_ring(distinct);

    if is_self_intersecting(&projected) {
        return Err(ReconciliationError::SelfIntersecting);
    }

    Ok(())
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn segments_cross(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// True when two non-adjacent edges of the open ring properly cross.
pub fn is_self_intersecting(ring: &[(f64, f64)]) -> bool {
    let n = ring.len();

    if n < 4 {
        return false;
    }

    (0..n).any(|i| {
        let a = (ring[i], ring[(i + 1) % n]);

        (i + 2..n)
            .filter(|&j| (j + 1) % n != i)
            .any(|j| segments_cross(a.0, a.1, ring[j], ring[(j + 1) % n]))
    })
}

fn to_polygon(ring: &[(f64, f64)]) -> Polygon<f64> {
    Polygon::new(LineString::from(close_ring(ring)), vec![])
}

/// Intersection over union of two geographic polygons. Zero-area inputs give 0.
pub fn iou(a: &[GeoPoint], b: &[GeoPoint]) -> f64 {
    let a = open_ring(a);
    let b = open_ring(b);

    let projection = LocalProjection::new(vertex_mean(&[vertex_mean(a), vertex_mean(b)]));

    let a = projection.project_ring(a);
    let b = projection.project_ring(b);

    let area_a = planar_area(&a);
    let area_b = planar_area(&b);

    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let intersection = to_polygon(&a).intersection(&to_polygon(&b)).unsigned_area();

    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    (intersection / union).clamp(0.0, 1.0)
}
