//! Pixel space to geographic projection of detections.

use crate::{
    coords::{GeoBounds, GeoPoint},
    detection::{PixelPoint, RawDetection},
    polygon::{LocalProjection, open_ring, planar_area},
};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

/// How pixel rows map to latitude inside a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatitudeInterpolation {
    /// Linear between the block's north and south edges.
    #[default]
    Linear,
    /// Linear in Web Mercator y, exact for tile imagery.
    Mercator,
}

fn lat_to_merc(lat: f64) -> f64 {
    (lat.to_radians() / 2.0 + std::f64::consts::FRAC_PI_4).tan().ln()
}

fn merc_to_lat(merc: f64) -> f64 {
    (2.0 * merc.exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees()
}

/// Detection projected onto the ground.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoDetection {
    pub block_index: usize,
    pub geo_polygon: Vec<GeoPoint>,
    pub confidence: f64,
    pub vehicle_count: u32,
    pub is_occupied: bool,
    pub area_sq_meters: f64,
    pub estimated_capacity: u32,
    /// (short side, long side)
    pub dimensions_meters: (f64, f64),
}

/// `max(1, round(area / footprint))`.
pub fn estimate_capacity(area_sq_meters: f64, footprint_sq_meters: f64) -> u32 {
    if !(footprint_sq_meters > 0.0) || !area_sq_meters.is_finite() {
        return 1;
    }

    (area_sq_meters / footprint_sq_meters).round().max(1.0) as u32
}

/// Side lengths of an oriented box, or local bounding box extents for other
/// shapes. Sorted ascending.
pub fn dimensions_meters(ring: &[(f64, f64)]) -> (f64, f64) {
    let (a, b) = if let [p0, p1, p2, _] = ring {
        (
            (p1.0 - p0.0).hypot(p1.1 - p0.1),
            (p2.0 - p1.0).hypot(p2.1 - p1.1),
        )
    } else {
        let (min_x, max_x, min_y, max_y) = ring.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(min_x, max_x, min_y, max_y), p| {
                (min_x.min(p.0), max_x.max(p.0), min_y.min(p.1), max_y.max(p.1))
            },
        );

        if ring.is_empty() {
            (0.0, 0.0)
        } else {
            (max_x - min_x, max_y - min_y)
        }
    };

    (a.min(b), a.max(b))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Georeferencer {
    pub footprint_sq_meters: f64,
    pub latitude: LatitudeInterpolation,
}

impl Default for Georeferencer {
    fn default() -> Self {
        Self {
            footprint_sq_meters: 11.25,
            latitude: LatitudeInterpolation::Linear,
        }
    }
}

impl Georeferencer {
    /// Maps a pixel of a `width × height` block to ground coordinates.
    /// Pixels are clamped to the block edges first.
    pub fn pixel_to_geo(&self, pixel: PixelPoint, bounds: &GeoBounds, width: u32, height: u32) -> GeoPoint {
        let w = width.max(1) as f64;
        let h = height.max(1) as f64;

        let x = if pixel.x.is_nan() { 0.0 } else { pixel.x.clamp(0.0, w) };
        let y = if pixel.y.is_nan() { 0.0 } else { pixel.y.clamp(0.0, h) };

        let lng = bounds.min_lng + x / w * (bounds.max_lng - bounds.min_lng);

        let lat = match self.latitude {
            LatitudeInterpolation::Linear => bounds.max_lat - y / h * (bounds.max_lat - bounds.min_lat),
            LatitudeInterpolation::Mercator => {
                let merc_max = lat_to_merc(bounds.max_lat);
                let merc_min = lat_to_merc(bounds.min_lat);

                merc_to_lat(merc_max - y / h * (merc_max - merc_min))
            }
        };

        GeoPoint { lat, lng }
    }

    pub fn georeference(&self, detection: &RawDetection, bounds: &GeoBounds, width: u32, height: u32) -> GeoDetection {
        let geo_polygon: Vec<GeoPoint> = open_ring(&detection.pixel_polygon)
            .iter()
            .map(|pixel| self.pixel_to_geo(*pixel, bounds, width, height))
            .collect();

        let projected = LocalProjection::around(&geo_polygon).project_ring(&geo_polygon);

        let area_sq_meters = planar_area(&projected);

        GeoDetection {
            block_index: detection.block_index,
            confidence: detection.confidence,
            vehicle_count: detection.vehicle_count,
            is_occupied: detection.is_occupied,
            area_sq_meters,
            estimated_capacity: estimate_capacity(area_sq_meters, self.footprint_sq_meters),
            dimensions_meters: dimensions_meters(&projected),
            geo_polygon,
        }
    }

    /// Projects all detections of one block.
    pub fn georeference_block(
        &self,
        bounds: &GeoBounds,
        width: u32,
        height: u32,
        detections: Vec<RawDetection>,
    ) -> Vec<GeoDetection> {
        detections
            .into_par_iter()
            .map(|detection| self.georeference(&detection, bounds, width, height))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bounds() -> GeoBounds {
        GeoBounds::new(52.0, 52.01, 5.0, 5.01).unwrap()
    }

    #[test]
    fn capacity_from_area() {
        assert_eq!(estimate_capacity(33.75, 11.25), 3);
        assert_eq!(estimate_capacity(2.0, 11.25), 1);
        assert_eq!(estimate_capacity(0.0, 11.25), 1);
        assert_eq!(estimate_capacity(17.0, 11.25), 2);
    }

    #[test]
    fn corners_map_to_bounds() {
        let georef = Georeferencer::default();

        let nw = georef.pixel_to_geo(PixelPoint { x: 0.0, y: 0.0 }, &bounds(), 100, 100);

        assert_relative_eq!(nw.lat, 52.01);
        assert_relative_eq!(nw.lng, 5.0);

        let center = georef.pixel_to_geo(PixelPoint { x: 50.0, y: 50.0 }, &bounds(), 100, 100);

        assert_relative_eq!(center.lat, 52.005, epsilon = 1e-12);
        assert_relative_eq!(center.lng, 5.005, epsilon = 1e-12);
    }

    #[test]
    fn pixels_are_clamped() {
        let georef = Georeferencer::default();

        let outside = georef.pixel_to_geo(PixelPoint { x: 500.0, y: -20.0 }, &bounds(), 100, 100);

        let edge = georef.pixel_to_geo(PixelPoint { x: 100.0, y: 0.0 }, &bounds(), 100, 100);

        assert_eq!(outside, edge);
        assert_relative_eq!(edge.lng, 5.01);
        assert_relative_eq!(edge.lat, 52.01);
    }

    #[test]
    fn sub_pixel_vertices_near_the_edge_are_kept() {
        let georef = Georeferencer::default();

        let near_edge = georef.pixel_to_geo(PixelPoint { x: 99.6, y: 99.6 }, &bounds(), 100, 100);

        assert_relative_eq!(near_edge.lng, 5.0 + 0.996 * 0.01, epsilon = 1e-12);
        assert_relative_eq!(near_edge.lat, 52.01 - 0.996 * 0.01, epsilon = 1e-12);
    }

    #[test]
    fn mercator_matches_edges_and_stays_close_inside() {
        let mercator = Georeferencer {
            latitude: LatitudeInterpolation::Mercator,
            ..Default::default()
        };

        let top = mercator.pixel_to_geo(PixelPoint { x: 0.0, y: 0.0 }, &bounds(), 100, 100);

        assert_relative_eq!(top.lat, 52.01, epsilon = 1e-9);

        let linear = Georeferencer::default().pixel_to_geo(PixelPoint { x: 0.0, y: 50.0 }, &bounds(), 100, 100);

        let merc = mercator.pixel_to_geo(PixelPoint { x: 0.0, y: 50.0 }, &bounds(), 100, 100);

        assert!((linear.lat - merc.lat).abs() < 1e-5);
    }

    #[test]
    fn box_area_and_dimensions() {
        // 1000 px over 0.01° lng at 52° is about 685 m, so 1 px ≈ 0.685 m
        let georef = Georeferencer::default();

        let detection = RawDetection {
            block_index: 0,
            pixel_polygon: vec![
                PixelPoint { x: 100.0, y: 100.0 },
                PixelPoint { x: 110.0, y: 100.0 },
                PixelPoint { x: 110.0, y: 120.0 },
                PixelPoint { x: 100.0, y: 120.0 },
                PixelPoint { x: 100.0, y: 100.0 },
            ],
            confidence: 0.8,
            vehicle_count: 1,
            is_occupied: true,
        };

        let geo = georef.georeference(&detection, &bounds(), 1000, 1000);

        assert_eq!(geo.geo_polygon.len(), 4);

        let (short, long) = geo.dimensions_meters;

        let width_m = 10.0 * bounds().width_meters() / 1000.0;
        let height_m = 20.0 * bounds().height_meters() / 1000.0;

        assert_relative_eq!(short, width_m, max_relative = 1e-3);
        assert_relative_eq!(long, height_m, max_relative = 1e-3);
        assert_relative_eq!(geo.area_sq_meters, width_m * height_m, max_relative = 1e-3);
        assert_eq!(
            geo.estimated_capacity,
            estimate_capacity(geo.area_sq_meters, 11.25)
        );
    }

    #[test]
    fn dimensions_of_rotated_box() {
        let s = std::f64::consts::FRAC_1_SQRT_2;

        let ring = [(0.0, 0.0), (3.0 * s, 3.0 * s), (3.0 * s - 5.0 * s, 3.0 * s + 5.0 * s), (-5.0 * s, 5.0 * s)];

        let (short, long) = dimensions_meters(&ring);

        assert_relative_eq!(short, 3.0, epsilon = 1e-9);
        assert_relative_eq!(long, 5.0, epsilon = 1e-9);
    }
}
