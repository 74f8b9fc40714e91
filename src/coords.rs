//! Web Mercator slippy-map tile math and great-circle distance.

use crate::error::CoordinateError;
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use std::{
    f64::consts::PI,
    fmt::{Display, Formatter},
    num::ParseFloatError,
    str::FromStr,
};

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Latitude at which the Web Mercator square ends.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

pub const MAX_ZOOM: u8 = 30;

/// WGS84 point in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        let point = Self { lat, lng };

        point.validate()?;

        Ok(point)
    }

    pub fn validate(&self) -> Result<(), CoordinateError> {
        let Self { lat, lng } = *self;

        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite { lat, lng });
        }

        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::OutOfRange { lat, lng });
        }

        Ok(())
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(point: GeoPoint) -> Self {
        Point::new(point.lng, point.lat)
    }
}

/// Integer slippy-map tile address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileIndex {
    /// Row in the TMS scheme (y axis pointing north), as stored in MBTiles.
    pub const fn reversed_y(&self) -> u32 {
        (1 << self.zoom) - 1 - self.y
    }

    pub fn bounds(&self) -> GeoBounds {
        tile_bounds(*self)
    }
}

impl Display for TileIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Fractional tile coordinate, for sub-tile precision.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TilePoint {
    pub x: f64,
    pub y: f64,
    pub zoom: u8,
}

impl TilePoint {
    pub fn to_geo(&self) -> GeoPoint {
        tile_to_geo(self.x, self.y, self.zoom)
    }
}

/// Axis-aligned geographic rectangle. No antimeridian wraparound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    pub fn new(
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
    ) -> Result<Self, CoordinateError> {
        GeoPoint::new(min_lat, min_lng)?;
        GeoPoint::new(max_lat, max_lng)?;

        if min_lat >= max_lat || min_lng >= max_lng {
            return Err(CoordinateError::InvalidBounds {
                min_lat,
                max_lat,
                min_lng,
                max_lng,
            });
        }

        Ok(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Bounding box of a set of points, e.g. a municipal boundary.
    pub fn from_points(points: &[GeoPoint]) -> Result<Self, CoordinateError> {
        for point in points {
            point.validate()?;
        }

        let (min_lat, max_lat, min_lng, max_lng) = points.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(min_lat, max_lat, min_lng, max_lng), p| {
                (
                    min_lat.min(p.lat),
                    max_lat.max(p.lat),
                    min_lng.min(p.lng),
                    max_lng.max(p.lng),
                )
            },
        );

        Self::new(min_lat, max_lat, min_lng, max_lng)
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lng: (self.min_lng + self.max_lng) / 2.0,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }

    pub fn north_west(&self) -> GeoPoint {
        GeoPoint {
            lat: self.max_lat,
            lng: self.min_lng,
        }
    }

    /// East-west extent measured along the center latitude.
    pub fn width_meters(&self) -> f64 {
        let lat = self.center().lat;

        distance_meters(
            &GeoPoint {
                lat,
                lng: self.min_lng,
            },
            &GeoPoint {
                lat,
                lng: self.max_lng,
            },
        )
    }

    pub fn height_meters(&self) -> f64 {
        let lng = self.center().lng;

        distance_meters(
            &GeoPoint {
                lat: self.min_lat,
                lng,
            },
            &GeoPoint {
                lat: self.max_lat,
                lng,
            },
        )
    }
}

/// `minLng,minLat,maxLng,maxLat`, the usual bbox order.
impl FromStr for GeoBounds {
    type Err = ParseBoundsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, ParseFloatError>>()
            .map_err(|_| ParseBoundsError(s.to_string()))?;

        let [min_lng, min_lat, max_lng, max_lat] = parts[..] else {
            return Err(ParseBoundsError(s.to_string()));
        };

        Self::new(min_lat, max_lat, min_lng, max_lng).map_err(|_| ParseBoundsError(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected minLng,minLat,maxLng,maxLat, got {0:?}")]
pub struct ParseBoundsError(String);

fn check_zoom(zoom: u8) -> Result<(), CoordinateError> {
    if zoom > MAX_ZOOM {
        Err(CoordinateError::InvalidZoom(zoom))
    } else {
        Ok(())
    }
}

/// Number of tiles along one axis at `zoom`.
pub fn tile_count(zoom: u8) -> u64 {
    1_u64 << zoom
}

/// Sub-tile precision variant of [`geo_to_tile`]. Latitudes beyond the Mercator
/// limit are clamped to it.
pub fn geo_to_tile_fractional(point: &GeoPoint, zoom: u8) -> Result<TilePoint, CoordinateError> {
    point.validate()?;
    check_zoom(zoom)?;

    let n = tile_count(zoom) as f64;

    let lat_rad = point
        .lat
        .clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT)
        .to_radians();

    let x = (point.lng + 180.0) / 360.0 * n;

    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;

    Ok(TilePoint { x, y, zoom })
}

/// Tile containing `point`. Indices are clamped into `[0, 2^zoom)`, so `lng = 180`
/// maps to the last column.
pub fn geo_to_tile(point: &GeoPoint, zoom: u8) -> Result<TileIndex, CoordinateError> {
    let fractional = geo_to_tile_fractional(point, zoom)?;

    let max = (tile_count(zoom) - 1) as f64;

    Ok(TileIndex {
        x: fractional.x.floor().clamp(0.0, max) as u32,
        y: fractional.y.floor().clamp(0.0, max) as u32,
        zoom,
    })
}

/// North-west corner of tile `(x, y)`; fractional coordinates are allowed.
pub fn tile_to_geo(x: f64, y: f64, zoom: u8) -> GeoPoint {
    let n = tile_count(zoom) as f64;

    let lng = x / n * 360.0 - 180.0;

    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();

    GeoPoint { lat, lng }
}

pub fn tile_bounds(tile: TileIndex) -> GeoBounds {
    let north_west = tile_to_geo(tile.x as f64, tile.y as f64, tile.zoom);

    let south_east = tile_to_geo((tile.x + 1) as f64, (tile.y + 1) as f64, tile.zoom);

    GeoBounds {
        min_lat: south_east.lat,
        max_lat: north_west.lat,
        min_lng: north_west.lng,
        max_lng: south_east.lng,
    }
}

/// Haversine great-circle distance on the mean Earth sphere.
pub fn distance_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    Haversine.distance(Point::from(*a), Point::from(*b))
}
