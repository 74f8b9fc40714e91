//! Overlapping coverage grid of fixed-size analysis blocks.

use crate::{
    coords::{
        GeoBounds, GeoPoint, MAX_ZOOM, TileIndex, TilePoint, geo_to_tile_fractional,
        tile_count, tile_to_geo,
    },
    error::{ConfigurationError, CoordinateError},
};
use itertools::iproduct;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub cols: u32,
    pub rows: u32,
}

impl GridShape {
    pub const fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub const fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridParams {
    pub zoom: u8,
    /// Tiles per block side (N).
    pub mosaic_tiles: u32,
    /// Fraction of a block shared with its neighbour (f).
    pub overlap: f64,
    /// Raw tile size in pixels.
    pub tile_size: u32,
    /// Largest grid a single job may plan.
    pub max_blocks: usize,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            zoom: 21,
            mosaic_tiles: 6,
            overlap: 0.2,
            tile_size: 256,
            max_blocks: 10_000,
        }
    }
}

impl GridParams {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.zoom > MAX_ZOOM {
            return Err(CoordinateError::InvalidZoom(self.zoom).into());
        }

        if self.mosaic_tiles == 0 {
            return Err(ConfigurationError::ZeroMosaic);
        }

        if u64::from(self.mosaic_tiles) > tile_count(self.zoom) {
            return Err(ConfigurationError::OutOfRange {
                name: "mosaic_tiles",
                value: self.mosaic_tiles as f64,
                min: 1.0,
                max: tile_count(self.zoom) as f64,
            });
        }

        if self.tile_size == 0 {
            return Err(ConfigurationError::ZeroTileSize);
        }

        if !(0.0..1.0).contains(&self.overlap) {
            return Err(ConfigurationError::InvalidOverlap(self.overlap));
        }

        Ok(())
    }

    /// Distance between neighbouring block centers, in tiles.
    pub fn stride_tiles(&self) -> f64 {
        self.mosaic_tiles as f64 * (1.0 - self.overlap)
    }

    pub fn block_pixels(&self) -> u32 {
        self.mosaic_tiles * self.tile_size
    }
}

/// One unit of work: an N×N tile mosaic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisBlock {
    pub index: usize,
    /// Ideal (unrounded) center.
    pub center_tile: TilePoint,
    /// North-west tile of the mosaic.
    pub origin: TileIndex,
    pub bounds: GeoBounds,
    pub mosaic_tiles: u32,
}

impl AnalysisBlock {
    /// Tiles in row-major order, with their column and row inside the mosaic.
    pub fn tiles(&self) -> impl Iterator<Item = (u32, u32, TileIndex)> + '_ {
        iproduct!(0..self.mosaic_tiles, 0..self.mosaic_tiles).map(|(row, col)| {
            (
                col,
                row,
                TileIndex {
                    x: self.origin.x + col,
                    y: self.origin.y + row,
                    zoom: self.origin.zoom,
                },
            )
        })
    }

    /// Center actually covered after rounding to the tile grid.
    pub fn actual_center_tile(&self) -> TilePoint {
        let half = self.mosaic_tiles as f64 / 2.0;

        TilePoint {
            x: self.origin.x as f64 + half,
            y: self.origin.y as f64 + half,
            zoom: self.origin.zoom,
        }
    }
}

/// Builds a block around a fractional center. The center is rounded to the
/// nearest tile corner, so the block may sit up to half a tile off its ideal
/// position; this keeps fetched tiles grid-aligned.
fn block_at(index: usize, center: TilePoint, params: &GridParams) -> AnalysisBlock {
    let n = params.mosaic_tiles;

    let max_origin = (tile_count(params.zoom) - u64::from(n)) as f64;

    let half = (n / 2) as f64;

    let origin_x = (center.x.round() - half).clamp(0.0, max_origin) as u32;

    let origin_y = (center.y.round() - half).clamp(0.0, max_origin) as u32;

    let north_west = tile_to_geo(origin_x as f64, origin_y as f64, params.zoom);

    let south_east = tile_to_geo((origin_x + n) as f64, (origin_y + n) as f64, params.zoom);

    AnalysisBlock {
        index,
        center_tile: center,
        origin: TileIndex {
            x: origin_x,
            y: origin_y,
            zoom: params.zoom,
        },
        bounds: GeoBounds {
            min_lat: south_east.lat,
            max_lat: north_west.lat,
            min_lng: north_west.lng,
            max_lng: south_east.lng,
        },
        mosaic_tiles: n,
    }
}

/// `cols × rows` blocks centered on `center`, spaced `N * (1 - f)` tiles apart.
/// Indices run row-major from the north-west block.
pub fn plan_around(
    center: &GeoPoint,
    shape: GridShape,
    params: &GridParams,
) -> Result<Vec<AnalysisBlock>, ConfigurationError> {
    params.validate()?;

    let center = geo_to_tile_fractional(center, params.zoom)?;

    if shape.len() > params.max_blocks {
        return Err(ConfigurationError::TooManyBlocks {
            cols: shape.cols,
            rows: shape.rows,
            max: params.max_blocks,
        });
    }

    if shape.is_empty() {
        return Ok(Vec::new());
    }

    let stride = params.stride_tiles();

    let col_offset = (shape.cols - 1) as f64 / 2.0;

    let row_offset = (shape.rows - 1) as f64 / 2.0;

    let blocks = iproduct!(0..shape.rows, 0..shape.cols)
        .enumerate()
        .map(|(index, (row, col))| {
            let block_center = TilePoint {
                x: center.x + (col as f64 - col_offset) * stride,
                y: center.y + (row as f64 - row_offset) * stride,
                zoom: params.zoom,
            };

            block_at(index, block_center, params)
        })
        .collect();

    Ok(blocks)
}

/// Fractional tile coordinates of the north-west and south-east corners.
fn tile_extent(bounds: &GeoBounds, zoom: u8) -> Result<(TilePoint, TilePoint), ConfigurationError> {
    let north_west = geo_to_tile_fractional(&bounds.north_west(), zoom)?;

    let south_east = geo_to_tile_fractional(
        &GeoPoint {
            lat: bounds.min_lat,
            lng: bounds.max_lng,
        },
        zoom,
    )?;

    Ok((north_west, south_east))
}

/// Blocks needed along one axis to cover `span` tiles, with one tile of slack
/// on each side for the rounding of block origins.
fn blocks_for_span(span: f64, params: &GridParams) -> u32 {
    let uncovered = (span + 2.0 - params.mosaic_tiles as f64).max(0.0);

    // saturates; oversized results are rejected against `max_blocks`
    ((uncovered / params.stride_tiles()).ceil() + 1.0) as u32
}

/// Grid shape that fully covers `bounds`. Measured in tile space, so latitudes
/// beyond the Mercator limit are clamped like everywhere else.
pub fn covering_shape(bounds: &GeoBounds, params: &GridParams) -> Result<GridShape, ConfigurationError> {
    params.validate()?;

    let (north_west, south_east) = tile_extent(bounds, params.zoom)?;

    let shape = GridShape {
        cols: blocks_for_span(south_east.x - north_west.x, params),
        rows: blocks_for_span(south_east.y - north_west.y, params),
    };

    if shape.len() > params.max_blocks {
        return Err(ConfigurationError::TooManyBlocks {
            cols: shape.cols,
            rows: shape.rows,
            max: params.max_blocks,
        });
    }

    Ok(shape)
}

/// Grid centered on the middle of `bounds` in tile space.
pub fn plan_covering(
    bounds: &GeoBounds,
    params: &GridParams,
) -> Result<Vec<AnalysisBlock>, ConfigurationError> {
    let shape = covering_shape(bounds, params)?;

    let (north_west, south_east) = tile_extent(bounds, params.zoom)?;

    let center = tile_to_geo(
        (north_west.x + south_east.x) / 2.0,
        (north_west.y + south_east.y) / 2.0,
        params.zoom,
    );

    plan_around(&center, shape, params)
}

/// Grid over the bounding box of a boundary polygon.
pub fn plan_covering_polygon(
    boundary: &[GeoPoint],
    params: &GridParams,
) -> Result<Vec<AnalysisBlock>, ConfigurationError> {
    let bounds = GeoBounds::from_points(boundary)?;

    plan_covering(&bounds, params)
}
