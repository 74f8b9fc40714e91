//! Block mosaic assembly from raw tiles, with provider fallback and
//! placeholder tiles.

use crate::{
    coords::TileIndex,
    error::ProviderError,
    grid::AnalysisBlock,
    providers::TileProvider,
};
use futures::{StreamExt, stream};
use image::{
    Rgb, RgbImage,
    imageops::{self, FilterType},
};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{task::spawn_blocking, time::timeout};
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct FetchPolicy {
    pub tile_timeout: Duration,
    pub retry_attempts: u32,
    pub tile_concurrency: usize,
    pub tile_size: u32,
    pub placeholder_color: Rgb<u8>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            tile_timeout: Duration::from_secs(15),
            retry_attempts: 3,
            tile_concurrency: 10,
            tile_size: 256,
            placeholder_color: Rgb([0x80, 0x80, 0x80]),
        }
    }
}

/// How much of a mosaic is real imagery.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MosaicQuality {
    pub total_tiles: usize,
    pub fetched_tiles: usize,
    pub placeholder_tiles: Vec<TileIndex>,
}

impl MosaicQuality {
    pub fn is_complete(&self) -> bool {
        self.placeholder_tiles.is_empty()
    }

    pub fn is_all_placeholder(&self) -> bool {
        self.fetched_tiles == 0
    }
}

/// Raster mosaic of one block. Always full size.
#[derive(Clone, Debug)]
pub struct BlockImage {
    pub block_index: usize,
    pub pixels: RgbImage,
    pub quality: MosaicQuality,
}

impl BlockImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Flat tile crossed by two diagonals, marking missing imagery.
pub fn placeholder_tile(size: u32, color: Rgb<u8>) -> RgbImage {
    let mut tile = RgbImage::from_pixel(size, size, color);

    let marker = Rgb(color.0.map(|channel| channel / 2));

    for i in 0..size {
        tile.put_pixel(i, i, marker);
        tile.put_pixel(size - 1 - i, i, marker);
    }

    tile
}

fn decode_tile(bytes: &[u8], tile_size: u32) -> Result<RgbImage, image::ImageError> {
    let tile = image::load_from_memory(bytes)?.to_rgb8();

    if tile.width() == tile_size && tile.height() == tile_size {
        Ok(tile)
    } else {
        Ok(imageops::resize(&tile, tile_size, tile_size, FilterType::Triangle))
    }
}

struct FetchedTile {
    col: u32,
    row: u32,
    tile: TileIndex,
    data: Option<Vec<u8>>,
}

fn assemble(
    block_index: usize,
    mosaic_tiles: u32,
    tile_size: u32,
    placeholder_color: Rgb<u8>,
    fetched: Vec<FetchedTile>,
) -> BlockImage {
    let total_tiles = fetched.len();

    let decoded: Vec<_> = fetched
        .into_par_iter()
        .map(|fetched| {
            let image = fetched.data.and_then(|data| {
                decode_tile(&data, tile_size)
                    .inspect_err(|err| warn!("block {block_index}: undecodable tile {}: {err}", fetched.tile))
                    .ok()
            });

            (fetched.col, fetched.row, fetched.tile, image)
        })
        .collect();

    let side = mosaic_tiles * tile_size;

    let mut pixels = RgbImage::from_pixel(side, side, placeholder_color);

    let placeholder = placeholder_tile(tile_size, placeholder_color);

    let mut placeholder_tiles = Vec::new();

    for (col, row, tile, image) in decoded {
        let x = i64::from(col * tile_size);

        let y = i64::from(row * tile_size);

        match image {
            Some(image) => imageops::replace(&mut pixels, &image, x, y),
            None => {
                imageops::replace(&mut pixels, &placeholder, x, y);

                placeholder_tiles.push(tile);
            }
        }
    }

    placeholder_tiles.sort();

    BlockImage {
        block_index,
        pixels,
        quality: MosaicQuality {
            total_tiles,
            fetched_tiles: total_tiles - placeholder_tiles.len(),
            placeholder_tiles,
        },
    }
}

pub struct BlockFetcher {
    providers: Vec<Arc<dyn TileProvider>>,
    policy: FetchPolicy,
}

impl BlockFetcher {
    pub fn new(providers: Vec<Arc<dyn TileProvider>>, policy: FetchPolicy) -> Self {
        Self { providers, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Tries providers in priority order, each up to `retry_attempts` times
    /// under the per-tile timeout. Returns the last error when all fail.
    pub async fn fetch_tile(&self, tile: TileIndex) -> Result<Vec<u8>, ProviderError> {
        let mut last_error = None;

        for provider in &self.providers {
            for attempt in 1..=self.policy.retry_attempts.max(1) {
                let err = match timeout(self.policy.tile_timeout, provider.fetch(tile)).await {
                    Ok(Ok(data)) => return Ok(data),
                    Ok(Err(err)) => err,
                    Err(_) => ProviderError::Timeout {
                        provider: provider.name().to_string(),
                        tile,
                    },
                };

                debug!("{} attempt {attempt}: {err}", provider.name());

                let missing = matches!(err, ProviderError::Missing { .. });

                last_error = Some(err);

                // retrying cannot make a tile appear
                if missing {
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::Missing {
            provider: "none".to_string(),
            tile,
        }))
    }

    /// Fetches all N×N tiles of `block`. Never fails: tiles no provider could
    /// deliver become placeholders and are recorded in the mosaic quality.
    pub async fn fetch_block(&self, block: &AnalysisBlock) -> BlockImage {
        let fetched: Vec<FetchedTile> = stream::iter(block.tiles())
            .map(|(col, row, tile)| async move {
                let data = match self.fetch_tile(tile).await {
                    Ok(data) => Some(data),
                    Err(err) => {
                        warn!("block {}: tile {tile} unavailable: {err}", block.index);

                        None
                    }
                };

                FetchedTile {
                    col,
                    row,
                    tile,
                    data,
                }
            })
            .buffer_unordered(self.policy.tile_concurrency.max(1))
            .collect()
            .await;

        let block_index = block.index;

        let mosaic_tiles = block.mosaic_tiles;

        let FetchPolicy {
            tile_size,
            placeholder_color,
            ..
        } = self.policy;

        let image = spawn_blocking(move || {
            assemble(block_index, mosaic_tiles, tile_size, placeholder_color, fetched)
        })
        .await;

        match image {
            Ok(image) => image,
            Err(err) => {
                error!("block {block_index}: mosaic assembly failed: {err}");

                let tiles: Vec<_> = block
                    .tiles()
                    .map(|(col, row, tile)| FetchedTile {
                        col,
                        row,
                        tile,
                        data: None,
                    })
                    .collect();

                assemble(block_index, mosaic_tiles, tile_size, placeholder_color, tiles)
            }
        }
    }
}
