//! Client side of the external OBB detection model.

use crate::{coords::GeoBounds, error::DetectionError, fetch::BlockImage};
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct DetectionRequest {
    pub block_index: usize,
    /// JPEG encoded mosaic
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bounds: GeoBounds,
}

impl DetectionRequest {
    pub fn from_block_image(
        image: &BlockImage,
        bounds: GeoBounds,
        jpeg_quality: u8,
    ) -> Result<Self, DetectionError> {
        let mut image_bytes = Vec::new();

        JpegEncoder::new_with_quality(&mut image_bytes, jpeg_quality).encode_image(&image.pixels)?;

        Ok(Self {
            block_index: image.block_index,
            image_bytes,
            width: image.width(),
            height: image.height(),
            bounds,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

/// One oriented bounding box in block pixel space.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub block_index: usize,
    pub pixel_polygon: Vec<PixelPoint>,
    pub confidence: f64,
    pub vehicle_count: u32,
    pub is_occupied: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockDetections {
    pub block_index: usize,
    pub detections: Vec<RawDetection>,
}

pub trait Detector: Send + Sync {
    /// Detections for every requested block, in request order. A block with
    /// no detections gets an empty list.
    fn detect(
        &self,
        batch: Vec<DetectionRequest>,
        confidence_threshold: f64,
    ) -> BoxFuture<'_, Result<Vec<BlockDetections>, DetectionError>>;
}

#[derive(Serialize)]
struct WireTile {
    image_base64: String,
    tile_index: usize,
    bounds: GeoBounds,
    width: u32,
    height: u32,
}

#[derive(Serialize)]
struct WireRequest {
    tiles: Vec<WireTile>,
    confidence_threshold: f64,
}

#[derive(Deserialize)]
struct WireDetection {
    /// Flat `[x1, y1, x2, y2, ...]`
    polygon: Vec<f64>,
    confidence: f64,
    #[serde(default)]
    vehicle_count: u32,
    #[serde(default)]
    is_occupied: bool,
}

#[derive(Deserialize)]
struct WireBlock {
    tile_index: usize,
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    blocks: Vec<WireBlock>,
}

fn parse_detection(block_index: usize, wire: WireDetection) -> Result<RawDetection, DetectionError> {
    if wire.polygon.len() % 2 != 0 {
        return Err(DetectionError::Malformed(format!(
            "block {block_index}: odd polygon coordinate count {}",
            wire.polygon.len()
        )));
    }

    let pixel_polygon = wire
        .polygon
        .chunks_exact(2)
        .map(|xy| PixelPoint { x: xy[0], y: xy[1] })
        .collect();

    Ok(RawDetection {
        block_index,
        pixel_polygon,
        confidence: wire.confidence,
        vehicle_count: wire.vehicle_count,
        is_occupied: wire.is_occupied,
    })
}

fn into_block_detections(
    requested: &[usize],
    response: WireResponse,
) -> Result<Vec<BlockDetections>, DetectionError> {
    let mut by_block: HashMap<usize, Vec<WireDetection>> = HashMap::new();

    for block in response.blocks {
        by_block.entry(block.tile_index).or_default().extend(block.detections);
    }

    requested
        .iter()
        .map(|&block_index| {
            let detections = by_block
                .remove(&block_index)
                .unwrap_or_default()
                .into_iter()
                .map(|wire| parse_detection(block_index, wire))
                .collect::<Result<_, _>>()?;

            Ok(BlockDetections {
                block_index,
                detections,
            })
        })
        .collect()
}

/// Detection service reached over HTTP with base64 data URL images.
pub struct HttpDetector {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            timeout,
        }
    }
}

impl Detector for HttpDetector {
    fn detect(
        &self,
        batch: Vec<DetectionRequest>,
        confidence_threshold: f64,
    ) -> BoxFuture<'_, Result<Vec<BlockDetections>, DetectionError>> {
        Box::pin(async move {
            let requested: Vec<_> = batch.iter().map(|request| request.block_index).collect();

            let body = WireRequest {
                tiles: batch
                    .into_iter()
                    .map(|request| WireTile {
                        image_base64: format!(
                            "data:image/jpeg;base64,{}",
                            STANDARD.encode(&request.image_bytes)
                        ),
                        tile_index: request.block_index,
                        bounds: request.bounds,
                        width: request.width,
                        height: request.height,
                    })
                    .collect(),
                confidence_threshold,
            };

            debug!("posting {} blocks to {}", requested.len(), self.endpoint);

            let response = self
                .client
                .post(&self.endpoint)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        DetectionError::Timeout(self.timeout)
                    } else {
                        DetectionError::Http(err)
                    }
                })?;

            let status = response.status();

            if !status.is_success() {
                return Err(DetectionError::Status(status.as_u16()));
            }

            let response: WireResponse = response.json().await?;

            into_block_detections(&requested, response)
        })
    }
}
