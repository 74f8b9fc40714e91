#![allow(dead_code)]

use futures::future::BoxFuture;
use image::{ImageFormat, Rgb, RgbImage};
use parkgrid::{
    config::Config,
    coords::{GeoPoint, TileIndex},
    detection::{BlockDetections, DetectionRequest, Detector, PixelPoint, RawDetection},
    error::{DetectionError, ProviderError},
    fetch::BlockFetcher,
    job::{JobEvent, Orchestrator},
    providers::TileProvider,
};
use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

pub const TILE_SIZE: u32 = 64;

pub fn utrecht() -> GeoPoint {
    GeoPoint::new(52.0907, 5.1214).unwrap()
}

pub fn test_config() -> Config {
    let mut config = Config::default();

    config.grid.mosaic_tiles = 4;
    config.grid.tile_size = TILE_SIZE;
    config.fetch.tile_timeout_secs = 5;
    config.fetch.retry_attempts = 1;
    config.job.concurrency = Some(3);
    config.job.cancel_grace_secs = 2;

    config
}

pub fn png_tile(size: u32, color: Rgb<u8>) -> Vec<u8> {
    let mut data = Vec::new();

    RgbImage::from_pixel(size, size, color)
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .unwrap();

    data
}

/// Serves a solid tile, or fails for tiles `fail` matches.
pub struct MockProvider {
    tile: Vec<u8>,
    fail: Box<dyn Fn(TileIndex) -> bool + Send + Sync>,
    pub calls: AtomicUsize,
}

impl MockProvider {
    pub fn solid() -> Self {
        Self::failing_when(|_| false)
    }

    pub fn failing_when(fail: impl Fn(TileIndex) -> bool + Send + Sync + 'static) -> Self {
        Self {
            tile: png_tile(TILE_SIZE, Rgb([90, 90, 100])),
            fail: Box::new(fail),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TileProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch(&self, tile: TileIndex) -> BoxFuture<'_, Result<Vec<u8>, ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        Box::pin(async move {
            if (self.fail)(tile) {
                Err(ProviderError::Status {
                    provider: "mock".to_string(),
                    status: 503,
                    tile,
                })
            } else {
                Ok(self.tile.clone())
            }
        })
    }
}

/// Outcome of one detector call; `None` never completes.
pub type Script = dyn Fn(usize, &DetectionRequest) -> Option<Result<Vec<RawDetection>, DetectionError>> + Send + Sync;

pub struct ScriptedDetector {
    script: Box<Script>,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(
        script: impl Fn(usize, &DetectionRequest) -> Option<Result<Vec<RawDetection>, DetectionError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(|_, _| Some(Ok(Vec::new())))
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &self,
        batch: Vec<DetectionRequest>,
        _confidence_threshold: f64,
    ) -> BoxFuture<'_, Result<Vec<BlockDetections>, DetectionError>> {
        let mut blocks = Vec::new();

        for request in &batch {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            match (self.script)(call, request) {
                Some(Ok(detections)) => blocks.push(BlockDetections {
                    block_index: request.block_index,
                    detections,
                }),
                Some(Err(err)) => return Box::pin(async move { Err(err) }),
                None => return Box::pin(std::future::pending()),
            }
        }

        Box::pin(async move { Ok(blocks) })
    }
}

/// Axis-aligned box in block pixels.
pub fn obb(block_index: usize, (x0, y0, x1, y1): (f64, f64, f64, f64), confidence: f64, vehicles: u32) -> RawDetection {
    RawDetection {
        block_index,
        pixel_polygon: vec![
            PixelPoint { x: x0, y: y0 },
            PixelPoint { x: x1, y: y0 },
            PixelPoint { x: x1, y: y1 },
            PixelPoint { x: x0, y: y1 },
        ],
        confidence,
        vehicle_count: vehicles,
        is_occupied: vehicles > 0,
    }
}

pub fn orchestrator(config: Config, provider: Arc<dyn TileProvider>, detector: Arc<dyn Detector>) -> Orchestrator {
    let fetcher = BlockFetcher::new(vec![provider], config.fetch_policy().unwrap());

    Orchestrator::new(Arc::new(config), Arc::new(fetcher), detector)
}

/// All remaining events until the job drops its sender.
pub async fn drain(events: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut collected = Vec::new();

    timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
    })
    .await
    .expect("job did not finish in time");

    collected
}

/// Events up to and including the first one `stop` accepts.
pub async fn until(
    events: &mut UnboundedReceiver<JobEvent>,
    stop: impl Fn(&JobEvent) -> bool,
) -> Vec<JobEvent> {
    let mut collected = Vec::new();

    timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            let done = stop(&event);

            collected.push(event);

            if done {
                break;
            }
        }
    })
    .await
    .expect("event did not arrive in time");

    collected
}
