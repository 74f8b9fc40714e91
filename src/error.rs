use crate::coords::TileIndex;
use crate::job::JobId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    #[error("coordinate is not a finite number: lat {lat}, lng {lng}")]
    NonFinite { lat: f64, lng: f64 },
    #[error("coordinate out of range: lat {lat}, lng {lng}")]
    OutOfRange { lat: f64, lng: f64 },
    #[error("zoom level {0} is not supported (max {max})", max = crate::coords::MAX_ZOOM)]
    InvalidZoom(u8),
    #[error("bounds are empty or inverted: lat {min_lat}..{max_lat}, lng {min_lng}..{max_lng}")]
    InvalidBounds {
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
    },
}

/// Bad grid, zoom, threshold or file configuration. Fatal at planning.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error("mosaic tile count must be at least 1")]
    ZeroMosaic,
    #[error("tile size must be at least 1 pixel")]
    ZeroTileSize,
    #[error("overlap fraction {0} must be in [0, 1)")]
    InvalidOverlap(f64),
    #[error("grid of {cols}x{rows} blocks exceeds the limit of {max} blocks")]
    TooManyBlocks { cols: u32, rows: u32, max: usize },
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("no tile providers configured")]
    NoProviders,
    #[error("invalid provider {name}: {reason}")]
    InvalidProvider { name: String, reason: String },
    #[error("invalid color {0}")]
    InvalidColor(String),
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parsing failed: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Single tile fetch failure. Recovered by the next provider or a placeholder.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{provider}: timed out fetching {tile}")]
    Timeout { provider: String, tile: TileIndex },
    #[error("{provider}: HTTP {status} for {tile}")]
    Status {
        provider: String,
        status: u16,
        tile: TileIndex,
    },
    #[error("{provider}: no tile {tile}")]
    Missing { provider: String, tile: TileIndex },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Detection model failure for a block. The block is recorded as failed.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("detection service answered HTTP {0}")]
    Status(u16),
    #[error("detection timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("malformed detection: {0}")]
    Malformed(String),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("detection panicked: {0}")]
    Panicked(String),
}

/// Degenerate detection geometry. The detection is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconciliationError {
    #[error("polygon has {0} distinct vertices, need at least 3")]
    TooFewVertices(usize),
    #[error("polygon has non-finite coordinates")]
    NonFinite,
    #[error("polygon is self-intersecting")]
    SelfIntersecting,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("events of job {0} were already taken")]
    EventsTaken(JobId),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
