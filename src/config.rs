use crate::{
    error::ConfigurationError,
    fetch::FetchPolicy,
    georef::{Georeferencer, LatitudeInterpolation},
    grid::GridParams,
    reconcile::MergeStrategy,
};
use image::Rgb;
use serde::{Deserialize, Serialize};
use std::{fs, num::NonZeroUsize, path::Path, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grid: GridConfig,
    pub fetch: FetchConfig,
    pub detection: DetectionConfig,
    pub georef: GeorefConfig,
    pub reconcile: MergeStrategy,
    pub job: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub zoom: u8,
    pub mosaic_tiles: u32,
    pub overlap: f64,
    pub tile_size: u32,
    pub max_blocks: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        let GridParams {
            zoom,
            mosaic_tiles,
            overlap,
            tile_size,
            max_blocks,
        } = GridParams::default();

        Self {
            zoom,
            mosaic_tiles,
            overlap,
            tile_size,
            max_blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// XYZ URL template with `{z}`, `{x}` and `{y}` placeholders
    Http { name: String, url: String },
    Mbtiles { name: String, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub tile_timeout_secs: u64,
    pub retry_attempts: u32,
    pub tile_concurrency: usize,
    /// Hex RGB, e.g. `808080`
    pub placeholder_color: String,
    pub user_agent: String,
    /// Tried in order
    pub providers: Vec<ProviderConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            tile_timeout_secs: 15,
            retry_attempts: 3,
            tile_concurrency: 10,
            placeholder_color: "808080".to_string(),
            user_agent: concat!("parkgrid/", env!("CARGO_PKG_VERSION")).to_string(),
            providers: vec![ProviderConfig::Http {
                name: "esri-world-imagery".to_string(),
                url: "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}"
                    .to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub confidence_threshold: f64,
    pub jpeg_quality: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/analyze-tiles".to_string(),
            timeout_secs: 120,
            confidence_threshold: 0.25,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeorefConfig {
    /// Ground area of one parked car
    pub footprint_sq_meters: f64,
    pub latitude: LatitudeInterpolation,
}

impl Default for GeorefConfig {
    fn default() -> Self {
        Self {
            footprint_sq_meters: 11.25,
            latitude: LatitudeInterpolation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Worker count; available parallelism when unset
    pub concurrency: Option<usize>,
    pub cancel_grace_secs: u64,
    /// How long a finished job stays queryable before it is dropped
    pub retention_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            cancel_grace_secs: 15,
            retention_secs: 3600,
        }
    }
}

/// Parses hex `RRGGBB`.
pub fn parse_color(string: &str) -> Result<Rgb<u8>, ConfigurationError> {
    let string = string.trim_start_matches('#');

    if string.len() != 6 {
        return Err(ConfigurationError::InvalidColor(string.to_string()));
    }

    u32::from_str_radix(string, 16)
        .map(|color| {
            let [_, r, g, b] = color.to_be_bytes();

            Rgb([r, g, b])
        })
        .map_err(|_| ConfigurationError::InvalidColor(string.to_string()))
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigurationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

impl Config {
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path)?;

            tracing::info!("Loaded config from {}", path.display());

            Ok(toml::from_str(&contents)?)
        } else {
            tracing::info!("Config file not found at {}, using defaults", path.display());

            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.grid_params().validate()?;

        parse_color(&self.fetch.placeholder_color)?;

        if self.fetch.providers.is_empty() {
            return Err(ConfigurationError::NoProviders);
        }

        check_range(
            "detection.confidence_threshold",
            self.detection.confidence_threshold,
            0.0,
            1.0,
        )?;

        check_range("detection.jpeg_quality", self.detection.jpeg_quality as f64, 1.0, 100.0)?;

        if !(self.georef.footprint_sq_meters > 0.0) {
            return Err(ConfigurationError::OutOfRange {
                name: "georef.footprint_sq_meters",
                value: self.georef.footprint_sq_meters,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }

        if let MergeStrategy::Greedy {
            max_distance_meters,
            iou_threshold,
        } = self.reconcile
        {
            check_range("reconcile.max_distance_meters", max_distance_meters, 0.0, f64::MAX)?;

            check_range("reconcile.iou_threshold", iou_threshold, 0.0, 1.0)?;
        }

        if self.job.concurrency == Some(0) {
            return Err(ConfigurationError::OutOfRange {
                name: "job.concurrency",
                value: 0.0,
                min: 1.0,
                max: f64::MAX,
            });
        }

        Ok(())
    }

    pub fn grid_params(&self) -> GridParams {
        GridParams {
            zoom: self.grid.zoom,
            mosaic_tiles: self.grid.mosaic_tiles,
            overlap: self.grid.overlap,
            tile_size: self.grid.tile_size,
            max_blocks: self.grid.max_blocks,
        }
    }

    pub fn fetch_policy(&self) -> Result<FetchPolicy, ConfigurationError> {
        Ok(FetchPolicy {
            tile_timeout: Duration::from_secs(self.fetch.tile_timeout_secs),
            retry_attempts: self.fetch.retry_attempts,
            tile_concurrency: self.fetch.tile_concurrency,
            tile_size: self.grid.tile_size,
            placeholder_color: parse_color(&self.fetch.placeholder_color)?,
        })
    }

    pub fn georeferencer(&self) -> Georeferencer {
        Georeferencer {
            footprint_sq_meters: self.georef.footprint_sq_meters,
            latitude: self.georef.latitude,
        }
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(self.detection.timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.job.cancel_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.job.retention_secs)
    }

    pub fn concurrency(&self) -> usize {
        self.job.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4)
        })
    }

    pub fn http_client(&self) -> Result<reqwest::Client, ConfigurationError> {
        Ok(reqwest::Client::builder()
            .user_agent(&self.fetch.user_agent)
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.validate().map_err(|err| err.to_string()), Ok(()));
        assert_eq!(config.grid_params(), GridParams::default());
        assert_eq!(
            config.reconcile,
            MergeStrategy::Greedy {
                max_distance_meters: 50.0,
                iou_threshold: 0.1
            }
        );
        assert_eq!(config.georeferencer().footprint_sq_meters, 11.25);
        assert_eq!(config.fetch_policy().unwrap().tile_timeout, Duration::from_secs(15));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [grid]
            mosaic_tiles = 4

            [fetch]
            placeholder_color = "ff0000"

            [[fetch.providers]]
            kind = "mbtiles"
            name = "local"
            path = "/tmp/tiles.mbtiles"

            [[fetch.providers]]
            kind = "http"
            name = "remote"
            url = "https://example.com/{z}/{x}/{y}.jpeg"

            [georef]
            latitude = "mercator"

            [reconcile]
            strategy = "disabled"

            [job]
            concurrency = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.grid.mosaic_tiles, 4);
        assert_eq!(config.grid.zoom, 21);
        assert_eq!(config.fetch.providers.len(), 2);
        assert!(matches!(config.fetch.providers[0], ProviderConfig::Mbtiles { .. }));
        assert_eq!(config.fetch_policy().unwrap().placeholder_color, Rgb([255, 0, 0]));
        assert_eq!(config.georef.latitude, LatitudeInterpolation::Mercator);
        assert_eq!(config.reconcile, MergeStrategy::Disabled);
        assert_eq!(config.concurrency(), 2);
        assert_eq!(config.detection.confidence_threshold, 0.25);
    }

    #[test]
    fn greedy_thresholds_default_per_field() {
        let config: Config = toml::from_str(
            r#"
            [reconcile]
            strategy = "greedy"
            iou_threshold = 0.3
            "#,
        )
        .unwrap();

        assert_eq!(
            config.reconcile,
            MergeStrategy::Greedy {
                max_distance_meters: 50.0,
                iou_threshold: 0.3
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();

        config.grid.overlap = 1.0;

        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidOverlap(_))
        ));

        let mut config = Config::default();

        config.detection.confidence_threshold = 1.5;

        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::OutOfRange { .. })
        ));

        let mut config = Config::default();

        config.fetch.providers.clear();

        assert!(matches!(config.validate(), Err(ConfigurationError::NoProviders)));

        assert!(parse_color("80808").is_err());
        assert!(parse_color("zzzzzz").is_err());
        assert_eq!(parse_color("#0a0b0c").unwrap(), Rgb([10, 11, 12]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let config = Config::from_file_or_default(dir.path().join("none.toml")).unwrap();

        assert_eq!(config, Config::default());
    }
}
