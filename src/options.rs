use clap::{ArgGroup, Parser};
use parkgrid::{
    config::{Config, ProviderConfig},
    coords::{GeoBounds, GeoPoint},
    grid::GridShape,
    job::{AreaSpec, JobRequest},
    reconcile::MergeStrategy,
};
use std::{path::PathBuf, str::FromStr};

#[derive(Clone, Debug, Parser, PartialEq)]
#[clap(group = ArgGroup::new("area").required(true))]
pub struct Options {
    /// TOML configuration file; defaults are used if it does not exist
    #[clap(long, default_value = "parkgrid.toml")]
    pub config: PathBuf,

    /// Center of the analysed area as `lat,lng`
    #[clap(long, group = "area")]
    pub center: Option<LatLng>,

    /// Grid of blocks around `--center` as `COLSxROWS`
    #[clap(long, default_value = "3x3", requires = "center")]
    pub grid: Grid,

    /// WGS84 bounding box to cover as `minLng,minLat,maxLng,maxLat`
    #[clap(long, group = "area")]
    pub bbox: Option<GeoBounds>,

    /// Slippy-map zoom level of the imagery
    #[clap(long)]
    pub zoom: Option<u8>,

    /// Tiles per block side
    #[clap(long)]
    pub mosaic_tiles: Option<u32>,

    /// Fraction of a block shared with its neighbour, in [0, 1)
    #[clap(long)]
    pub overlap: Option<f64>,

    /// Detection service endpoint
    #[clap(long)]
    pub detection_endpoint: Option<String>,

    /// Minimum detection confidence, 0.0 to 1.0
    #[clap(long)]
    pub confidence_threshold: Option<f64>,

    /// Local MBTiles file tried before the configured providers
    #[clap(long)]
    pub mbtiles: Option<PathBuf>,

    /// Number of blocks processed at once
    #[clap(long)]
    pub concurrency: Option<usize>,

    /// Max centroid distance in meters for merging detections
    #[clap(long)]
    pub max_distance: Option<f64>,

    /// Min intersection over union for merging detections
    #[clap(long)]
    pub iou_threshold: Option<f64>,

    /// Keep every detection, do not merge across blocks
    #[clap(long, conflicts_with_all = ["max_distance", "iou_threshold"])]
    pub no_merge: bool,

    /// Ground area of one parked car in square meters
    #[clap(long)]
    pub footprint: Option<f64>,

    /// Write parking spaces as GeoJSON
    #[clap(long)]
    pub geojson: Option<PathBuf>,

    /// Write parking spaces as CSV
    #[clap(long)]
    pub csv: Option<PathBuf>,

    /// Enable verbose logging
    #[clap(short, long)]
    pub verbose: bool,
}

impl Options {
    /// Command line values override the configuration file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(zoom) = self.zoom {
            config.grid.zoom = zoom;
        }

        if let Some(mosaic_tiles) = self.mosaic_tiles {
            config.grid.mosaic_tiles = mosaic_tiles;
        }

        if let Some(overlap) = self.overlap {
            config.grid.overlap = overlap;
        }

        if let Some(ref endpoint) = self.detection_endpoint {
            config.detection.endpoint.clone_from(endpoint);
        }

        if let Some(ref path) = self.mbtiles {
            config.fetch.providers.insert(
                0,
                ProviderConfig::Mbtiles {
                    name: "cli".to_string(),
                    path: path.clone(),
                },
            );
        }

        if let Some(concurrency) = self.concurrency {
            config.job.concurrency = Some(concurrency);
        }

        if let Some(footprint) = self.footprint {
            config.georef.footprint_sq_meters = footprint;
        }

        if self.no_merge {
            config.reconcile = MergeStrategy::Disabled;
        } else if self.max_distance.is_some() || self.iou_threshold.is_some() {
            let MergeStrategy::Greedy {
                max_distance_meters,
                iou_threshold,
            } = config.reconcile
            else {
                config.reconcile = MergeStrategy::Greedy {
                    max_distance_meters: self.max_distance.unwrap_or(50.0),
                    iou_threshold: self.iou_threshold.unwrap_or(0.1),
                };

                return;
            };

            config.reconcile = MergeStrategy::Greedy {
                max_distance_meters: self.max_distance.unwrap_or(max_distance_meters),
                iou_threshold: self.iou_threshold.unwrap_or(iou_threshold),
            };
        }
    }

    pub fn request(&self) -> JobRequest {
        let area = match (self.center, self.bbox) {
            (_, Some(bounds)) => AreaSpec::Bounds { bounds },
            (Some(LatLng(center)), None) => AreaSpec::Center {
                center,
                grid: self.grid.0,
            },
            (None, None) => unreachable!("clap requires one of --center and --bbox"),
        };

        JobRequest {
            area,
            confidence_threshold: self.confidence_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatLng(pub GeoPoint);

impl FromStr for LatLng {
    type Err = String;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let Some((lat, lng)) = string.split_once(',') else {
            return Err(format!("expected lat,lng, got {string:?}"));
        };

        let parse = |value: &str| value.trim().parse::<f64>().map_err(|err| err.to_string());

        GeoPoint::new(parse(lat)?, parse(lng)?)
            .map(Self)
            .map_err(|err| err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Grid(pub GridShape);

impl FromStr for Grid {
    type Err = String;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let Some((cols, rows)) = string.split_once(['x', 'X']) else {
            return Err(format!("expected COLSxROWS, got {string:?}"));
        };

        let parse = |value: &str| value.trim().parse::<u32>().map_err(|err| err.to_string());

        Ok(Self(GridShape::new(parse(cols)?, parse(rows)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_center_and_grid() {
        let options = Options::parse_from([
            "parkgrid",
            "--center",
            "52.09,5.12",
            "--grid",
            "4x2",
            "--iou-threshold",
            "0.3",
        ]);

        assert_eq!(
            options.request().area,
            AreaSpec::Center {
                center: GeoPoint::new(52.09, 5.12).unwrap(),
                grid: GridShape::new(4, 2)
            }
        );

        let mut config = Config::default();

        options.apply(&mut config);

        assert_eq!(
            config.reconcile,
            MergeStrategy::Greedy {
                max_distance_meters: 50.0,
                iou_threshold: 0.3
            }
        );
    }

    #[test]
    fn area_is_required() {
        assert!(Options::try_parse_from(["parkgrid"]).is_err());
        assert!(Options::try_parse_from(["parkgrid", "--center", "95,5"]).is_err());
        assert!(Options::try_parse_from(["parkgrid", "--bbox", "5.0,52.0,5.1,52.1", "--center", "52,5"]).is_err());
    }
}
