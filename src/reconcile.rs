//! Cross-block deduplication of georeferenced detections.
//!
//! Overlapping blocks see the same parked car more than once. Detections are
//! visited in a fixed order (confidence first) and each one joins the existing
//! cluster it overlaps best, or seeds a new one. Because the visiting order is
//! a total order over the detections themselves, the result does not depend on
//! the order blocks finished in.

use crate::{
    coords::{GeoPoint, distance_meters},
    georef::GeoDetection,
    polygon::{close_ring, geo_centroid, iou, open_ring, validate_ring},
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeSet};
use tracing::{debug, warn};

fn default_max_distance_meters() -> f64 {
    50.0
}

fn default_iou_threshold() -> f64 {
    0.1
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Merge when centroids are close AND polygons overlap enough.
    Greedy {
        #[serde(default = "default_max_distance_meters")]
        max_distance_meters: f64,
        #[serde(default = "default_iou_threshold")]
        iou_threshold: f64,
    },
    /// Every detection becomes its own space.
    Disabled,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::Greedy {
            max_distance_meters: default_max_distance_meters(),
            iou_threshold: default_iou_threshold(),
        }
    }
}

impl MergeStrategy {
    pub fn accepts(&self, distance_meters: f64, iou: f64) -> bool {
        match *self {
            Self::Greedy {
                max_distance_meters,
                iou_threshold,
            } => distance_meters <= max_distance_meters && iou >= iou_threshold,
            Self::Disabled => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceStatus {
    Occupied,
    Empty,
}

/// Final deduplicated parking space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkingSpace {
    pub id: u32,
    pub status: SpaceStatus,
    pub confidence: f64,
    pub vehicle_count: u32,
    pub estimated_capacity: u32,
    pub area_sq_meters: f64,
    pub dimensions_meters: (f64, f64),
    pub centroid: GeoPoint,
    /// Closed ring
    pub geo_polygon: Vec<GeoPoint>,
    pub source_block_indices: BTreeSet<usize>,
    pub merged_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyLevel {
    Full,
    Busy,
    Moderate,
    Available,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyStats {
    /// Percent, capped at 100
    pub occupancy_rate: f64,
    pub available_spots: u64,
    pub occupied_spots: u64,
    pub total_capacity: u64,
    pub level: OccupancyLevel,
}

impl OccupancyStats {
    pub fn new(total_capacity: u64, vehicle_count: u64) -> Self {
        if total_capacity == 0 {
            return Self {
                occupancy_rate: 0.0,
                available_spots: 0,
                occupied_spots: vehicle_count,
                total_capacity,
                level: OccupancyLevel::Unknown,
            };
        }

        let rate = (vehicle_count as f64 / total_capacity as f64 * 100.0).min(100.0);

        let level = match rate {
            r if r >= 90.0 => OccupancyLevel::Full,
            r if r >= 70.0 => OccupancyLevel::Busy,
            r if r >= 30.0 => OccupancyLevel::Moderate,
            _ => OccupancyLevel::Available,
        };

        Self {
            occupancy_rate: (rate * 10.0).round() / 10.0,
            available_spots: total_capacity.saturating_sub(vehicle_count),
            occupied_spots: vehicle_count,
            total_capacity,
            level,
        }
    }

    pub fn of_spaces(spaces: &[ParkingSpace]) -> Self {
        Self::new(
            spaces.iter().map(|space| u64::from(space.estimated_capacity)).sum(),
            spaces.iter().map(|space| u64::from(space.vehicle_count)).sum(),
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reconciliation {
    pub spaces: Vec<ParkingSpace>,
    /// Detections dropped for degenerate geometry
    pub dropped: usize,
}

struct Candidate {
    detection: GeoDetection,
    centroid: GeoPoint,
    vertex_sum: f64,
}

fn compare_vertices(a: &[GeoPoint], b: &[GeoPoint]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(p, q)| p.lat.total_cmp(&q.lat).then(p.lng.total_cmp(&q.lng)))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn processing_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.detection
        .confidence
        .total_cmp(&a.detection.confidence)
        .then(a.detection.block_index.cmp(&b.detection.block_index))
        .then(a.vertex_sum.total_cmp(&b.vertex_sum))
        .then_with(|| compare_vertices(&a.detection.geo_polygon, &b.detection.geo_polygon))
        .then(b.detection.vehicle_count.cmp(&a.detection.vehicle_count))
        .then(b.detection.is_occupied.cmp(&a.detection.is_occupied))
}

/// Member indices into the sorted candidates; the first is the representative.
struct Cluster {
    members: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Reconciler {
    pub strategy: MergeStrategy,
}

impl Reconciler {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self { strategy }
    }

    pub fn reconcile(&self, detections: Vec<GeoDetection>) -> Reconciliation {
        let total = detections.len();

        let mut candidates: Vec<Candidate> = detections
            .into_iter()
            .filter_map(|mut detection| {
                if let Err(err) = validate_ring(&detection.geo_polygon) {
                    warn!(
                        "Dropping detection from block {}: {err}",
                        detection.block_index
                    );

                    return None;
                }

                detection.geo_polygon = open_ring(&detection.geo_polygon).to_vec();

                Some(Candidate {
                    centroid: geo_centroid(&detection.geo_polygon),
                    vertex_sum: detection
                        .geo_polygon
                        .iter()
                        .map(|p| p.lat + p.lng)
                        .sum(),
                    detection,
                })
            })
            .collect();

        let dropped = total - candidates.len();

        candidates.sort_by(processing_order);

        let mut clusters: Vec<Cluster> = Vec::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;

            if !matches!(self.strategy, MergeStrategy::Disabled) {
                for (cluster_index, cluster) in clusters.iter().enumerate() {
                    let representative = &candidates[cluster.members[0]];

                    let distance = distance_meters(&representative.centroid, &candidate.centroid);

                    // cheap distance gate before the polygon clipping
                    if !self.strategy.accepts(distance, f64::INFINITY) {
                        continue;
                    }

                    let overlap = iou(
                        &representative.detection.geo_polygon,
                        &candidate.detection.geo_polygon,
                    );

                    if self.strategy.accepts(distance, overlap)
                        && best.is_none_or(|(_, best_overlap)| overlap > best_overlap)
                    {
                        best = Some((cluster_index, overlap));
                    }
                }
            }

            match best {
                Some((cluster_index, _)) => clusters[cluster_index].members.push(index),
                None => clusters.push(Cluster {
                    members: vec![index],
                }),
            }
        }

        debug!(
            "Reconciled {} detections into {} spaces",
            candidates.len(),
            clusters.len()
        );

        let mut spaces: Vec<ParkingSpace> = clusters
            .iter()
            .map(|cluster| {
                let representative = &candidates[cluster.members[0]];

                let members = cluster.members.iter().map(|&i| &candidates[i].detection);

                let vehicle_count = members.clone().map(|d| d.vehicle_count).max().unwrap_or(0);

                let confidence = members
                    .clone()
                    .map(|d| d.confidence)
                    .fold(f64::NEG_INFINITY, f64::max);

                let occupied = members.clone().any(|d| d.is_occupied) || vehicle_count > 0;

                let rep = &representative.detection;

                ParkingSpace {
                    id: 0,
                    status: if occupied {
                        SpaceStatus::Occupied
                    } else {
                        SpaceStatus::Empty
                    },
                    confidence,
                    vehicle_count,
                    estimated_capacity: rep.estimated_capacity,
                    area_sq_meters: rep.area_sq_meters,
                    dimensions_meters: rep.dimensions_meters,
                    centroid: representative.centroid,
                    geo_polygon: close_ring(&rep.geo_polygon),
                    source_block_indices: members.map(|d| d.block_index).collect(),
                    merged_count: cluster.members.len(),
                }
            })
            .collect();

        spaces.sort_by(|a, b| {
            a.centroid
                .lat
                .total_cmp(&b.centroid.lat)
                .then(a.centroid.lng.total_cmp(&b.centroid.lng))
                .then_with(|| compare_vertices(&a.geo_polygon, &b.geo_polygon))
        });

        for (space, id) in spaces.iter_mut().zip(1..) {
            space.id = id;
        }

        Reconciliation { spaces, dropped }
    }
}
