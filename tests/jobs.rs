mod common;

use common::*;
use futures::future::BoxFuture;
use parkgrid::{
    coords::{GeoBounds, TileIndex},
    error::{DetectionError, ProviderError},
    export::to_geojson,
    grid::{GridShape, plan_around},
    job::{AreaSpec, JobEvent, JobRequest, JobResult, JobStatus},
    providers::TileProvider,
    reconcile::SpaceStatus,
};
use std::sync::{Arc, atomic::Ordering};

fn around_utrecht(cols: u32, rows: u32) -> JobRequest {
    JobRequest {
        area: AreaSpec::Center {
            center: utrecht(),
            grid: GridShape::new(cols, rows),
        },
        confidence_threshold: None,
    }
}

fn final_result(events: &[JobEvent]) -> &JobResult {
    match events.last() {
        Some(JobEvent::FinalResult { data }) => data,
        other => panic!("expected a final result, got {other:?}"),
    }
}

#[tokio::test]
async fn overlapping_detections_become_one_space() {
    let detector = ScriptedDetector::new(|_, request| {
        assert_eq!((request.width, request.height), (4 * TILE_SIZE, 4 * TILE_SIZE));

        Some(Ok(vec![
            obb(request.block_index, (40.0, 100.0, 140.0, 140.0), 0.8, 1),
            obb(request.block_index, (80.0, 100.0, 180.0, 140.0), 0.9, 2),
        ]))
    });

    let orchestrator = orchestrator(test_config(), Arc::new(MockProvider::solid()), Arc::new(detector));

    let mut handle = orchestrator.start(around_utrecht(1, 1));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Completed);

    let result = final_result(&events);

    assert_eq!(result.total_spaces, 1);
    assert!(result.failed_block_indices.is_empty());
    assert!(result.degraded_block_indices.is_empty());

    let space = &result.spaces[0];

    assert_eq!(space.id, 1);
    assert_eq!(space.status, SpaceStatus::Occupied);
    assert_eq!(space.vehicle_count, 2);
    assert_eq!(space.confidence, 0.9);
    assert_eq!(space.merged_count, 2);
    assert_eq!(space.geo_polygon.first(), space.geo_polygon.last());

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Progress { value, .. } => Some(*value),
            _ => None,
        })
        .collect();

    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last(), Some(&100.0));

    let geojson = to_geojson(&result.spaces);

    assert_eq!(geojson["features"][0]["properties"]["vehicleCount"], 2);
}

#[tokio::test]
async fn failed_block_is_reported_and_job_completes() {
    let mut config = test_config();

    config.grid.overlap = 0.0;

    let blocks = plan_around(&utrecht(), GridShape::new(2, 1), &config.grid_params()).unwrap();

    let east_edge = blocks[1].origin.x;

    // no imagery for the western block, and its detection fails
    let provider = MockProvider::failing_when(move |tile| tile.x < east_edge);

    let detector = ScriptedDetector::new(|_, request| {
        if request.block_index == 0 {
            Some(Err(DetectionError::Status(500)))
        } else {
            Some(Ok(vec![obb(request.block_index, (10.0, 10.0, 60.0, 30.0), 0.7, 0)]))
        }
    });

    let orchestrator = orchestrator(config, Arc::new(provider), Arc::new(detector));

    let mut handle = orchestrator.start(around_utrecht(2, 1));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Completed);

    let result = final_result(&events);

    assert_eq!(result.failed_block_indices, vec![0]);
    assert_eq!(result.degraded_block_indices, vec![0]);
    assert_eq!(result.total_spaces, 1);
    assert_eq!(result.spaces[0].status, SpaceStatus::Empty);
    assert_eq!(result.spaces[0].source_block_indices.iter().copied().collect::<Vec<_>>(), vec![1]);

    let snapshot = handle.status.borrow().clone();

    assert_eq!(snapshot.completed_blocks, 2);
    assert_eq!(snapshot.failed_blocks, vec![0]);
}

#[tokio::test]
async fn every_block_failing_fails_the_job() {
    let detector = ScriptedDetector::new(|_, _| Some(Err(DetectionError::Status(502))));

    let orchestrator = orchestrator(test_config(), Arc::new(MockProvider::solid()), Arc::new(detector));

    let mut handle = orchestrator.start(around_utrecht(2, 2));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Failed);
    assert!(matches!(events.last(), Some(JobEvent::Error { .. })));
    assert!(!events.iter().any(|event| matches!(event, JobEvent::FinalResult { .. })));
}

#[tokio::test]
async fn no_imagery_anywhere_fails_the_job() {
    let provider = Arc::new(MockProvider::failing_when(|_| true));

    let detector = Arc::new(ScriptedDetector::empty());

    let orchestrator = orchestrator(test_config(), provider.clone(), detector.clone());

    let mut handle = orchestrator.start(around_utrecht(1, 1));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Failed);
    assert!(matches!(events.last(), Some(JobEvent::Error { message }) if message.contains("imagery")));

    // placeholder mosaic still went to the detector
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 16);
}

#[tokio::test]
async fn empty_grid_completes_without_spaces() {
    let detector = Arc::new(ScriptedDetector::empty());

    let orchestrator = orchestrator(test_config(), Arc::new(MockProvider::solid()), detector.clone());

    let mut handle = orchestrator.start(around_utrecht(0, 0));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Completed);
    assert_eq!(final_result(&events).total_spaces, 0);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_request_fails_during_planning() {
    let orchestrator = orchestrator(
        test_config(),
        Arc::new(MockProvider::solid()),
        Arc::new(ScriptedDetector::empty()),
    );

    let mut handle = orchestrator.start(JobRequest {
        confidence_threshold: Some(1.5),
        ..around_utrecht(1, 1)
    });

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Failed);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], JobEvent::Error { message } if message.starts_with("Planning failed")));
}

#[tokio::test]
async fn polar_area_too_large_for_the_limit_fails_during_planning() {
    let mut config = test_config();

    config.grid.max_blocks = 100;

    let detector = Arc::new(ScriptedDetector::empty());

    let orchestrator = orchestrator(config, Arc::new(MockProvider::solid()), detector.clone());

    let mut handle = orchestrator.start(JobRequest {
        area: AreaSpec::Bounds {
            bounds: GeoBounds::new(89.0, 90.0, 0.0, 1.0).unwrap(),
        },
        confidence_threshold: None,
    });

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Failed);
    assert!(matches!(events.last(), Some(JobEvent::Error { message }) if message.contains("exceeds the limit")));
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panicking_detector_fails_only_its_block() {
    let detector = ScriptedDetector::new(|_, request| {
        if request.block_index == 1 {
            panic!("model crashed");
        }

        Some(Ok(vec![obb(request.block_index, (10.0, 10.0, 60.0, 30.0), 0.6, 1)]))
    });

    let mut config = test_config();

    config.job.concurrency = Some(1);

    let orchestrator = orchestrator(config, Arc::new(MockProvider::solid()), Arc::new(detector));

    let mut handle = orchestrator.start(around_utrecht(3, 1));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Completed);

    let result = final_result(&events);

    assert_eq!(result.failed_block_indices, vec![1]);
    assert!(events.iter().any(|event| matches!(
        event,
        JobEvent::Log { message } if message.contains("detection panicked: model crashed")
    )));
}

/// Panics while serving tiles west of `east_edge`.
struct PanickingProvider {
    east_edge: u32,
    tile: Vec<u8>,
}

impl TileProvider for PanickingProvider {
    fn name(&self) -> &str {
        "panicking"
    }

    fn fetch(&self, tile: TileIndex) -> BoxFuture<'_, Result<Vec<u8>, ProviderError>> {
        Box::pin(async move {
            if tile.x < self.east_edge {
                panic!("tile store corrupted");
            }

            Ok(self.tile.clone())
        })
    }
}

#[tokio::test]
async fn block_lost_with_a_crashed_worker_is_reported_failed() {
    let mut config = test_config();

    config.grid.overlap = 0.0;

    let blocks = plan_around(&utrecht(), GridShape::new(2, 1), &config.grid_params()).unwrap();

    let provider = PanickingProvider {
        east_edge: blocks[1].origin.x,
        tile: png_tile(TILE_SIZE, image::Rgb([90, 90, 100])),
    };

    let detector = ScriptedDetector::new(|_, request| {
        Some(Ok(vec![obb(request.block_index, (10.0, 10.0, 60.0, 30.0), 0.6, 1)]))
    });

    let orchestrator = orchestrator(config, Arc::new(provider), Arc::new(detector));

    let mut handle = orchestrator.start(around_utrecht(2, 1));

    let events = drain(&mut handle.events).await;

    assert_eq!(handle.status(), JobStatus::Completed);

    let result = final_result(&events);

    assert_eq!(result.failed_block_indices, vec![0]);
    assert_eq!(result.total_spaces, 1);

    let snapshot = handle.status.borrow().clone();

    assert_eq!(snapshot.completed_blocks, 2);
}
