//! One analysis run: plan, fetch and detect every block on a worker pool,
//! reconcile, report.
//!
//! The orchestrator task is the only owner of the [`Job`] record and the only
//! producer of [`JobEvent`]s, so a consumer sees events in exactly the order
//! they were produced. Workers talk back over a channel.

use crate::{
    config::Config,
    coords::{GeoBounds, GeoPoint},
    detection::{DetectionRequest, Detector, HttpDetector},
    error::{ConfigurationError, DetectionError},
    fetch::{BlockFetcher, BlockImage, MosaicQuality},
    georef::{GeoDetection, Georeferencer},
    grid::{AnalysisBlock, GridShape, plan_around, plan_covering, plan_covering_polygon},
    progress::{BlockState, Progress},
    providers::build_providers,
    reconcile::{OccupancyStats, ParkingSpace, Reconciler, Reconciliation},
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    panic::AssertUnwindSafe,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinSet, spawn_blocking},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Planning,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// What to analyze.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AreaSpec {
    /// `grid` blocks around a point
    Center { center: GeoPoint, grid: GridShape },
    /// Enough blocks to cover a rectangle
    Bounds { bounds: GeoBounds },
    /// Enough blocks to cover the bounding box of a boundary polygon
    Boundary { points: Vec<GeoPoint> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub area: AreaSpec,
    /// Falls back to the configured threshold
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

/// Mutable state of a run. Owned by the orchestrator task alone.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub blocks: Vec<AnalysisBlock>,
    /// Every processed block, failed or not
    pub completed_blocks: BTreeSet<usize>,
    pub failed_blocks: BTreeSet<usize>,
    pub cancel_requested: bool,
}

impl Job {
    fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Idle,
            blocks: Vec::new(),
            completed_blocks: BTreeSet::new(),
            failed_blocks: BTreeSet::new(),
            cancel_requested: false,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.blocks.is_empty() {
            100.0
        } else {
            self.completed_blocks.len() as f64 * 100.0 / self.blocks.len() as f64
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            total_blocks: self.blocks.len(),
            completed_blocks: self.completed_blocks.len(),
            failed_blocks: self.failed_blocks.iter().copied().collect(),
        }
    }
}

/// Read-only view of a job published after every change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub total_blocks: usize,
    pub completed_blocks: usize,
    pub failed_blocks: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub spaces: Vec<ParkingSpace>,
    pub total_spaces: usize,
    pub total_vehicles_detected: u64,
    pub total_estimated_capacity: u64,
    pub failed_block_indices: Vec<usize>,
    /// Blocks whose mosaic contains placeholder tiles
    pub degraded_block_indices: Vec<usize>,
    pub dropped_detections: usize,
    pub occupancy: OccupancyStats,
}

impl JobResult {
    pub fn new(reconciliation: Reconciliation, failed: &BTreeSet<usize>, degraded: &BTreeSet<usize>) -> Self {
        let spaces = reconciliation.spaces;

        Self {
            total_spaces: spaces.len(),
            total_vehicles_detected: spaces.iter().map(|s| u64::from(s.vehicle_count)).sum(),
            total_estimated_capacity: spaces.iter().map(|s| u64::from(s.estimated_capacity)).sum(),
            failed_block_indices: failed.iter().copied().collect(),
            degraded_block_indices: degraded.iter().copied().collect(),
            dropped_detections: reconciliation.dropped,
            occupancy: OccupancyStats::of_spaces(&spaces),
            spaces,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Log {
        message: String,
    },
    Progress {
        /// Percent of processed blocks
        value: f64,
        completed: usize,
        total: usize,
    },
    Error {
        message: String,
    },
    FinalResult {
        data: JobResult,
    },
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalResult { .. } | Self::Cancelled | Self::Error { .. })
    }
}

/// Caller side of a started job.
pub struct JobHandle {
    pub id: JobId,
    pub events: mpsc::UnboundedReceiver<JobEvent>,
    pub status: watch::Receiver<JobSnapshot>,
    pub cancel: CancellationToken,
}

impl JobHandle {
    /// Safe to call any number of times, also after the job finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().status
    }
}

/// Shared, read-only collaborators. Cheap to clone; every job gets its own
/// state.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    fetcher: Arc<BlockFetcher>,
    detector: Arc<dyn Detector>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, fetcher: Arc<BlockFetcher>, detector: Arc<dyn Detector>) -> Self {
        Self {
            config,
            fetcher,
            detector,
        }
    }

    /// HTTP detector and providers as configured.
    pub fn from_config(config: Config) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let client = config.http_client()?;

        let providers = build_providers(&config.fetch.providers, &client)?;

        let fetcher = BlockFetcher::new(providers, config.fetch_policy()?);

        let detector = HttpDetector::new(
            config.detection.endpoint.clone(),
            client,
            config.detection_timeout(),
        );

        Ok(Self::new(Arc::new(config), Arc::new(fetcher), Arc::new(detector)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns the job on the current tokio runtime.
    pub fn start(&self, request: JobRequest) -> JobHandle {
        let id = JobId::new();

        let (events_tx, events) = mpsc::unbounded_channel();

        let (status_tx, status) = watch::channel(Job::new(id).snapshot());

        let status_tx = Arc::new(status_tx);

        let cancel = CancellationToken::new();

        let run = JobRun {
            job: Job::new(id),
            orchestrator: self.clone(),
            events: events_tx.clone(),
            status: Arc::clone(&status_tx),
            cancel: cancel.clone(),
        };

        tokio::spawn(supervise(id, events_tx, status_tx, run.run(request)));

        JobHandle {
            id,
            events,
            status,
            cancel,
        }
    }

    fn plan(&self, request: &JobRequest) -> Result<Vec<AnalysisBlock>, ConfigurationError> {
        let params = self.config.grid_params();

        match &request.area {
            AreaSpec::Center { center, grid } => plan_around(center, *grid, &params),
            AreaSpec::Bounds { bounds } => {
                let bounds = GeoBounds::new(bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng)?;

                plan_covering(&bounds, &params)
            }
            AreaSpec::Boundary { points } => plan_covering_polygon(points, &params),
        }
    }

    fn confidence_threshold(&self, request: &JobRequest) -> Result<f64, ConfigurationError> {
        let value = request
            .confidence_threshold
            .unwrap_or(self.config.detection.confidence_threshold);

        if (0.0..=1.0).contains(&value) {
            Ok(value)
        } else {
            Err(ConfigurationError::OutOfRange {
                name: "confidence_threshold",
                value,
                min: 0.0,
                max: 1.0,
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a job body. A panic is turned into an `error` event and the `Failed`
/// status, so consumers always see the job end.
async fn supervise(
    id: JobId,
    events: mpsc::UnboundedSender<JobEvent>,
    status: Arc<watch::Sender<JobSnapshot>>,
    body: impl Future<Output = ()>,
) {
    if let Err(panic) = AssertUnwindSafe(body).catch_unwind().await {
        let message = format!("Job aborted: {}", panic_message(panic.as_ref()));

        error!("job {id}: {message}");

        let _ = events.send(JobEvent::Error { message });

        status.send_modify(|snapshot| snapshot.status = JobStatus::Failed);
    }
}

fn lock(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BlockReport {
    index: usize,
    quality: MosaicQuality,
    outcome: Result<Vec<GeoDetection>, DetectionError>,
}

struct WorkerContext {
    fetcher: Arc<BlockFetcher>,
    detector: Arc<dyn Detector>,
    georeferencer: Georeferencer,
    jpeg_quality: u8,
    detection_timeout: Duration,
    confidence_threshold: f64,
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<BlockReport>,
}

async fn detect_block(
    ctx: &WorkerContext,
    block: &AnalysisBlock,
    image: BlockImage,
) -> Result<Vec<GeoDetection>, DetectionError> {
    let bounds = block.bounds;

    let jpeg_quality = ctx.jpeg_quality;

    let request =
        spawn_blocking(move || DetectionRequest::from_block_image(&image, bounds, jpeg_quality)).await??;

    let (width, height) = (request.width, request.height);

    lock(&ctx.progress).detecting(block.index);

    let response = timeout(
        ctx.detection_timeout,
        ctx.detector.detect(vec![request], ctx.confidence_threshold),
    )
    .await
    .map_err(|_| DetectionError::Timeout(ctx.detection_timeout))??;

    let detections = response
        .into_iter()
        .filter(|block_detections| block_detections.block_index == block.index)
        .flat_map(|block_detections| block_detections.detections)
        .collect::<Vec<_>>();

    debug!("block {}: {} raw detections", block.index, detections.len());

    let georeferencer = ctx.georeferencer;

    Ok(spawn_blocking(move || georeferencer.georeference_block(&bounds, width, height, detections)).await?)
}

async fn process_block(ctx: &WorkerContext, block: &AnalysisBlock) -> BlockReport {
    let image = ctx.fetcher.fetch_block(block).await;

    let quality = image.quality.clone();

    let outcome = AssertUnwindSafe(detect_block(ctx, block, image))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(DetectionError::Panicked(panic_message(panic.as_ref()))));

    BlockReport {
        index: block.index,
        quality,
        outcome,
    }
}

async fn worker(ctx: Arc<WorkerContext>) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let Some(block) = lock(&ctx.progress).next() else {
            break;
        };

        let report = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            report = process_block(&ctx, &block) => report,
        };

        if ctx.reports.send(report).is_err() {
            break;
        }
    }
}

struct JobRun {
    job: Job,
    orchestrator: Orchestrator,
    events: mpsc::UnboundedSender<JobEvent>,
    status: Arc<watch::Sender<JobSnapshot>>,
    cancel: CancellationToken,
}

impl JobRun {
    fn emit(&self, event: JobEvent) {
        match &event {
            JobEvent::Log { message } => info!("job {}: {message}", self.job.id),
            JobEvent::Error { message } => error!("job {}: {message}", self.job.id),
            JobEvent::Cancelled => info!("job {}: cancelled", self.job.id),
            _ => {}
        }

        // consumer may be gone; the job still runs to a terminal state
        let _ = self.events.send(event);
    }

    fn log(&self, message: impl Into<String>) {
        self.emit(JobEvent::Log {
            message: message.into(),
        });
    }

    fn set_status(&mut self, status: JobStatus) {
        debug!("job {}: {:?} -> {status:?}", self.job.id, self.job.status);

        self.job.status = status;

        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.job.snapshot());
    }

    fn fail(&mut self, message: String) {
        self.emit(JobEvent::Error { message });

        self.set_status(JobStatus::Failed);
    }

    fn finish_cancelled(&mut self) {
        self.job.cancel_requested = true;

        self.emit(JobEvent::Cancelled);

        self.set_status(JobStatus::Cancelled);
    }

    fn emit_progress(&self) {
        self.emit(JobEvent::Progress {
            value: self.job.progress_percent(),
            completed: self.job.completed_blocks.len(),
            total: self.job.blocks.len(),
        });
    }

    async fn run(mut self, request: JobRequest) {
        self.set_status(JobStatus::Planning);

        let planned = self
            .orchestrator
            .confidence_threshold(&request)
            .and_then(|threshold| Ok((threshold, self.orchestrator.plan(&request)?)));

        let (confidence_threshold, blocks) = match planned {
            Ok(planned) => planned,
            Err(err) => {
                self.fail(format!("Planning failed: {err}"));

                return;
            }
        };

        self.job.blocks = blocks;

        self.publish();

        self.log(format!("Grid generated: {} blocks", self.job.blocks.len()));

        if self.cancel.is_cancelled() {
            self.finish_cancelled();

            return;
        }

        self.set_status(JobStatus::Running);

        if self.job.blocks.is_empty() {
            self.complete(Vec::new(), BTreeSet::new()).await;

            return;
        }

        let config = &self.orchestrator.config;

        let concurrency = config.concurrency().min(self.job.blocks.len()).max(1);

        let progress = Arc::new(Mutex::new(Progress::new(self.job.blocks.clone())));

        let (reports_tx, mut reports) = mpsc::unbounded_channel();

        let ctx = Arc::new(WorkerContext {
            fetcher: Arc::clone(&self.orchestrator.fetcher),
            detector: Arc::clone(&self.orchestrator.detector),
            georeferencer: config.georeferencer(),
            jpeg_quality: config.detection.jpeg_quality,
            detection_timeout: config.detection_timeout(),
            confidence_threshold,
            progress: Arc::clone(&progress),
            cancel: self.cancel.child_token(),
            reports: reports_tx,
        });

        let cancel_grace = config.cancel_grace();

        self.log(format!(
            "Fetching and detecting {} blocks with {concurrency} workers",
            self.job.blocks.len()
        ));

        let mut workers = JoinSet::new();

        for _ in 0..concurrency {
            workers.spawn(worker(Arc::clone(&ctx)));
        }

        // workers hold the only senders from here on
        drop(ctx);

        let mut detections = Vec::new();

        let mut degraded = BTreeSet::new();

        let mut all_placeholder = 0;

        let cancelled = loop {
            let report = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break true,
                report = reports.recv() => report,
            };

            let Some(report) = report else {
                break false;
            };

            let index = report.index;

            if !report.quality.is_complete() {
                degraded.insert(index);

                if report.quality.is_all_placeholder() {
                    all_placeholder += 1;
                }

                self.log(format!(
                    "Block {index}: {} of {} tiles unavailable",
                    report.quality.placeholder_tiles.len(),
                    report.quality.total_tiles
                ));
            }

            self.job.completed_blocks.insert(index);

            let failed = match report.outcome {
                Ok(block_detections) => {
                    debug!("block {index}: {} detections", block_detections.len());

                    detections.extend(block_detections);

                    false
                }
                Err(err) => {
                    warn!("job {}: block {index} failed: {err}", self.job.id);

                    self.job.failed_blocks.insert(index);

                    self.log(format!("Block {index} failed: {err}"));

                    true
                }
            };

            lock(&progress).done(index, failed);

            self.publish();

            self.emit_progress();
        };

        if cancelled {
            self.job.cancel_requested = true;

            let abandoned = lock(&progress).clear_queue();

            debug!("job {}: {abandoned} blocks never started", self.job.id);

            if timeout(cancel_grace, async { while workers.join_next().await.is_some() {} })
                .await
                .is_err()
            {
                warn!("job {}: workers did not stop within {cancel_grace:?}, aborting", self.job.id);

                workers.abort_all();
            }

            self.finish_cancelled();

            return;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!("job {}: worker ended abnormally: {err}", self.job.id);
            }
        }

        // blocks lost with a crashed worker, or never picked up after all
        // workers crashed
        let unreported: Vec<usize> = {
            let progress = lock(&progress);

            self.job
                .blocks
                .iter()
                .map(|block| block.index)
                .filter(|&index| {
                    !matches!(progress.state(index), Some(BlockState::Finished | BlockState::Failed))
                })
                .collect()
        };

        for &index in &unreported {
            self.job.completed_blocks.insert(index);

            self.job.failed_blocks.insert(index);

            lock(&progress).done(index, true);

            self.log(format!("Block {index} failed: worker stopped before reporting"));
        }

        if !unreported.is_empty() {
            self.publish();

            self.emit_progress();
        }

        lock(&progress).print_stats();

        let total = self.job.blocks.len();

        if self.job.failed_blocks.len() == total {
            self.fail(format!("Detection failed for all {total} blocks"));

            return;
        }

        if all_placeholder == total {
            self.fail(format!("No imagery available for any of the {total} blocks"));

            return;
        }

        self.complete(detections, degraded).await;
    }

    async fn complete(&mut self, detections: Vec<GeoDetection>, degraded: BTreeSet<usize>) {
        self.log(format!("Reconciling {} detections", detections.len()));

        let reconciler = Reconciler::new(self.orchestrator.config.reconcile);

        let reconciliation = match spawn_blocking(move || reconciler.reconcile(detections)).await {
            Ok(reconciliation) => reconciliation,
            Err(err) => {
                self.fail(format!("Reconciliation failed: {err}"));

                return;
            }
        };

        let result = JobResult::new(reconciliation, &self.job.failed_blocks, &degraded);

        self.log(format!(
            "Found {} parking spaces with {} vehicles",
            result.total_spaces, result.total_vehicles_detected
        ));

        self.emit(JobEvent::Progress {
            value: 100.0,
            completed: self.job.completed_blocks.len(),
            total: self.job.blocks.len(),
        });

        self.emit(JobEvent::FinalResult { data: result });

        self.set_status(JobStatus::Completed);
    }
}
