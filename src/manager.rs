//! In-process job control: start, observe and cancel jobs by id.

use crate::{
    error::JobError,
    job::{JobEvent, JobHandle, JobId, JobRequest, JobSnapshot, Orchestrator},
};
use futures::{Stream, stream};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// Cancellation was signalled; the job will end as cancelled.
    Cancelling,
    /// The job had already reached a terminal state; nothing changed.
    AlreadyFinished,
}

struct Entry {
    status: watch::Receiver<JobSnapshot>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    /// First time the job was seen in a terminal state
    finished_at: Option<Instant>,
}

/// Finished jobs are dropped once their events were streamed to the end, or
/// `retention` after they finished, whichever comes first.
pub struct JobManager {
    orchestrator: Orchestrator,
    retention: Duration,
    jobs: Mutex<HashMap<JobId, Entry>>,
}

impl JobManager {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            retention: orchestrator.config().retention(),
            orchestrator,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called from within a tokio runtime.
    pub fn start_job(&self, request: JobRequest) -> JobId {
        self.prune();

        let JobHandle {
            id,
            events,
            status,
            cancel,
        } = self.orchestrator.start(request);

        info!("Started job {id}");

        self.jobs().insert(
            id,
            Entry {
                status,
                cancel,
                events: Some(events),
                finished_at: None,
            },
        );

        id
    }

    /// Idempotent. Unknown ids are an error, finished jobs are not.
    pub fn cancel_job(&self, id: JobId) -> Result<CancelAck, JobError> {
        let jobs = self.jobs();

        let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;

        if entry.status.borrow().status.is_terminal() {
            return Ok(CancelAck::AlreadyFinished);
        }

        entry.cancel.cancel();

        Ok(CancelAck::Cancelling)
    }

    /// The event stream of a job. It can be taken once.
    pub fn take_events(&self, id: JobId) -> Result<mpsc::UnboundedReceiver<JobEvent>, JobError> {
        self.jobs()
            .get_mut(&id)
            .ok_or(JobError::NotFound(id))?
            .events
            .take()
            .ok_or(JobError::EventsTaken(id))
    }

    pub fn status(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.status.borrow().clone())
            .ok_or(JobError::NotFound(id))
    }

    /// Watch channel of a job's snapshots.
    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<JobSnapshot>, JobError> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.status.clone())
            .ok_or(JobError::NotFound(id))
    }

    /// Drops a job's record, cancelling it if it is still running.
    pub fn forget(&self, id: JobId) -> Result<(), JobError> {
        let entry = self.jobs().remove(&id).ok_or(JobError::NotFound(id))?;

        entry.cancel.cancel();

        Ok(())
    }

    /// Event stream of a job that drops the job's record after the terminal
    /// event.
    pub fn stream_events(
        self: &Arc<Self>,
        id: JobId,
    ) -> Result<impl Stream<Item = JobEvent> + Send + 'static, JobError> {
        let events = self.take_events(id)?;

        let manager = Arc::clone(self);

        Ok(stream::unfold(Some(events), move |events| {
            let manager = Arc::clone(&manager);

            async move {
                let mut events = events?;

                let event = events.recv().await?;

                if event.is_terminal() {
                    debug!("job {id}: result consumed");

                    let _ = manager.forget(id);

                    return Some((event, None));
                }

                Some((event, Some(events)))
            }
        }))
    }

    /// Drops finished jobs older than the retention period.
    pub fn prune(&self) -> usize {
        let now = Instant::now();

        let mut jobs = self.jobs();

        let before = jobs.len();

        jobs.retain(|id, entry| {
            if !entry.status.borrow().status.is_terminal() {
                return true;
            }

            let finished_at = *entry.finished_at.get_or_insert(now);

            let keep = now.duration_since(finished_at) < self.retention;

            if !keep {
                debug!("job {id}: expired");
            }

            keep
        });

        before - jobs.len()
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.prune();

        let mut snapshots: Vec<_> = self
            .jobs()
            .values()
            .map(|entry| entry.status.borrow().clone())
            .collect();

        snapshots.sort_by_key(|snapshot| snapshot.id);

        snapshots
    }
}
