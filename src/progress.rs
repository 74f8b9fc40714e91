use crate::grid::AnalysisBlock;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// waiting in the queue
    Queued,
    /// taken by a worker, tiles being fetched
    Fetching,
    /// mosaic sent to the detector
    Detecting,
    Finished,
    Failed,
}

/// Work queue of one job plus per-block lifecycle bookkeeping.
pub struct Progress {
    queue: VecDeque<AnalysisBlock>,
    states: HashMap<usize, BlockState>,
    last_log: Instant,
    done_count: usize,
    failed_count: usize,
}

impl Progress {
    pub fn new(blocks: Vec<AnalysisBlock>) -> Self {
        let states = blocks
            .iter()
            .map(|block| (block.index, BlockState::Queued))
            .collect();

        Self {
            queue: blocks.into(),
            states,
            last_log: Instant::now(),
            done_count: 0,
            failed_count: 0,
        }
    }

    pub fn next(&mut self) -> Option<AnalysisBlock> {
        let block = self.queue.pop_front()?;

        self.states.insert(block.index, BlockState::Fetching);

        Some(block)
    }

    pub fn detecting(&mut self, index: usize) {
        self.states.insert(index, BlockState::Detecting);
    }

    pub fn done(&mut self, index: usize, failed: bool) {
        let previous = self.states.insert(
            index,
            if failed {
                BlockState::Failed
            } else {
                BlockState::Finished
            },
        );

        if matches!(previous, Some(BlockState::Finished | BlockState::Failed)) {
            return;
        }

        self.done_count += 1;

        if failed {
            self.failed_count += 1;
        }

        let now = Instant::now();

        if now.duration_since(self.last_log) > Duration::from_millis(1000) {
            self.last_log = now;

            self.print_stats();
        }
    }

    /// Drops blocks nobody has started yet.
    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.queue.len();

        self.queue.clear();

        dropped
    }

    pub fn state(&self, index: usize) -> Option<BlockState> {
        self.states.get(&index).copied()
    }

    pub fn total(&self) -> usize {
        self.states.len()
    }

    pub fn done_count(&self) -> usize {
        self.done_count
    }

    pub fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|state| matches!(state, BlockState::Fetching | BlockState::Detecting))
            .count()
    }

    /// Completed share in percent, 100 for an empty job.
    pub fn percent(&self) -> f64 {
        if self.states.is_empty() {
            return 100.0;
        }

        (self.done_count() * 10_000 / self.total()) as f64 / 100.0
    }

    pub fn print_stats(&self) {
        info!(
            "{}% ({}/{} done, {} failed, {} in flight, {} queued)",
            self.percent(),
            self.done_count(),
            self.total(),
            self.failed_count,
            self.in_flight(),
            self.queue.len()
        );
    }
}
