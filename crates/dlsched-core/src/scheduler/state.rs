//! Everything guarded by the scheduler lock.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::autoscale::{Ewma, LoadSample};
use crate::job::{JobId, JobResult, JobSpec, JobState, JobStatus, Priority, UserId};
use crate::queue::FairQueue;
use crate::rate_limit::RateLimiter;

pub(super) struct JobEntry {
    pub(super) spec: JobSpec,
    pub(super) priority: Priority,
    pub(super) platform: String,
    pub(super) state: JobState,
    pub(super) submitted_at: Instant,
    pub(super) finished_at: Option<Instant>,
    pub(super) result: Option<JobResult>,
}

impl JobEntry {
    pub(super) fn status(&self, id: JobId) -> JobStatus {
        JobStatus {
            id,
            user_id: self.spec.user_id,
            priority: self.priority,
            platform: self.platform.clone(),
            size_hint: self.spec.size_hint,
            state: self.state,
            result: self.result.clone(),
        }
    }

    /// Record a terminal state. No-op if already terminal.
    pub(super) fn finish(&mut self, result: JobResult, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = match &result {
            Ok(_) => JobState::Succeeded,
            Err(e) => e.terminal_state(),
        };
        self.result = Some(result);
        self.finished_at = Some(now);
        true
    }
}

#[derive(Debug)]
pub(super) struct WorkerSlot {
    pub(super) busy: bool,
    pub(super) idle_since: Instant,
    pub(super) retiring: bool,
}

/// A job handed from the queue to a worker.
pub(super) struct Claimed {
    pub(super) id: JobId,
    pub(super) user_id: UserId,
    pub(super) spec: JobSpec,
    pub(super) platform: String,
    pub(super) queue_wait: Duration,
    pub(super) isolated: bool,
    pub(super) cancel: CancellationToken,
}

pub(super) struct State {
    pub(super) queue: FairQueue,
    pub(super) limiter: RateLimiter,
    pub(super) jobs: HashMap<JobId, JobEntry>,
    pub(super) workers: BTreeMap<u64, WorkerSlot>,
    pub(super) ewma: Ewma,
    pub(super) next_job_id: JobId,
    pub(super) next_worker_id: u64,
    pub(super) accepting: bool,
    /// Set on shutdown: workers exit once the queue is empty.
    pub(super) draining: bool,
}

impl State {
    pub(super) fn new(queue: FairQueue, limiter: RateLimiter, ewma: Ewma) -> Self {
        Self {
            queue,
            limiter,
            jobs: HashMap::new(),
            workers: BTreeMap::new(),
            ewma,
            next_job_id: 0,
            next_worker_id: 0,
            accepting: true,
            draining: false,
        }
    }

    pub(super) fn active_workers(&self) -> usize {
        self.workers.values().filter(|w| !w.retiring).count()
    }

    pub(super) fn load_sample(&self, now: Instant) -> LoadSample {
        let limiter = &self.limiter;
        let eligible = |u: UserId| limiter.can_start(u);
        let mut idle_since: Vec<(u64, Instant)> = self
            .workers
            .iter()
            .filter(|(_, w)| !w.busy && !w.retiring)
            .map(|(id, w)| (*id, w.idle_since))
            .collect();
        idle_since.sort_by_key(|(_, since)| *since);
        LoadSample {
            active_workers: self.active_workers(),
            busy_workers: self
                .workers
                .values()
                .filter(|w| w.busy && !w.retiring)
                .count(),
            eligible_backlog: self.queue.eligible_len(eligible),
            ewma_wait: self.ewma.get(),
            oldest_wait: self
                .queue
                .oldest_eligible(eligible)
                .map_or(Duration::ZERO, |t| now.saturating_duration_since(t)),
            idle_since,
        }
    }

    /// Drop terminal jobs older than `retention`. Returns how many were removed.
    pub(super) fn prune_finished(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, e| {
            e.finished_at
                .map_or(true, |t| now.saturating_duration_since(t) < retention)
        });
        before - self.jobs.len()
    }
}
