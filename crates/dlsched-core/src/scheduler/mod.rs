//! Job scheduler: admission, fair queueing, autoscaled worker pool.
//!
//! Coordinates the rate limiter, the fair queue, the worker pool and its
//! autoscaler, the isolator, progress and metrics:
//! submit → admit → queue → worker (in-process or isolated) → progress → metrics.
//!
//! All shared state sits behind one `std::sync::Mutex`, held only for short
//! synchronous sections and never across an `.await`.

mod guard;
mod state;
mod tick;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autoscale::{Autoscaler, Ewma, ScalePolicy};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigError, SchedulerConfig};
use crate::control::JobControl;
use crate::error::{CancelError, JobError, SubmitError};
use crate::executor::Executor;
use crate::isolate::{Isolator, IsolatorConfig};
use crate::job::{JobId, JobResult, JobSpec, JobState, JobStatus};
use crate::metrics::{MetricsAggregator, PerfSnapshot, SessionSnapshot};
use crate::progress::{ProgressEvent, ProgressHub, ProgressSubscription};
use crate::queue::FairQueue;
use crate::rate_limit::{Admission, RateLimitPolicy, RateLimiter};

use state::{JobEntry, State, WorkerSlot};

/// Receipt for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub job_id: JobId,
    pub admission: Admission,
    /// 1-based position in dequeue order at submission time.
    pub position: usize,
    pub queue_len: usize,
    pub active_workers: usize,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now `Cancelled`.
    Removed,
    /// The job is running; cancellation was signalled and it will terminate within the grace period.
    Signalled,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSnapshot {
    pub active_workers: usize,
    pub busy_workers: usize,
    pub retiring_workers: usize,
    pub queued: usize,
    pub eligible_backlog: usize,
    pub ewma_wait: Duration,
    pub tracked_users: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

pub(crate) struct Inner {
    cfg: SchedulerConfig,
    clock: SharedClock,
    state: Mutex<State>,
    /// Wakes idle workers (new job, released slot, retirement, shutdown).
    work: Notify,
    executor: Arc<dyn Executor>,
    isolator: Option<Isolator>,
    progress: Arc<ProgressHub>,
    metrics: MetricsAggregator,
    control: JobControl,
    autoscaler: Autoscaler,
    /// Stops the autoscale loop.
    stop: CancellationToken,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a worker slot and spawn its loop. No-op while draining.
    fn spawn_worker(self: &Arc<Self>) -> Option<u64> {
        let worker_id = {
            let mut st = self.lock_state();
            if st.draining {
                return None;
            }
            st.next_worker_id += 1;
            let id = st.next_worker_id;
            st.workers.insert(
                id,
                WorkerSlot {
                    busy: false,
                    idle_since: self.clock.now(),
                    retiring: false,
                },
            );
            id
        };
        let handle = tokio::spawn(worker::worker_loop(Arc::clone(self), worker_id));
        let mut tasks = self.worker_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Some(worker_id)
    }

    /// Cancel every queued job (shutdown). Returns how many were removed.
    fn cancel_queued(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let drained = st.queue.drain();
        for q in &drained {
            st.limiter.withdraw(q.user_id);
            if let Some(entry) = st.jobs.get_mut(&q.id) {
                if entry.finish(Err(JobError::Cancelled), now) {
                    self.progress
                        .finish(q.id, JobState::Cancelled, Err(JobError::Cancelled));
                    self.metrics.record_unstarted(&JobError::Cancelled);
                }
            }
        }
        drained.len()
    }
}

/// Configures and starts a [`Scheduler`].
pub struct SchedulerBuilder {
    cfg: SchedulerConfig,
    executor: Arc<dyn Executor>,
    clock: SharedClock,
    worker_command: Option<(PathBuf, Vec<String>)>,
}

impl SchedulerBuilder {
    /// Clock for rate windows, waits, throttling and autoscale decisions.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Program (and args) that serves one isolated job over stdin/stdout.
    /// Without it, jobs always run in-process regardless of the threshold.
    pub fn isolated_worker(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.worker_command = Some((program.into(), args));
        self
    }

    /// Validate config, spawn `min_workers` workers and the autoscale loop.
    /// Must be called inside a Tokio runtime.
    pub fn start(self) -> Result<Scheduler, ConfigError> {
        let cfg = self.cfg;
        cfg.validate()?;

        let threshold = cfg.subprocess_threshold_bytes();
        let isolator = match (self.worker_command, threshold) {
            (Some((program, args)), threshold) => Some(Isolator::new(IsolatorConfig {
                program,
                args,
                threshold_bytes: threshold,
                timeout: cfg.isolation_timeout(),
                cancel_grace: cfg.cancel_grace(),
            })),
            (None, Some(_)) => {
                tracing::warn!("subprocess threshold set but no isolated worker configured; running in-process");
                None
            }
            (None, None) => None,
        };

        let state = State::new(
            FairQueue::new(cfg.fairness_burst),
            RateLimiter::new(RateLimitPolicy {
                max_running: cfg.user_max_running,
                window_cap: cfg.user_rate_limit,
                window: cfg.user_window(),
            }),
            Ewma::new(cfg.ewma_alpha),
        );
        let autoscaler = Autoscaler::new(ScalePolicy {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_workers,
            scale_up_wait: cfg.scale_up_wait(),
            backlog_per_worker: cfg.backlog_per_worker,
            idle_cooldown: cfg.idle_cooldown(),
        });

        let inner = Arc::new(Inner {
            progress: Arc::new(ProgressHub::new(
                cfg.progress_interval(),
                Arc::clone(&self.clock),
            )),
            metrics: MetricsAggregator::new(cfg.metric_window, Arc::clone(&self.clock)),
            clock: self.clock,
            state: Mutex::new(state),
            work: Notify::new(),
            executor: self.executor,
            isolator,
            control: JobControl::new(),
            autoscaler,
            stop: CancellationToken::new(),
            worker_tasks: Mutex::new(Vec::new()),
            tick_task: Mutex::new(None),
            cfg,
        });

        for _ in 0..inner.cfg.min_workers {
            inner.spawn_worker();
        }
        let tick = tokio::spawn(tick::autoscale_loop(Arc::clone(&inner)));
        *inner.tick_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(tick);

        tracing::info!(
            min_workers = inner.cfg.min_workers,
            max_workers = inner.cfg.max_workers,
            isolation = inner.isolator.is_some(),
            "scheduler started"
        );
        Ok(Scheduler { inner })
    }
}

/// Cheap, cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn builder(cfg: SchedulerConfig, executor: Arc<dyn Executor>) -> SchedulerBuilder {
        SchedulerBuilder {
            cfg,
            executor,
            clock: Arc::new(SystemClock),
            worker_command: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.cfg
    }

    /// Admit and enqueue a job.
    pub fn submit(&self, spec: JobSpec) -> Result<Ticket, SubmitError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let ticket = {
            let mut guard = inner.lock_state();
            let st = &mut *guard;
            if !st.accepting {
                return Err(SubmitError::ShuttingDown);
            }
            if st.queue.len() >= inner.cfg.max_queue_size {
                let position = st.queue.len() + 1;
                tracing::info!(user_id = spec.user_id, position, "submit rejected: queue full");
                return Err(SubmitError::QueueFull { position });
            }
            let admission = match st.limiter.admit(spec.user_id, now) {
                Ok(a) => a,
                Err(e) => {
                    tracing::info!(user_id = spec.user_id, "submit rejected: {}", e);
                    return Err(e);
                }
            };

            st.next_job_id += 1;
            let job_id = st.next_job_id;
            let priority = spec.priority();
            let platform = spec.platform();
            let position = st.queue.push(job_id, spec.user_id, priority, now);
            tracing::info!(
                job_id,
                user_id = spec.user_id,
                priority = priority.as_str(),
                platform = %platform,
                position,
                "job queued"
            );
            st.jobs.insert(
                job_id,
                JobEntry {
                    spec,
                    priority,
                    platform,
                    state: JobState::Queued,
                    submitted_at: now,
                    finished_at: None,
                    result: None,
                },
            );
            inner
                .progress
                .register(job_id, ProgressEvent::Queued { position });
            Ticket {
                job_id,
                admission,
                position,
                queue_len: st.queue.len(),
                active_workers: st.active_workers(),
            }
        };
        inner.work.notify_waiters();
        Ok(ticket)
    }

    /// Cancel a job. Queued jobs are removed synchronously; running jobs are
    /// signalled and reach `Cancelled` within the cancel grace period.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, CancelError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut guard = inner.lock_state();
        let st = &mut *guard;
        let entry = st.jobs.get_mut(&job_id).ok_or(CancelError::NotFound(job_id))?;
        let current = entry.state;
        match current {
            JobState::Queued => {
                let user_id = entry.spec.user_id;
                let queued_ms = now.saturating_duration_since(entry.submitted_at).as_millis() as u64;
                entry.finish(Err(JobError::Cancelled), now);
                st.queue.remove(job_id);
                st.limiter.withdraw(user_id);
                inner
                    .progress
                    .finish(job_id, JobState::Cancelled, Err(JobError::Cancelled));
                inner.metrics.record_unstarted(&JobError::Cancelled);
                tracing::info!(job_id, user_id, queued_ms, "queued job cancelled");
                Ok(CancelOutcome::Removed)
            }
            JobState::Running => {
                // Signalled under the state lock so completion sees it.
                inner.control.request_cancel(job_id);
                drop(guard);
                tracing::info!(job_id, "cancellation requested for running job");
                Ok(CancelOutcome::Signalled)
            }
            state => Err(CancelError::AlreadyFinished { id: job_id, state }),
        }
    }

    /// Progress events of a job, ending with its terminal event.
    /// `None` if the id is unknown (or finished longer ago than the retention period).
    pub fn subscribe_progress(&self, job_id: JobId) -> Option<ProgressSubscription> {
        let st = self.inner.lock_state();
        let entry = st.jobs.get(&job_id)?;
        if entry.state.is_terminal() {
            let result = entry.result.clone()?;
            return Some(ProgressSubscription::finished(ProgressEvent::Finished {
                state: entry.state,
                result,
            }));
        }
        self.inner.progress.subscribe(job_id)
    }

    /// Wait for a job's terminal result.
    pub async fn outcome(&self, job_id: JobId) -> Option<JobResult> {
        match self.subscribe_progress(job_id)?.wait_terminal().await? {
            ProgressEvent::Finished { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        let st = self.inner.lock_state();
        st.jobs.get(&job_id).map(|e| e.status(job_id))
    }

    /// 1-based queue position of a queued job.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.inner.lock_state().queue.position(job_id)
    }

    pub fn perf_snapshot(&self) -> PerfSnapshot {
        self.inner.metrics.perf_snapshot()
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.inner.metrics.session_summary()
    }

    pub fn reset_session(&self) {
        self.inner.metrics.reset_session();
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        let now = self.inner.clock.now();
        let st = self.inner.lock_state();
        let sample = st.load_sample(now);
        PoolSnapshot {
            active_workers: sample.active_workers,
            busy_workers: sample.busy_workers,
            retiring_workers: st.workers.values().filter(|w| w.retiring).count(),
            queued: st.queue.len(),
            eligible_backlog: sample.eligible_backlog,
            ewma_wait: sample.ewma_wait,
            tracked_users: st.limiter.tracked_users(),
            min_workers: self.inner.autoscaler.policy().min_workers,
            max_workers: self.inner.autoscaler.policy().max_workers,
        }
    }

    /// Run one autoscaler step now (the background loop does this every tick).
    pub fn autoscale_tick(&self) {
        self.inner.tick();
    }

    /// Stop accepting, drain the queue for up to `grace`, then cancel what is
    /// left (queued jobs removed, running jobs signalled) and tear the pool down.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        {
            let mut st = inner.lock_state();
            st.accepting = false;
            st.draining = true;
        }
        inner.stop.cancel();
        inner.work.notify_waiters();
        let tick = inner
            .tick_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tick) = tick {
            let _ = tick.await;
        }

        let mut handles =
            std::mem::take(&mut *inner.worker_tasks.lock().unwrap_or_else(|e| e.into_inner()));
        tracing::info!(workers = handles.len(), "scheduler draining");

        if tokio::time::timeout(grace, join_all(&mut handles)).await.is_err() {
            let removed = inner.cancel_queued();
            inner.control.cancel_all();
            inner.work.notify_waiters();
            tracing::warn!(removed, "drain grace elapsed; cancelling remaining jobs");

            let settle = inner.cfg.cancel_grace() + Duration::from_secs(1);
            if tokio::time::timeout(settle, join_all(&mut handles))
                .await
                .is_err()
            {
                for h in &handles {
                    h.abort();
                }
                self.force_cancel_running();
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Mark jobs whose worker was torn down as cancelled.
    fn force_cancel_running(&self) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut st = inner.lock_state();
        for (id, entry) in st.jobs.iter_mut() {
            if entry.finish(Err(JobError::Cancelled), now) {
                inner
                    .progress
                    .finish(*id, JobState::Cancelled, Err(JobError::Cancelled));
                inner.control.unregister(*id);
            }
        }
    }
}

async fn join_all(handles: &mut [JoinHandle<()>]) {
    for h in handles.iter_mut() {
        if h.is_finished() {
            continue;
        }
        if let Err(e) = h.await {
            if e.is_panic() {
                tracing::error!("worker task panicked: {}", e);
            }
        }
    }
}
