//! Progress reporting for running jobs (bytes done, rate, ETA).
//!
//! Executors report raw byte counts through a [`ProgressSink`]. The
//! [`ProgressHub`] turns them into [`ProgressSnapshot`]s, drops updates that
//! arrive faster than the configured interval or that would move bytes
//! backwards, and publishes through a `watch` channel per job so a slow
//! subscriber only ever sees the latest value and never blocks the worker.
//! The terminal event bypasses throttling and is always the last one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::clock::SharedClock;
use crate::job::{JobId, JobResult, JobState};

/// Snapshot of download progress for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Total size in bytes, when the executor knows it.
    pub total_bytes: Option<u64>,
    /// Transfer rate over the last reporting interval.
    pub bytes_per_sec: f64,
    /// Estimated seconds remaining (None when the total or rate is unknown).
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    /// Fraction complete in [0.0, 1.0], if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_done as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }
}

/// Event delivered to progress subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Waiting in the queue at the given 1-based position (at submission time).
    Queued { position: usize },
    /// A worker picked the job up.
    Started { isolated: bool },
    Progress(ProgressSnapshot),
    /// Terminal; always the last event for a job.
    Finished { state: JobState, result: JobResult },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Finished { .. })
    }
}

/// Raw update from an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
}

/// Receiver side of progress updates, implemented by the hub (in-process) and
/// by the isolated worker's stdout writer.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

/// Cloneable handle an executor uses to report progress. Never blocks.
#[derive(Clone)]
pub struct ProgressSink {
    observer: Arc<dyn ProgressObserver>,
}

impl ProgressSink {
    pub fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self { observer }
    }

    /// Sink that discards everything.
    pub fn noop() -> Self {
        struct Noop;
        impl ProgressObserver for Noop {
            fn on_progress(&self, _: ProgressUpdate) {}
        }
        Self::new(Arc::new(Noop))
    }

    pub fn report(&self, bytes_done: u64, total_bytes: Option<u64>) {
        self.observer.on_progress(ProgressUpdate {
            bytes_done,
            total_bytes,
        });
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

struct Channel {
    tx: watch::Sender<ProgressEvent>,
    started_at: Option<Instant>,
    last_emit: Option<(Instant, u64)>,
    last_bytes: u64,
}

/// Per-job progress channels with throttled publication.
pub struct ProgressHub {
    interval: Duration,
    clock: SharedClock,
    channels: Mutex<HashMap<JobId, Channel>>,
}

impl fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressHub")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ProgressHub {
    pub fn new(interval: Duration, clock: SharedClock) -> Self {
        Self {
            interval,
            clock,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a channel for a newly queued job.
    pub fn register(&self, job_id: JobId, initial: ProgressEvent) {
        let (tx, _rx) = watch::channel(initial);
        self.lock().insert(
            job_id,
            Channel {
                tx,
                started_at: None,
                last_emit: None,
                last_bytes: 0,
            },
        );
    }

    /// Mark the job as picked up by a worker; starts the rate clock.
    pub fn started(&self, job_id: JobId, isolated: bool) {
        let now = self.clock.now();
        let mut channels = self.lock();
        if let Some(ch) = channels.get_mut(&job_id) {
            ch.started_at = Some(now);
            ch.last_emit = Some((now, 0));
            ch.tx.send_replace(ProgressEvent::Started { isolated });
        }
    }

    /// Record a raw update. Returns true when a snapshot was emitted.
    pub fn publish(&self, job_id: JobId, update: ProgressUpdate) -> bool {
        let now = self.clock.now();
        let mut channels = self.lock();
        let Some(ch) = channels.get_mut(&job_id) else {
            return false;
        };
        if update.bytes_done < ch.last_bytes {
            return false;
        }
        ch.last_bytes = update.bytes_done;
        if let Some((at, _)) = ch.last_emit {
            if now.saturating_duration_since(at) < self.interval {
                return false;
            }
        }

        let bytes_per_sec = match ch.last_emit {
            Some((at, bytes)) if now > at => {
                update.bytes_done.saturating_sub(bytes) as f64
                    / now.saturating_duration_since(at).as_secs_f64()
            }
            _ => {
                let elapsed = ch
                    .started_at
                    .map(|s| now.saturating_duration_since(s).as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed > 0.0 {
                    update.bytes_done as f64 / elapsed
                } else {
                    0.0
                }
            }
        };
        let eta_secs = match update.total_bytes {
            Some(total) if update.bytes_done >= total => Some(0.0),
            Some(total) if bytes_per_sec > 0.0 => {
                Some((total - update.bytes_done) as f64 / bytes_per_sec)
            }
            _ => None,
        };

        ch.last_emit = Some((now, update.bytes_done));
        ch.tx.send_replace(ProgressEvent::Progress(ProgressSnapshot {
            job_id,
            bytes_done: update.bytes_done,
            total_bytes: update.total_bytes,
            bytes_per_sec,
            eta_secs,
        }));
        true
    }

    /// Publish the terminal event and close the channel.
    pub fn finish(&self, job_id: JobId, state: JobState, result: JobResult) {
        if let Some(ch) = self.lock().remove(&job_id) {
            ch.tx.send_replace(ProgressEvent::Finished { state, result });
        }
    }

    /// Subscribe to a live job. `None` if the job has no open channel.
    pub fn subscribe(&self, job_id: JobId) -> Option<ProgressSubscription> {
        let channels = self.lock();
        let ch = channels.get(&job_id)?;
        Some(ProgressSubscription::live(ch.tx.subscribe()))
    }

    /// Sink bound to one job, handed to in-process executors.
    pub fn sink(self: &Arc<Self>, job_id: JobId) -> ProgressSink {
        ProgressSink::new(Arc::new(HubObserver {
            hub: Arc::clone(self),
            job_id,
        }))
    }

    pub fn open_channels(&self) -> usize {
        self.lock().len()
    }
}

struct HubObserver {
    hub: Arc<ProgressHub>,
    job_id: JobId,
}

impl ProgressObserver for HubObserver {
    fn on_progress(&self, update: ProgressUpdate) {
        self.hub.publish(self.job_id, update);
    }
}

/// Lazy, finite sequence of progress events for one job, ending with its terminal event.
#[derive(Debug)]
pub struct ProgressSubscription {
    rx: Option<watch::Receiver<ProgressEvent>>,
    pending: Option<ProgressEvent>,
    done: bool,
}

impl ProgressSubscription {
    fn live(mut rx: watch::Receiver<ProgressEvent>) -> Self {
        let current = rx.borrow_and_update().clone();
        Self {
            rx: Some(rx),
            pending: Some(current),
            done: false,
        }
    }

    /// Subscription to a job that already finished: yields only its terminal event.
    pub fn finished(event: ProgressEvent) -> Self {
        Self {
            rx: None,
            pending: Some(event),
            done: false,
        }
    }

    /// Next event; `None` after the terminal event has been returned.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        if let Some(ev) = self.pending.take() {
            self.done = ev.is_terminal();
            return Some(ev);
        }
        let rx = self.rx.as_mut()?;
        match rx.changed().await {
            Ok(()) => {
                let ev = rx.borrow_and_update().clone();
                self.done = ev.is_terminal();
                Some(ev)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }

    /// Drain the subscription to its terminal event.
    pub async fn wait_terminal(mut self) -> Option<ProgressEvent> {
        let mut last = None;
        while let Some(ev) = self.next().await {
            last = Some(ev);
        }
        last.filter(ProgressEvent::is_terminal)
    }
}
