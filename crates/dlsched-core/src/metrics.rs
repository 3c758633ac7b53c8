//! Per-platform latency windows and session counters.
//!
//! Latency windows are bounded (`metric_window` samples per platform, oldest
//! dropped first). Session counters only reset through [`MetricsAggregator::reset_session`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::JobError;
use crate::job::JobResult;

/// Completed jobs between aggregate log lines.
const LOG_EVERY: u64 = 25;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi", "m4v"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav", "ogg", "opus", "flac"];

/// Coarse media classification for session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

impl MediaKind {
    /// Classify by file extension first, then by hints in the platform label.
    pub fn classify(platform: &str, location: Option<&str>) -> Self {
        let ext = location
            .and_then(|l| l.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let platform = platform.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) || platform.contains("video") {
            MediaKind::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str())
            || platform.contains("audio")
            || platform.contains("mp3")
        {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }
}

/// Nearest-rank percentile over unsorted samples: `sorted[round(q * (n - 1))]`.
/// Empty input yields zero.
pub fn percentile(samples: impl IntoIterator<Item = Duration>, q: f64) -> Duration {
    let mut sorted: Vec<Duration> = samples.into_iter().collect();
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    sorted.sort_unstable();
    let q = if q.is_finite() { q.clamp(0.0, 1.0) } else { 0.5 };
    let idx = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Default)]
struct PlatformWindow {
    processing: VecDeque<Duration>,
    wait: VecDeque<Duration>,
    completed: u64,
}

fn push_bounded(window: &mut VecDeque<Duration>, sample: Duration, cap: usize) {
    if window.len() >= cap {
        window.pop_front();
    }
    window.push_back(sample);
}

/// Latency summary for one platform (or all platforms together).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformPerf {
    /// Completed jobs since start (not bounded by the window).
    pub count: u64,
    pub processing_p50: Duration,
    pub processing_p95: Duration,
    pub wait_p50: Duration,
    pub wait_p95: Duration,
}

/// Output of `/perf`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerfSnapshot {
    pub overall: PlatformPerf,
    pub platforms: BTreeMap<String, PlatformPerf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlatformTotals {
    pub count: u64,
    pub bytes: u64,
}

/// Output of `/session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub uptime: Duration,
    /// Successful downloads.
    pub total_jobs: u64,
    pub total_bytes: u64,
    pub videos: u64,
    pub audio: u64,
    pub other: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub by_platform: BTreeMap<String, PlatformTotals>,
}

#[derive(Debug)]
struct Session {
    started_at: Instant,
    total_jobs: u64,
    total_bytes: u64,
    videos: u64,
    audio: u64,
    other: u64,
    failed: u64,
    cancelled: u64,
    by_platform: BTreeMap<String, PlatformTotals>,
}

impl Session {
    fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            total_jobs: 0,
            total_bytes: 0,
            videos: 0,
            audio: 0,
            other: 0,
            failed: 0,
            cancelled: 0,
            by_platform: BTreeMap::new(),
        }
    }

    fn add_success(&mut self, platform: &str, bytes: u64, kind: MediaKind) {
        self.total_jobs += 1;
        self.total_bytes += bytes;
        match kind {
            MediaKind::Video => self.videos += 1,
            MediaKind::Audio => self.audio += 1,
            MediaKind::Other => self.other += 1,
        }
        let totals = self.by_platform.entry(platform.to_string()).or_default();
        totals.count += 1;
        totals.bytes += bytes;
    }
}

#[derive(Debug)]
struct Inner {
    platforms: HashMap<String, PlatformWindow>,
    session: Session,
    completed: u64,
}

/// One finished job as reported by a worker.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub platform: &'a str,
    pub queue_wait: Duration,
    pub processing: Duration,
    pub result: &'a JobResult,
}

#[derive(Debug)]
pub struct MetricsAggregator {
    window: usize,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

fn platform_key(platform: &str) -> String {
    let p = platform.trim();
    if p.is_empty() {
        "generic".to_string()
    } else {
        p.to_lowercase()
    }
}

impl MetricsAggregator {
    pub fn new(window: usize, clock: SharedClock) -> Self {
        let started_at = clock.now();
        Self {
            window: window.max(1),
            clock,
            inner: Mutex::new(Inner {
                platforms: HashMap::new(),
                session: Session::new(started_at),
                completed: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a successful download of `bytes` that took `duration`.
    pub fn record(&self, platform: &str, duration: Duration, bytes: u64) {
        let key = platform_key(platform);
        let kind = MediaKind::classify(&key, None);
        let mut inner = self.lock();
        self.push_processing(&mut inner, &key, duration);
        inner.session.add_success(&key, bytes, kind);
    }

    /// Record a terminal job: latency samples for every outcome, session
    /// counters by outcome. Logs an aggregate line every 25 completions.
    pub fn record_completion(&self, c: Completion<'_>) {
        let key = platform_key(c.platform);
        let mut inner = self.lock();
        self.push_processing(&mut inner, &key, c.processing);
        let cap = self.window;
        if let Some(w) = inner.platforms.get_mut(&key) {
            push_bounded(&mut w.wait, c.queue_wait, cap);
        }
        match c.result {
            Ok(artifact) => {
                let kind = MediaKind::classify(&key, Some(&artifact.location));
                inner.session.add_success(&key, artifact.bytes, kind);
            }
            Err(JobError::Cancelled) => inner.session.cancelled += 1,
            Err(_) => inner.session.failed += 1,
        }

        if inner.completed % LOG_EVERY == 0 {
            let overall = overall_perf(&inner);
            tracing::info!(
                jobs = inner.completed,
                wait_p50_ms = overall.wait_p50.as_millis() as u64,
                wait_p95_ms = overall.wait_p95.as_millis() as u64,
                processing_p50_ms = overall.processing_p50.as_millis() as u64,
                processing_p95_ms = overall.processing_p95.as_millis() as u64,
                "queue metrics"
            );
        }
    }

    /// Count a job that reached a terminal state without running (e.g. cancelled while queued).
    pub fn record_unstarted(&self, reason: &JobError) {
        let mut inner = self.lock();
        match reason {
            JobError::Cancelled => inner.session.cancelled += 1,
            _ => inner.session.failed += 1,
        }
    }

    fn push_processing(&self, inner: &mut Inner, key: &str, sample: Duration) {
        let cap = self.window;
        let w = inner.platforms.entry(key.to_string()).or_default();
        push_bounded(&mut w.processing, sample, cap);
        w.completed += 1;
        inner.completed += 1;
    }

    /// Processing-time percentile for one platform (`p` in [0, 1]).
    pub fn percentile(&self, platform: &str, p: f64) -> Duration {
        let inner = self.lock();
        inner
            .platforms
            .get(&platform_key(platform))
            .map_or(Duration::ZERO, |w| percentile(w.processing.iter().copied(), p))
    }

    /// Queue-wait percentile for one platform.
    pub fn wait_percentile(&self, platform: &str, p: f64) -> Duration {
        let inner = self.lock();
        inner
            .platforms
            .get(&platform_key(platform))
            .map_or(Duration::ZERO, |w| percentile(w.wait.iter().copied(), p))
    }

    pub fn perf_snapshot(&self) -> PerfSnapshot {
        let inner = self.lock();
        let platforms = inner
            .platforms
            .iter()
            .map(|(k, w)| (k.clone(), window_perf(w)))
            .collect();
        PerfSnapshot {
            overall: overall_perf(&inner),
            platforms,
        }
    }

    pub fn session_summary(&self) -> SessionSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        let s = &inner.session;
        SessionSnapshot {
            uptime: now.saturating_duration_since(s.started_at),
            total_jobs: s.total_jobs,
            total_bytes: s.total_bytes,
            videos: s.videos,
            audio: s.audio,
            other: s.other,
            failed: s.failed,
            cancelled: s.cancelled,
            by_platform: s.by_platform.clone(),
        }
    }

    /// Zero the session counters and restart uptime. Latency windows are kept.
    pub fn reset_session(&self) {
        let now = self.clock.now();
        self.lock().session = Session::new(now);
    }

    /// Jobs recorded since start.
    pub fn completed(&self) -> u64 {
        self.lock().completed
    }
}

fn window_perf(w: &PlatformWindow) -> PlatformPerf {
    PlatformPerf {
        count: w.completed,
        processing_p50: percentile(w.processing.iter().copied(), 0.50),
        processing_p95: percentile(w.processing.iter().copied(), 0.95),
        wait_p50: percentile(w.wait.iter().copied(), 0.50),
        wait_p95: percentile(w.wait.iter().copied(), 0.95),
    }
}

fn overall_perf(inner: &Inner) -> PlatformPerf {
    let processing = || inner.platforms.values().flat_map(|w| w.processing.iter().copied());
    let wait = || inner.platforms.values().flat_map(|w| w.wait.iter().copied());
    PlatformPerf {
        count: inner.completed,
        processing_p50: percentile(processing(), 0.50),
        processing_p95: percentile(processing(), 0.95),
        wait_p50: percentile(wait(), 0.50),
        wait_p95: percentile(wait(), 0.95),
    }
}
