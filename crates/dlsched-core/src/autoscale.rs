//! Worker pool autoscaling policy.
//!
//! The control loop in the scheduler samples load on a fixed tick and asks
//! [`Autoscaler::decide`] for at most one size change. Growth is additive
//! (one worker per tick); shrinking retires one worker that has been idle
//! for the cooldown, and only ever an idle one.

use std::time::{Duration, Instant};

/// Exponentially weighted moving average of queue wait.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(0.01, 1.0)
        } else {
            1.0
        };
        Self { alpha, value: None }
    }

    pub fn observe(&mut self, sample: Duration) {
        let x = sample.as_secs_f64();
        self.value = Some(match self.value {
            None => x,
            Some(prev) => prev + self.alpha * (x - prev),
        });
    }

    pub fn get(&self) -> Duration {
        Duration::from_secs_f64(self.value.unwrap_or(0.0).max(0.0))
    }
}

/// Immutable view of pool load taken under the scheduler lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSample {
    /// Workers not marked for retirement.
    pub active_workers: usize,
    pub busy_workers: usize,
    /// Queued jobs whose user may start a job now.
    pub eligible_backlog: usize,
    /// Smoothed queue wait of recently dequeued jobs.
    pub ewma_wait: Duration,
    /// How long the oldest eligible queued job has been waiting.
    pub oldest_wait: Duration,
    /// Idle workers with the time they became idle, oldest first.
    pub idle_since: Vec<(u64, Instant)>,
}

impl LoadSample {
    pub fn utilization(&self) -> f64 {
        if self.active_workers == 0 {
            return 1.0;
        }
        self.busy_workers as f64 / self.active_workers as f64
    }
}

/// Thresholds for the control loop.
#[derive(Debug, Clone, Copy)]
pub struct ScalePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_wait: Duration,
    pub backlog_per_worker: usize,
    pub idle_cooldown: Duration,
}

/// One tick's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    /// Spawn one worker.
    Grow,
    /// Retire the given idle worker.
    Retire(u64),
}

#[derive(Debug, Clone)]
pub struct Autoscaler {
    policy: ScalePolicy,
}

impl Autoscaler {
    pub fn new(policy: ScalePolicy) -> Self {
        let min = policy.min_workers.max(1);
        Self {
            policy: ScalePolicy {
                min_workers: min,
                max_workers: policy.max_workers.max(min),
                ..policy
            },
        }
    }

    pub fn policy(&self) -> ScalePolicy {
        self.policy
    }

    pub fn decide(&self, sample: &LoadSample, now: Instant) -> ScaleDecision {
        let p = &self.policy;
        if sample.active_workers < p.min_workers {
            return ScaleDecision::Grow;
        }

        let pressure = sample.ewma_wait.max(sample.oldest_wait);
        let backlog_heavy =
            sample.eligible_backlog > sample.active_workers * p.backlog_per_worker.max(1);
        if sample.eligible_backlog > 0
            && sample.active_workers < p.max_workers
            && (pressure > p.scale_up_wait || backlog_heavy)
        {
            return ScaleDecision::Grow;
        }

        if sample.active_workers > p.min_workers && sample.eligible_backlog == 0 {
            let retire = sample
                .idle_since
                .iter()
                .filter(|(_, since)| now.saturating_duration_since(*since) >= p.idle_cooldown)
                .min_by_key(|(_, since)| *since);
            if let Some((worker_id, _)) = retire {
                return ScaleDecision::Retire(*worker_id);
            }
        }

        ScaleDecision::Hold
    }
}
