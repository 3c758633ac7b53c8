//! Per-user admission control.
//!
//! Two independent limits are tracked per user:
//! - a rolling submission window (`window_cap` submissions per `window`);
//!   exceeding it rejects the submission outright;
//! - a cap on concurrently running jobs; exceeding it still queues the job but
//!   the queue will skip it until one of the user's running jobs finishes.
//!
//! Counters are only changed through `admit` / `start` / `finish` /
//! `withdraw`, which the scheduler calls under its state lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::SubmitError;
use crate::job::UserId;

/// Limits applied to every user.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_running: usize,
    pub window_cap: usize,
    pub window: Duration,
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The user has spare running capacity.
    Accepted,
    /// Queued, but the user's running and earlier queued jobs already fill the
    /// running cap; it starts when one of theirs finishes.
    QueuedWithDelay { running: usize },
}

/// Rate-limit state for one user.
#[derive(Debug, Clone, Default)]
pub struct UserQuota {
    /// Submission times inside the current window, oldest first.
    recent: VecDeque<Instant>,
    pub running: usize,
    pub queued: usize,
    pub last_seen: Option<Instant>,
}

impl UserQuota {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Submissions counted in the current window (as of the last prune).
    pub fn in_window(&self) -> usize {
        self.recent.len()
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.queued == 0
    }
}

/// Process-wide map of user quotas.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    quotas: HashMap<UserId, UserQuota>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy: RateLimitPolicy {
                max_running: policy.max_running.max(1),
                window_cap: policy.window_cap.max(1),
                window: policy.window,
            },
            quotas: HashMap::new(),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admit a new submission for `user` at `now`, counting it in the window
    /// and as queued. Rejects when the window is full.
    pub fn admit(&mut self, user: UserId, now: Instant) -> Result<Admission, SubmitError> {
        let policy = self.policy;
        let quota = self.quotas.entry(user).or_default();
        quota.prune(now, policy.window);
        quota.last_seen = Some(now);

        if quota.recent.len() >= policy.window_cap {
            let oldest = quota.recent.front().copied().unwrap_or(now);
            let retry_after = policy
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Err(SubmitError::RateLimited { retry_after });
        }

        let pending = quota.running + quota.queued;
        quota.recent.push_back(now);
        quota.queued += 1;
        if pending >= policy.max_running {
            Ok(Admission::QueuedWithDelay {
                running: quota.running,
            })
        } else {
            Ok(Admission::Accepted)
        }
    }

    /// Whether a queued job of `user` may start now.
    pub fn can_start(&self, user: UserId) -> bool {
        self.quotas
            .get(&user)
            .map_or(true, |q| q.running < self.policy.max_running)
    }

    /// Move one of the user's jobs from queued to running.
    pub fn start(&mut self, user: UserId, now: Instant) {
        let quota = self.quotas.entry(user).or_default();
        quota.queued = quota.queued.saturating_sub(1);
        quota.running += 1;
        quota.last_seen = Some(now);
    }

    /// Release a running slot after a terminal state.
    pub fn finish(&mut self, user: UserId, now: Instant) {
        if let Some(quota) = self.quotas.get_mut(&user) {
            quota.running = quota.running.saturating_sub(1);
            quota.last_seen = Some(now);
        }
    }

    /// A queued job left the queue without running (cancelled or drained).
    pub fn withdraw(&mut self, user: UserId) {
        if let Some(quota) = self.quotas.get_mut(&user) {
            quota.queued = quota.queued.saturating_sub(1);
        }
    }

    pub fn running(&self, user: UserId) -> usize {
        self.quotas.get(&user).map_or(0, |q| q.running)
    }

    pub fn quota(&self, user: UserId) -> Option<&UserQuota> {
        self.quotas.get(&user)
    }

    pub fn tracked_users(&self) -> usize {
        self.quotas.len()
    }

    /// Drop entries of users with nothing queued or running, no submission
    /// left in the window and no activity for `idle_for`.
    /// Returns how many entries were removed.
    pub fn evict_idle(&mut self, now: Instant, idle_for: Duration) -> usize {
        let window = self.policy.window;
        let before = self.quotas.len();
        self.quotas.retain(|_, q| {
            q.prune(now, window);
            if !q.recent.is_empty() {
                return true;
            }
            let stale = q
                .last_seen
                .map_or(true, |t| now.saturating_duration_since(t) >= idle_for);
            !(q.is_idle() && stale)
        });
        before - self.quotas.len()
    }
}
