//! Error taxonomy: submission rejections and terminal job failure reasons.

use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobState};

/// What the user should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retrying right away may succeed.
    Now,
    /// Retry after waiting.
    Later,
    /// Do not retry.
    Never,
}

/// Submission rejected before the job was queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Per-user submission window is full.
    #[error("rate limit exceeded, retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },
    /// Queue is at capacity; `position` is where the job would have landed.
    #[error("queue is full (position {position})")]
    QueueFull { position: usize },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            SubmitError::RateLimited { .. } | SubmitError::QueueFull { .. } => RetryHint::Later,
            SubmitError::ShuttingDown => RetryHint::Never,
        }
    }
}

/// Terminal failure reason of a job that was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Removed from the queue, or stopped while running, on request.
    #[error("cancelled")]
    Cancelled,
    /// The download logic itself failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// The isolated worker process crashed, was killed, or broke the protocol.
    #[error("isolation failure: {0}")]
    IsolationFailure(String),
    /// Wall-clock limit exceeded.
    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl JobError {
    /// Stable machine-readable reason code.
    pub fn as_code(&self) -> &'static str {
        match self {
            JobError::Cancelled => "cancelled",
            JobError::ExecutionFailed(_) => "execution_failed",
            JobError::IsolationFailure(_) => "isolation_failure",
            JobError::Timeout(_) => "timeout",
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        match self {
            JobError::ExecutionFailed(_) => RetryHint::Now,
            JobError::Timeout(_) => RetryHint::Later,
            JobError::Cancelled | JobError::IsolationFailure(_) => RetryHint::Never,
        }
    }

    /// Terminal state this reason maps to.
    pub fn terminal_state(&self) -> JobState {
        match self {
            JobError::Cancelled => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }
}

/// Cancel request could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} already {}", .state.as_str())]
    AlreadyFinished { id: JobId, state: JobState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_keeps_subsecond_limits() {
        assert_eq!(
            JobError::Timeout(Duration::from_millis(500)).to_string(),
            "timed out after 0.5s"
        );
        assert_eq!(
            JobError::Timeout(Duration::from_secs(600)).to_string(),
            "timed out after 600.0s"
        );
    }

    #[test]
    fn reason_codes_are_distinct() {
        let codes = [
            JobError::Cancelled.as_code(),
            JobError::ExecutionFailed("x".into()).as_code(),
            JobError::IsolationFailure("x".into()).as_code(),
            JobError::Timeout(Duration::from_secs(1)).as_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn rate_limited_message_mentions_retry_after() {
        let e = SubmitError::RateLimited {
            retry_after: Duration::from_millis(2500),
        };
        assert_eq!(e.to_string(), "rate limit exceeded, retry after 2.5s");
        assert_eq!(e.retry_hint(), RetryHint::Later);
    }

    #[test]
    fn cancelled_maps_to_cancelled_state() {
        assert_eq!(JobError::Cancelled.terminal_state(), JobState::Cancelled);
        assert_eq!(
            JobError::Timeout(Duration::from_secs(5)).terminal_state(),
            JobState::Failed
        );
    }
}
