//! Job control for cancellation: shared cancel tokens per running job.
//!
//! Each running job is registered with a token derived from the scheduler's
//! root token, so a single cancel of the root reaches every running job on
//! shutdown. Executors observe their token and stop cooperatively.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Error an executor returns when it stopped because its token was cancelled.
#[derive(Debug)]
pub struct JobAborted;

impl std::fmt::Display for JobAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job aborted on request")
    }
}

impl std::error::Error for JobAborted {}

/// Shared registry of job id -> cancel token.
#[derive(Debug, Default)]
pub struct JobControl {
    root: CancellationToken,
    jobs: RwLock<HashMap<JobId, CancellationToken>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running job; returns the token to pass to the executor.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let token = self.root.child_token();
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, token.clone());
        token
    }

    /// Unregister a job once it reached a terminal state.
    pub fn unregister(&self, job_id: JobId) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    /// Signal cancellation to one running job. Returns false if it is not registered.
    pub fn request_cancel(&self, job_id: JobId) -> bool {
        match self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered job and any job registered afterwards.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn running(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
