//! Types describing a download job as the scheduler sees it.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

use super::platform::platform_from_url;

/// Job identifier (monotonic per scheduler).
pub type JobId = u64;

/// Chat user identifier.
pub type UserId = i64;

const MIB: u64 = 1024 * 1024;
const SMALL_MAX_BYTES: u64 = 25 * MIB;
const MEDIUM_MAX_BYTES: u64 = 120 * MIB;

/// Priority class. Declaration order is dequeue precedence (Admin first).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Expedited work (admin requests).
    Admin,
    /// Size hint up to 25 MiB.
    Small,
    /// Size hint up to 120 MiB.
    Medium,
    /// No size hint.
    Unsized,
    /// Anything bigger.
    Large,
}

impl Priority {
    /// Class derived from the declared/estimated size alone.
    pub fn from_size_hint(size_hint: Option<u64>) -> Self {
        match size_hint {
            None | Some(0) => Priority::Unsized,
            Some(n) if n <= SMALL_MAX_BYTES => Priority::Small,
            Some(n) if n <= MEDIUM_MAX_BYTES => Priority::Medium,
            Some(_) => Priority::Large,
        }
    }

    /// An explicit hint wins over the size-derived class.
    pub fn resolve(hint: Option<Priority>, size_hint: Option<u64>) -> Self {
        hint.unwrap_or_else(|| Self::from_size_hint(size_hint))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Admin => "admin",
            Priority::Small => "small",
            Priority::Medium => "medium",
            Priority::Unsized => "unsized",
            Priority::Large => "large",
        }
    }
}

/// Job lifecycle: `Queued → Running → {Succeeded | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// What the front end asks to download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub user_id: UserId,
    /// Direct URL or an opaque spec understood by the executor.
    pub url: String,
    /// Platform label for metrics ("youtube", "tiktok", ...). Derived from the URL when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_hint: Option<Priority>,
    /// Declared or estimated size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl JobSpec {
    pub fn new(user_id: UserId, url: impl Into<String>) -> Self {
        Self {
            user_id,
            url: url.into(),
            platform: None,
            priority_hint: None,
            size_hint: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority_hint = Some(priority);
        self
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }

    pub fn priority(&self) -> Priority {
        Priority::resolve(self.priority_hint, self.size_hint)
    }

    /// Platform label used for metrics buckets.
    pub fn platform(&self) -> String {
        match self.platform.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_lowercase(),
            _ => platform_from_url(&self.url),
        }
    }
}

/// Reference to a produced file, handed to the storage collaborator on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path or other locator of the downloaded file.
    pub location: String,
    /// Bytes transferred.
    pub bytes: u64,
}

/// Terminal result of a job.
pub type JobResult = Result<Artifact, JobError>;

/// Point-in-time view of one job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub user_id: UserId,
    pub priority: Priority,
    pub platform: String,
    pub size_hint: Option<u64>,
    pub state: JobState,
    /// Set once the job is terminal.
    pub result: Option<JobResult>,
}
