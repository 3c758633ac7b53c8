//! Line protocol between the scheduler and an isolated worker process.
//!
//! The parent writes one [`WorkerRequest`] as a JSON line to the child's
//! stdin. The child answers on stdout with newline-delimited
//! [`WorkerMessage`]s: any number of `progress`, then exactly one `done` or
//! `failed`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Artifact, JobId, JobSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: JobId,
    pub job: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress {
        bytes_done: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },
    Done {
        artifact: Artifact,
    },
    Failed {
        reason: String,
    },
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerMessage::Progress { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed worker line {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Longest line echoed back in error messages.
const ECHO_LIMIT: usize = 200;

/// Serialize a value as one protocol line (trailing newline included).
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

pub fn parse_message(line: &str) -> Result<WorkerMessage, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Malformed {
        line: line.chars().take(ECHO_LIMIT).collect(),
        source,
    })
}

pub fn parse_request(line: &str) -> Result<WorkerRequest, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Malformed {
        line: line.chars().take(ECHO_LIMIT).collect(),
        source,
    })
}
