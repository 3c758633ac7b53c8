//! Execution isolation: run oversized jobs in a child OS process.
//!
//! The child is any program speaking the line protocol in [`protocol`]; the
//! CLI re-executes itself with the hidden `worker` subcommand. Whatever the
//! child does (crash, hang, garbage on stdout) the parent always produces a
//! terminal result, and the child is killed and reaped before `run` returns.

pub mod protocol;
mod serve;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::job::{JobId, JobResult, JobSpec};
use crate::progress::ProgressSink;

pub use protocol::{ProtocolError, WorkerMessage, WorkerRequest};
pub use serve::serve_worker;

/// How to launch the isolated worker and when to use it.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Jobs with a size hint at or above this go to a child process. `None` disables isolation.
    pub threshold_bytes: Option<u64>,
    /// Wall clock limit for one child.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL on cancel.
    pub cancel_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct Isolator {
    cfg: IsolatorConfig,
}

enum Outcome {
    Terminal(JobResult),
    Cancelled,
    TimedOut,
    Broken(String),
}

impl Isolator {
    pub fn new(cfg: IsolatorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &IsolatorConfig {
        &self.cfg
    }

    /// Routing rule: isolate only when enabled and the size hint reaches the threshold.
    /// Jobs without a size hint always run in-process.
    pub fn should_isolate(&self, size_hint: Option<u64>) -> bool {
        match (self.cfg.threshold_bytes, size_hint) {
            (Some(threshold), Some(size)) => threshold > 0 && size >= threshold,
            _ => false,
        }
    }

    /// Run one job in a fresh child process, relaying progress to `progress`.
    pub async fn run(
        &self,
        job_id: JobId,
        job: &JobSpec,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> JobResult {
        let mut child = Command::new(&self.cfg.program)
            .args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                JobError::IsolationFailure(format!(
                    "spawn {}: {}",
                    self.cfg.program.display(),
                    e
                ))
            })?;
        tracing::debug!(job_id, pid = child.id(), "isolated worker spawned");

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_reap(&mut child).await;
            return Err(JobError::IsolationFailure("worker pipes unavailable".into()));
        };

        let request = protocol::encode_line(&WorkerRequest {
            job_id,
            job: job.clone(),
        })
        .map_err(|e| JobError::IsolationFailure(e.to_string()))?;
        let write = async {
            stdin.write_all(request.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            kill_and_reap(&mut child).await;
            return Err(JobError::IsolationFailure(format!("send request: {}", e)));
        }
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(self.cfg.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                _ = &mut deadline => break Outcome::TimedOut,
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match protocol::parse_message(&line) {
                        Ok(WorkerMessage::Progress { bytes_done, total_bytes }) => {
                            progress.report(bytes_done, total_bytes);
                        }
                        Ok(WorkerMessage::Done { artifact }) => break Outcome::Terminal(Ok(artifact)),
                        Ok(WorkerMessage::Failed { reason }) => {
                            break Outcome::Terminal(Err(JobError::ExecutionFailed(reason)))
                        }
                        Err(e) => break Outcome::Broken(e.to_string()),
                    },
                    Ok(None) => break Outcome::Broken("worker exited without a result".into()),
                    Err(e) => break Outcome::Broken(format!("read worker output: {}", e)),
                },
            }
        };

        match outcome {
            Outcome::Terminal(result) => {
                match tokio::time::timeout(self.cfg.cancel_grace, child.wait()).await {
                    Ok(Ok(status)) if !status.success() => {
                        tracing::debug!(job_id, %status, "isolated worker exited non-zero after result");
                    }
                    Ok(_) => {}
                    Err(_) => kill_and_reap(&mut child).await,
                }
                result
            }
            Outcome::Cancelled => {
                terminate(&mut child, self.cfg.cancel_grace).await;
                Err(JobError::Cancelled)
            }
            Outcome::TimedOut => {
                kill_and_reap(&mut child).await;
                Err(JobError::IsolationFailure(format!(
                    "worker exceeded {}s",
                    self.cfg.timeout.as_secs()
                )))
            }
            Outcome::Broken(reason) => {
                let status = match tokio::time::timeout(self.cfg.cancel_grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        kill_and_reap(&mut child).await;
                        None
                    }
                };
                let reason = match status {
                    Some(status) if !status.success() => format!("{} ({})", reason, status),
                    _ => reason,
                };
                tracing::warn!(job_id, %reason, "isolated worker failed");
                Err(JobError::IsolationFailure(reason))
            }
        }
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!("kill isolated worker: {}", e);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                    return;
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    kill_and_reap(child).await;
}
