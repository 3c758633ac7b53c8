//! Executor whose behavior is picked by the last path segment of the job URL.
//!
//! `https://media.example.com/<tag>/<behavior>` where behavior is one of
//! `ok`, `wait` (blocks until released or cancelled), `progress`, `fail`,
//! `panic`, `hang` (ignores cancellation).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dlsched_core::control::JobAborted;
use dlsched_core::{Artifact, Executor, JobSpec, ProgressSink};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub fn url(tag: &str, behavior: &str) -> String {
    format!("https://media.example.com/{}/{}", tag, behavior)
}

pub struct Scripted {
    gate: Semaphore,
    running: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl Default for Scripted {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let `n` waiting jobs finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Tags of started jobs, in start order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for Scripted {
    async fn execute(
        &self,
        job: &JobSpec,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Artifact> {
        let mut parts = job.url.rsplit('/');
        let behavior = parts.next().unwrap_or_default().to_string();
        let tag = parts.next().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(tag.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let artifact = Artifact {
            location: format!("/tmp/{}.mp4", tag),
            bytes: 1000,
        };
        match behavior.as_str() {
            "ok" => Ok(artifact),
            "wait" => {
                tokio::select! {
                    permit = self.gate.acquire() => {
                        permit?.forget();
                        Ok(artifact)
                    }
                    _ = cancel.cancelled() => Err(JobAborted.into()),
                }
            }
            "progress" => {
                for step in 0..=10u64 {
                    if cancel.is_cancelled() {
                        return Err(JobAborted.into());
                    }
                    progress.report(step * 100, Some(1000));
                    tokio::time::sleep(Duration::from_millis(15)).await;
                }
                Ok(artifact)
            }
            "fail" => anyhow::bail!("upstream returned HTTP 500"),
            "panic" => panic!("scripted executor panic"),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(artifact)
            }
            other => anyhow::bail!("unknown scripted behavior {:?}", other),
        }
    }
}
