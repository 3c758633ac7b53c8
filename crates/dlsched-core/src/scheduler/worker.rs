//! Worker loop: claim → run (in-process or isolated) → terminal state → metrics → release.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};

use crate::control::JobAborted;
use crate::error::JobError;
use crate::job::{JobResult, JobState};
use crate::metrics::Completion;

use super::guard::RunningSlot;
use super::state::Claimed;
use super::Inner;

pub(super) enum Claim {
    Job(Claimed),
    Idle,
    Exit,
}

enum Stop {
    Timeout,
    Cancelled,
}

pub(super) async fn worker_loop(inner: Arc<Inner>, worker_id: u64) {
    tracing::debug!(worker_id, "worker started");
    loop {
        let notified = inner.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        match inner.try_claim(worker_id) {
            Claim::Job(job) => inner.run_job(worker_id, job).await,
            Claim::Idle => notified.await,
            Claim::Exit => break,
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

impl Inner {
    /// Move the next eligible job from the queue to this worker, in one critical section.
    fn try_claim(&self, worker_id: u64) -> Claim {
        let now = self.clock.now();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        match st.workers.get(&worker_id) {
            None => return Claim::Exit,
            Some(slot) if slot.retiring => {
                st.workers.remove(&worker_id);
                tracing::info!(worker_id, "worker retired");
                return Claim::Exit;
            }
            Some(_) => {}
        }

        loop {
            let limiter = &st.limiter;
            let Some(next) = st.queue.pop_eligible(|u| limiter.can_start(u)) else {
                if st.draining && st.queue.is_empty() {
                    st.workers.remove(&worker_id);
                    return Claim::Exit;
                }
                return Claim::Idle;
            };
            let Some(entry) = st.jobs.get_mut(&next.id) else {
                tracing::warn!(job_id = next.id, "queued job has no entry; dropped");
                st.limiter.withdraw(next.user_id);
                continue;
            };

            entry.state = JobState::Running;
            let queue_wait = now.saturating_duration_since(next.enqueued_at);
            let isolated = self
                .isolator
                .as_ref()
                .map_or(false, |iso| iso.should_isolate(entry.spec.size_hint));
            let claimed = Claimed {
                id: next.id,
                user_id: next.user_id,
                spec: entry.spec.clone(),
                platform: entry.platform.clone(),
                queue_wait,
                isolated,
                cancel: self.control.register(next.id),
            };

            st.limiter.start(next.user_id, now);
            st.ewma.observe(queue_wait);
            if let Some(slot) = st.workers.get_mut(&worker_id) {
                slot.busy = true;
            }
            self.progress.started(next.id, isolated);
            tracing::info!(
                job_id = next.id,
                user_id = next.user_id,
                worker_id,
                priority = next.priority.as_str(),
                wait_ms = queue_wait.as_millis() as u64,
                isolated,
                "job started"
            );
            return Claim::Job(claimed);
        }
    }

    async fn run_job(&self, worker_id: u64, job: Claimed) {
        let _slot = RunningSlot {
            inner: self,
            user_id: job.user_id,
            worker_id,
            job_id: job.id,
        };
        let started = self.clock.now();
        let result = self.supervise(&job).await;
        let processing = self.clock.now().saturating_duration_since(started);
        self.complete(worker_id, &job, result, processing);
    }

    /// Run the job in its own task and enforce the wall clock limit and cancellation.
    async fn supervise(&self, job: &Claimed) -> JobResult {
        let limit = self.cfg.job_timeout();
        let grace = self.cfg.cancel_grace();
        let sink = self.progress.sink(job.id);
        let cancel = job.cancel.clone();
        let spec = job.spec.clone();

        let mut handle: JoinHandle<JobResult> = match (&self.isolator, job.isolated) {
            (Some(isolator), true) => {
                let isolator = isolator.clone();
                let id = job.id;
                tokio::spawn(async move { isolator.run(id, &spec, sink, cancel).await })
            }
            _ => {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    match executor.execute(&spec, sink, cancel.clone()).await {
                        Ok(artifact) => Ok(artifact),
                        Err(e) if cancel.is_cancelled() || e.is::<JobAborted>() => {
                            Err(JobError::Cancelled)
                        }
                        Err(e) => Err(JobError::ExecutionFailed(format!("{:#}", e))),
                    }
                })
            }
        };

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let stop = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Stop::Cancelled,
            joined = &mut handle => return joined_result(joined),
            _ = &mut deadline => Stop::Timeout,
        };

        job.cancel.cancel();
        if job.isolated {
            // The isolator bounds this itself (SIGTERM, grace, SIGKILL).
            let _ = (&mut handle).await;
        } else if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!(job_id = job.id, "executor ignored cancellation; detached");
        }

        match stop {
            Stop::Timeout => Err(JobError::Timeout(limit)),
            Stop::Cancelled => Err(JobError::Cancelled),
        }
    }

    fn complete(&self, worker_id: u64, job: &Claimed, result: JobResult, processing: Duration) {
        let now = self.clock.now();
        let result = {
            let mut st = self.lock_state();
            // A cancel acknowledged as Signalled wins over a late success.
            let result = match result {
                Ok(_) if job.cancel.is_cancelled() => Err(JobError::Cancelled),
                other => other,
            };
            if let Some(entry) = st.jobs.get_mut(&job.id) {
                if entry.finish(result.clone(), now) {
                    self.progress.finish(job.id, entry.state, result.clone());
                }
            }
            result
        };
        self.control.unregister(job.id);
        self.metrics.record_completion(Completion {
            platform: &job.platform,
            queue_wait: job.queue_wait,
            processing,
            result: &result,
        });

        let elapsed_ms = processing.as_millis() as u64;
        match &result {
            Ok(artifact) => tracing::info!(
                job_id = job.id,
                user_id = job.user_id,
                worker_id,
                bytes = artifact.bytes,
                elapsed_ms,
                "job succeeded"
            ),
            Err(e) => tracing::warn!(
                job_id = job.id,
                user_id = job.user_id,
                worker_id,
                reason = e.as_code(),
                elapsed_ms,
                "job failed: {}",
                e
            ),
        }
    }
}

fn joined_result(joined: Result<JobResult, JoinError>) -> JobResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::ExecutionFailed(format!(
            "executor panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(_) => Err(JobError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
