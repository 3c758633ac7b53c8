//! Autoscale control loop plus periodic housekeeping.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use crate::autoscale::ScaleDecision;

use super::Inner;

pub(super) async fn autoscale_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.cfg.autoscale_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = ticker.tick() => inner.tick(),
        }
    }
    tracing::debug!("autoscale loop stopped");
}

impl Inner {
    /// One control step: at most one pool size change, then evict idle
    /// quotas and forget old finished jobs.
    pub(super) fn tick(self: &Arc<Self>) {
        let now = self.clock.now();
        let decision = {
            let mut st = self.lock_state();
            if st.draining {
                return;
            }
            let sample = st.load_sample(now);
            let decision = self.autoscaler.decide(&sample, now);
            if let ScaleDecision::Retire(worker_id) = decision {
                if let Some(slot) = st.workers.get_mut(&worker_id) {
                    slot.retiring = true;
                }
            }

            let evicted = st
                .limiter
                .evict_idle(now, self.cfg.quota_idle_eviction());
            let pruned = st.prune_finished(now, self.cfg.finished_job_retention());
            if evicted > 0 || pruned > 0 {
                tracing::debug!(evicted, pruned, "housekeeping");
            }
            if decision != ScaleDecision::Hold {
                tracing::info!(
                    ?decision,
                    active = sample.active_workers,
                    busy = sample.busy_workers,
                    backlog = sample.eligible_backlog,
                    ewma_wait_ms = sample.ewma_wait.as_millis() as u64,
                    oldest_wait_ms = sample.oldest_wait.as_millis() as u64,
                    utilization = sample.utilization(),
                    "autoscale"
                );
            }
            decision
        };

        match decision {
            ScaleDecision::Grow => {
                self.spawn_worker();
            }
            ScaleDecision::Retire(_) => self.work.notify_waiters(),
            ScaleDecision::Hold => {}
        }
    }
}
