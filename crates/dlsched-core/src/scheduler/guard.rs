//! RAII guard that releases a user's running slot and the worker's busy flag when dropped.

use crate::job::{JobId, UserId};

use super::Inner;

/// Pairs `RateLimiter::start` with `RateLimiter::finish`, including when the
/// worker task unwinds or is aborted mid-job.
pub(super) struct RunningSlot<'a> {
    pub(super) inner: &'a Inner,
    pub(super) user_id: UserId,
    pub(super) worker_id: u64,
    pub(super) job_id: JobId,
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        let now = self.inner.clock.now();
        {
            let mut st = self.inner.lock_state();
            st.limiter.finish(self.user_id, now);
            if let Some(slot) = st.workers.get_mut(&self.worker_id) {
                slot.busy = false;
                slot.idle_since = now;
            }
        }
        tracing::trace!(job_id = self.job_id, user_id = self.user_id, "running slot released");
        self.inner.work.notify_waiters();
    }
}
