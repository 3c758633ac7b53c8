//! Priority queue with per-class FIFO order and round-robin user fairness.
//!
//! Classes are served strictly in [`Priority`] order. Inside a class jobs are
//! FIFO by submission, except that after `burst` consecutive dequeues for the
//! same user the next dequeue prefers the earliest eligible job of another
//! user. Jobs whose user is not currently eligible (at the running cap) are
//! skipped in place, never removed.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::job::{JobId, Priority, UserId};

/// Queue entry. Job payloads live in the scheduler's job table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub user_id: UserId,
    pub priority: Priority,
    pub seq: u64,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct ClassQueue {
    jobs: VecDeque<QueuedJob>,
    last_user: Option<UserId>,
    streak: usize,
}

impl ClassQueue {
    fn pick(&self, eligible: &impl Fn(UserId) -> bool, burst: usize) -> Option<usize> {
        let first = self.jobs.iter().position(|j| eligible(j.user_id))?;
        let user = self.jobs[first].user_id;
        if self.last_user == Some(user) && self.streak >= burst {
            if let Some(other) = self
                .jobs
                .iter()
                .position(|j| j.user_id != user && eligible(j.user_id))
            {
                return Some(other);
            }
        }
        Some(first)
    }

    fn note_dequeue(&mut self, user: UserId) {
        if self.last_user == Some(user) {
            self.streak += 1;
        } else {
            self.last_user = Some(user);
            self.streak = 1;
        }
    }
}

#[derive(Debug)]
pub struct FairQueue {
    classes: BTreeMap<Priority, ClassQueue>,
    burst: usize,
    len: usize,
    next_seq: u64,
}

impl FairQueue {
    /// `burst` is the fairness bound K (consecutive dequeues per user per class).
    pub fn new(burst: usize) -> Self {
        Self {
            classes: BTreeMap::new(),
            burst: burst.max(1),
            len: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a job to its class. Returns its 1-based position in dequeue order.
    pub fn push(&mut self, id: JobId, user_id: UserId, priority: Priority, now: Instant) -> usize {
        self.next_seq += 1;
        let entry = QueuedJob {
            id,
            user_id,
            priority,
            seq: self.next_seq,
            enqueued_at: now,
        };
        self.classes.entry(priority).or_default().jobs.push_back(entry);
        self.len += 1;
        self.position(id).unwrap_or(self.len)
    }

    /// Remove and return the next job to run, skipping users for which `eligible` is false.
    pub fn pop_eligible(&mut self, eligible: impl Fn(UserId) -> bool) -> Option<QueuedJob> {
        let burst = self.burst;
        for class in self.classes.values_mut() {
            let Some(idx) = class.pick(&eligible, burst) else {
                continue;
            };
            let Some(job) = class.jobs.remove(idx) else {
                continue;
            };
            class.note_dequeue(job.user_id);
            self.len -= 1;
            return Some(job);
        }
        None
    }

    /// Remove a job by id (cancellation). `None` if it is not queued.
    pub fn remove(&mut self, id: JobId) -> Option<QueuedJob> {
        for class in self.classes.values_mut() {
            if let Some(idx) = class.jobs.iter().position(|j| j.id == id) {
                let job = class.jobs.remove(idx);
                if job.is_some() {
                    self.len -= 1;
                }
                return job;
            }
        }
        None
    }

    /// 1-based position in class-then-FIFO order, ignoring eligibility.
    pub fn position(&self, id: JobId) -> Option<usize> {
        let mut ahead = 0usize;
        for class in self.classes.values() {
            if let Some(idx) = class.jobs.iter().position(|j| j.id == id) {
                return Some(ahead + idx + 1);
            }
            ahead += class.jobs.len();
        }
        None
    }

    /// Number of jobs that could start right now.
    pub fn eligible_len(&self, eligible: impl Fn(UserId) -> bool) -> usize {
        self.iter().filter(|j| eligible(j.user_id)).count()
    }

    /// Enqueue time of the oldest job that could start right now.
    pub fn oldest_eligible(&self, eligible: impl Fn(UserId) -> bool) -> Option<Instant> {
        self.iter()
            .filter(|j| eligible(j.user_id))
            .map(|j| j.enqueued_at)
            .min()
    }

    /// Remove everything (shutdown).
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        let mut out = Vec::with_capacity(self.len);
        for class in self.classes.values_mut() {
            out.extend(class.jobs.drain(..));
        }
        self.len = 0;
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.classes.values().flat_map(|c| c.jobs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(_: UserId) -> bool {
        true
    }

    fn drain_users(q: &mut FairQueue) -> Vec<UserId> {
        let mut out = Vec::new();
        while let Some(j) = q.pop_eligible(always) {
            out.push(j.user_id);
        }
        out
    }

    #[test]
    fn admin_before_normal_regardless_of_submission_order() {
        let now = Instant::now();
        let mut q = FairQueue::new(3);
        q.push(1, 10, Priority::Small, now);
        q.push(2, 11, Priority::Unsized, now);
        q.push(3, 12, Priority::Admin, now);
        assert_eq!(q.pop_eligible(always).unwrap().id, 3);
        assert_eq!(q.pop_eligible(always).unwrap().id, 1);
        assert_eq!(q.pop_eligible(always).unwrap().id, 2);
        assert!(q.pop_eligible(always).is_none());
    }

    #[test]
    fn fifo_within_class_for_one_user() {
        let now = Instant::now();
        let mut q = FairQueue::new(2);
        for id in 1..=5 {
            q.push(id, 1, Priority::Small, now);
        }
        let ids: Vec<JobId> = std::iter::from_fn(|| q.pop_eligible(always).map(|j| j.id)).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn burst_bound_interleaves_users() {
        let now = Instant::now();
        let mut q = FairQueue::new(2);
        for id in 1..=6 {
            q.push(id, 1, Priority::Small, now);
        }
        q.push(7, 2, Priority::Small, now);
        q.push(8, 2, Priority::Small, now);
        assert_eq!(drain_users(&mut q), vec![1, 1, 2, 1, 1, 2, 1, 1]);
    }

    #[test]
    fn no_user_exceeds_burst_while_another_waits() {
        let now = Instant::now();
        let k = 3;
        let mut q = FairQueue::new(k);
        let mut id = 0;
        for user in [1, 1, 1, 1, 1, 1, 1, 2, 3, 2, 1, 3] {
            id += 1;
            q.push(id, user, Priority::Medium, now);
        }
        let mut remaining: Vec<UserId> = q.iter().map(|j| j.user_id).collect();
        let mut run = 0usize;
        let mut last = None;
        while let Some(job) = q.pop_eligible(always) {
            let pos = remaining.iter().position(|u| *u == job.user_id).unwrap();
            remaining.remove(pos);
            if last == Some(job.user_id) {
                run += 1;
            } else {
                run = 1;
                last = Some(job.user_id);
            }
            let others_waiting = remaining.iter().any(|u| *u != job.user_id);
            if others_waiting {
                assert!(run <= k, "user {} got {} in a row", job.user_id, run);
            }
        }
    }

    #[test]
    fn ineligible_head_is_skipped_not_removed() {
        let now = Instant::now();
        let mut q = FairQueue::new(3);
        q.push(1, 1, Priority::Small, now);
        q.push(2, 2, Priority::Small, now);
        let job = q.pop_eligible(|u| u != 1).unwrap();
        assert_eq!(job.id, 2);
        assert_eq!(q.len(), 1);
        assert!(q.pop_eligible(|u| u != 1).is_none());
        assert_eq!(q.pop_eligible(always).unwrap().id, 1);
    }

    #[test]
    fn ineligible_admin_lets_lower_class_run() {
        let now = Instant::now();
        let mut q = FairQueue::new(3);
        q.push(1, 1, Priority::Admin, now);
        q.push(2, 2, Priority::Large, now);
        assert_eq!(q.pop_eligible(|u| u == 2).unwrap().id, 2);
    }

    #[test]
    fn remove_and_position() {
        let now = Instant::now();
        let mut q = FairQueue::new(3);
        q.push(1, 1, Priority::Large, now);
        q.push(2, 1, Priority::Small, now);
        let pos = q.push(3, 2, Priority::Small, now);
        assert_eq!(pos, 2);
        assert_eq!(q.position(1), Some(3));
        assert_eq!(q.remove(2).unwrap().id, 2);
        assert_eq!(q.position(3), Some(1));
        assert!(q.remove(2).is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn eligible_views() {
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_secs(1);
        let mut q = FairQueue::new(3);
        q.push(1, 1, Priority::Small, t0);
        q.push(2, 2, Priority::Small, t1);
        assert_eq!(q.eligible_len(|u| u == 2), 1);
        assert_eq!(q.oldest_eligible(|u| u == 2), Some(t1));
        assert_eq!(q.oldest_eligible(always), Some(t0));
        assert_eq!(q.drain().len(), 2);
        assert!(q.is_empty());
    }
}
