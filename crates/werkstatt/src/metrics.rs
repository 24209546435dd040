//! Per-worker counters and pool-wide aggregation.
//!
//! Each worker's listener loop owns its [`WorkerStats`] and republishes them
//! after every change, so reading stats never has to wait on the loop.

use serde::Serialize;

use crate::worker::WorkerState;

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub tag: String,
    pub state: WorkerState,
    /// Requests waiting for a reply right now.
    pub pending: usize,
    /// Requests accepted and sent into the context.
    pub dispatched: u64,
    /// Replies that carried a successful result.
    pub completed: u64,
    /// Replies that carried a task failure.
    pub failed: u64,
    /// Requests whose caller stopped waiting before the reply arrived.
    pub timed_out: u64,
    /// Requests resolved with `WorkerKilled`.
    pub cancelled: u64,
}

impl WorkerStats {
    pub(crate) fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            state: WorkerState::Unstarted,
            pending: 0,
            dispatched: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
        }
    }
}

/// Stats for every member of a pool, in member order, plus totals.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    pub total_pending: usize,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

impl PoolStats {
    pub fn from_workers(workers: Vec<WorkerStats>) -> Self {
        Self {
            total_pending: workers.iter().map(|w| w.pending).sum(),
            total_dispatched: workers.iter().map(|w| w.dispatched).sum(),
            total_completed: workers.iter().map(|w| w.completed).sum(),
            total_failed: workers.iter().map(|w| w.failed).sum(),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_totals_sum_members() {
        let mut a = WorkerStats::new("a");
        a.dispatched = 3;
        a.completed = 2;
        a.pending = 1;
        let mut b = WorkerStats::new("b");
        b.dispatched = 4;
        b.failed = 1;

        let stats = PoolStats::from_workers(vec![a, b]);
        assert_eq!(stats.total_dispatched, 7);
        assert_eq!(stats.total_completed, 2);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_pending, 1);
        assert_eq!(stats.workers[0].tag, "a");
    }

    #[test]
    fn stats_serialize_state_in_snake_case() {
        let json = serde_json::to_value(WorkerStats::new("w")).unwrap();
        assert_eq!(json["state"], "unstarted");
        assert_eq!(json["pending"], 0);
    }
}
