//! Bridge telemetry.
//!
//! Lock-free counters updated as requests settle, copied into a
//! [`BridgeStats`] snapshot for display.
//!
//! ```text
//! TaskBridge ─────► BridgeMetrics ─────► BridgeStats ─────► Views
//!                   (atomic counters)    (point-in-time)    (CLI, UI)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for request outcomes.
#[derive(Debug, Default)]
pub(crate) struct BridgeMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
}

impl BridgeMetrics {
    pub fn request_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// A message arrived for no live request, or could not be decoded.
    pub fn message_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queued: usize, in_flight: usize, pending: usize) -> BridgeStats {
        BridgeStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            queued,
            in_flight,
            pending,
        }
    }
}

/// Point-in-time view of bridge activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Requests accepted by `submit`/`execute` (each retry attempt counts).
    pub submitted: u64,
    /// Requests resolved with a success response.
    pub completed: u64,
    /// Requests rejected by the worker or lost to a closed channel.
    pub failed: u64,
    /// Requests whose deadline expired.
    pub timed_out: u64,
    /// Requests cancelled by the caller.
    pub cancelled: u64,
    /// Inbound messages dropped as unroutable or malformed.
    pub discarded: u64,
    /// Requests waiting for a concurrency slot.
    pub queued: usize,
    /// Requests transmitted and awaiting a terminal response.
    pub in_flight: usize,
    /// All requests not yet settled.
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = BridgeMetrics::default();
        metrics.request_submitted();
        metrics.request_submitted();
        metrics.request_completed();
        metrics.request_timed_out();
        metrics.message_discarded();

        let stats = metrics.snapshot(4, 2, 6);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.queued, 4);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.pending, 6);
    }
}
