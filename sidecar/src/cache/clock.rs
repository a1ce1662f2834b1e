//! Access clock for LRU ordering.
//!
//! Wall-clock milliseconds can repeat (two accesses in the same
//! millisecond) or step backwards. Eviction order must not, so every stamp
//! handed out is strictly greater than the previous one.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::unix_millis;

#[derive(Debug, Default)]
pub(crate) struct AccessClock {
    last: AtomicU64,
}

impl AccessClock {
    /// Raises the floor to at least `stamp`, e.g. the newest stamp on disk.
    pub fn observe(&self, stamp: u64) {
        self.last.fetch_max(stamp, Ordering::SeqCst);
    }

    /// Returns a stamp greater than every stamp returned or observed so far.
    pub fn now(&self) -> u64 {
        let wall = unix_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        wall.max(previous.saturating_add(1))
    }
}
