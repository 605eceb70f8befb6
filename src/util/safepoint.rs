//! Safepoint generation tracking.
//!
//! The VM's safepoint synchronizer is outside this crate; the embedder
//! brackets each stop-the-world pause with [`SafepointTracker::begin`]
//! and [`SafepointTracker::end`]. The tracker exists so the paused-buffer
//! machinery can tag lists with the safepoint they await, and so
//! safepoint-only operations can assert their precondition.

use atomic::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64};

/// Identifies one safepoint. Ids are assigned in order, starting at 1.
pub type SafepointId = u64;

pub struct SafepointTracker {
    /// Number of safepoints that have begun. The id of the most recent
    /// safepoint, started or completed.
    count: AtomicU64,
    active: AtomicBool,
}

impl SafepointTracker {
    pub fn new() -> Self {
        SafepointTracker {
            count: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Enter a safepoint. All mutator threads must already be stopped;
    /// this crate only records the fact.
    pub fn begin(&self) {
        assert!(
            !self.active.swap(true, Ordering::SeqCst),
            "nested safepoint"
        );
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Leave the current safepoint.
    pub fn end(&self) {
        assert!(self.active.swap(false, Ordering::SeqCst), "not in a safepoint");
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Id of the most recent safepoint (started or completed); 0 before
    /// the first.
    pub fn safepoint_id(&self) -> SafepointId {
        self.count.load(Ordering::SeqCst)
    }

    /// Id the next safepoint will carry. Only meaningful outside a
    /// safepoint.
    pub fn next_safepoint_id(&self) -> SafepointId {
        debug_assert!(!self.is_at_safepoint());
        self.safepoint_id() + 1
    }
}

impl Default for SafepointTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_advance_per_safepoint() {
        let sp = SafepointTracker::new();
        assert_eq!(sp.safepoint_id(), 0);
        assert_eq!(sp.next_safepoint_id(), 1);
        sp.begin();
        assert!(sp.is_at_safepoint());
        assert_eq!(sp.safepoint_id(), 1);
        sp.end();
        assert!(!sp.is_at_safepoint());
        assert_eq!(sp.safepoint_id(), 1);
        assert_eq!(sp.next_safepoint_id(), 2);
    }

    #[test]
    #[should_panic(expected = "nested safepoint")]
    fn nested_begin_panics() {
        let sp = SafepointTracker::new();
        sp.begin();
        sp.begin();
    }
}
