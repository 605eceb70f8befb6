//! The yield signal from the suspendible thread set.
//!
//! Refinement must not delay a pending safepoint, so the refinement loop
//! polls [`SuspendibleThreadSet::should_yield`] between cards and bails
//! out of the buffer when it is raised. The scheduler-level mechanism
//! itself lives in the VM; this is only the predicate the queues poll.

use atomic::Ordering;
use std::sync::atomic::AtomicBool;

pub trait SuspendibleThreadSet: Send + Sync {
    /// True when a safepoint is pending and cooperative threads should
    /// get to a yield point as soon as possible.
    fn should_yield(&self) -> bool;
}

/// A yield signal backed by a single flag, raised by the safepoint
/// initiator and cleared once the safepoint completes.
#[derive(Default)]
pub struct YieldFlag {
    requested: AtomicBool,
}

impl YieldFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }
}

impl SuspendibleThreadSet for YieldFlag {
    fn should_yield(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Never yields. For embedders without concurrent safepoints, and for
/// tests.
pub struct NeverYield;

impl SuspendibleThreadSet for NeverYield {
    fn should_yield(&self) -> bool {
        false
    }
}
