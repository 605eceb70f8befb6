//! Accumulators for concurrent refinement work.

use std::ops::{AddAssign, SubAssign};
use std::time::Duration;

/// Per-thread counters for refinement activity.
///
/// An instance is owned by one thread (a mutator's dirty card queue or a
/// refinement worker) and is never read by another thread except during
/// the safepoint concatenation pass, so the fields are plain data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefineStats {
    /// Cards delivered to the refinement hook.
    pub refined_cards: usize,
    /// Buffers processed to completion.
    pub refined_buffers: usize,
    /// Times refinement stopped mid-buffer on a yield request.
    pub yield_count: usize,
    /// Wall time spent in the refinement loop. Only maintained when the
    /// queue set materializes counters.
    pub refinement_time: Duration,
}

impl RefineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl AddAssign for RefineStats {
    fn add_assign(&mut self, other: RefineStats) {
        self.refined_cards += other.refined_cards;
        self.refined_buffers += other.refined_buffers;
        self.yield_count += other.yield_count;
        self.refinement_time += other.refinement_time;
    }
}

impl SubAssign for RefineStats {
    fn sub_assign(&mut self, other: RefineStats) {
        self.refined_cards -= other.refined_cards;
        self.refined_buffers -= other.refined_buffers;
        self.yield_count -= other.yield_count;
        self.refinement_time -= other.refinement_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_delta() {
        let mut total = RefineStats::new();
        let step = RefineStats {
            refined_cards: 100,
            refined_buffers: 2,
            yield_count: 1,
            refinement_time: Duration::from_micros(250),
        };
        total += step;
        total += step;
        assert_eq!(total.refined_cards, 200);
        assert_eq!(total.refined_buffers, 4);
        total -= step;
        assert_eq!(total.yield_count, 1);
        assert_eq!(total.refinement_time, Duration::from_micros(250));
    }

    #[test]
    fn reset_zeroes() {
        let mut stats = RefineStats {
            refined_cards: 7,
            ..Default::default()
        };
        assert!(!stats.is_zero());
        stats.reset();
        assert!(stats.is_zero());
    }
}
