//! Concurrent refinement support: the hook into the remembered-set
//! layer, worker-id bounding and per-thread statistics.

pub mod free_id_set;
pub mod stats;

pub use self::free_id_set::FreeIdSet;
pub use self::stats::RefineStats;

use crate::card::CardPtr;

/// The card-refinement hook.
///
/// The queue set delivers each dequeued card pointer here exactly once
/// (absent a full-GC abandon). Interpreting the card, i.e. scanning it
/// and updating region remembered sets, belongs entirely to the
/// implementor. `worker_id` is the claimed id in `[0, num_par_ids)`,
/// usable as a key for per-worker scratch structures.
///
/// Failures are not modeled at this layer: an implementation that cannot
/// refine a card must handle that itself or abort.
pub trait CardRefinery: Send + Sync {
    fn refine_card(&self, card: CardPtr, worker_id: u32);
}
