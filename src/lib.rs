//! Dirty card queues for a generational, region-based garbage
//! collector.
//!
//! Mutator threads record inter-region pointer stores as dirty card
//! pointers in per-thread buffers ([`DirtyCardQueue`]); full buffers are
//! aggregated in a global pool owned by the [`DirtyCardQueueSet`], and
//! concurrent refinement workers (plus mutators themselves, once the
//! backlog crosses a threshold) drain the pool, delivering each card to
//! the embedder's [`CardRefinery`] to update remembered sets.
//!
//! The crate is an in-process library: the card table, the remembered
//! sets, the safepoint synchronizer and the thread registry all belong
//! to the embedding VM. What lives here is the queueing machinery that
//! sits on the hot path of every reference store and still has to
//! cooperate with safepoints, cooperative yielding and full collections:
//! a lock-free completed-buffer queue whose ABA defense is an epoch
//! counter tied to buffer recycling, a two-generation holding area for
//! buffers paused across a safepoint, and fine-grained statistics folded
//! at safepoints.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod buffer;
mod card;
mod dirty_card_queue;
mod dirty_card_queue_set;
mod queue;
pub mod refine;
pub mod util;

pub use crate::buffer::{BufferNode, BufferNodeAllocator, BufferNodeList};
pub use crate::card::CardPtr;
pub use crate::dirty_card_queue::DirtyCardQueue;
pub use crate::dirty_card_queue_set::DirtyCardQueueSet;
pub use crate::refine::{CardRefinery, RefineStats};
pub use crate::util::options::RefinementOptions;
pub use crate::util::suspendible::{NeverYield, SuspendibleThreadSet, YieldFlag};
