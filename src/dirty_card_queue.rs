//! The per-thread dirty card queue: the write barrier's front end.

use memoffset::offset_of;
use std::ptr;

use crate::buffer::BufferNode;
use crate::card::CardPtr;
use crate::refine::RefineStats;

/// A thread-local buffer of dirty card pointers, filled top-down by the
/// write barrier and handed to the
/// [`DirtyCardQueueSet`](crate::DirtyCardQueueSet) when full.
///
/// The first two fields sit at fixed offsets
/// ([`byte_offset_of_index`](DirtyCardQueue::byte_offset_of_index),
/// [`byte_offset_of_buf`](DirtyCardQueue::byte_offset_of_buf)) so
/// JIT-emitted barrier code can decrement the index and store through
/// the buffer pointer without calling into the library, except on
/// underflow.
///
/// The queue holds only a non-owning association with its queue set:
/// every operation that can allocate, hand off or recycle a buffer is a
/// method of the set taking the queue as an argument. Consequently a
/// queue must be flushed (or abandoned) through its set before being
/// dropped; dropping a queue with an attached buffer is a programmer
/// error.
#[repr(C)]
pub struct DirtyCardQueue {
    /// Next free slot in the current buffer, counting down from the
    /// capacity. Zero means full.
    index: usize,
    /// Base of the current buffer's entry array; null when no buffer is
    /// attached.
    buf: *mut CardPtr,
    /// The node backing `buf`.
    node: *mut BufferNode,
    refinement_stats: RefineStats,
}

impl DirtyCardQueue {
    pub fn new() -> Self {
        DirtyCardQueue {
            index: 0,
            buf: ptr::null_mut(),
            node: ptr::null_mut(),
            refinement_stats: RefineStats::new(),
        }
    }

    /// Byte offset of the decrementing index, for barrier emitters.
    pub fn byte_offset_of_index() -> usize {
        offset_of!(DirtyCardQueue, index)
    }

    /// Byte offset of the entry-array base pointer, for barrier
    /// emitters.
    pub fn byte_offset_of_buf() -> usize {
        offset_of!(DirtyCardQueue, buf)
    }

    pub fn refinement_stats(&self) -> &RefineStats {
        &self.refinement_stats
    }

    pub fn refinement_stats_mut(&mut self) -> &mut RefineStats {
        &mut self.refinement_stats
    }

    /// Whether a buffer is currently attached.
    pub fn has_buffer(&self) -> bool {
        !self.node.is_null()
    }

    /// The fast path: store `card` in the next slot. False on underflow
    /// or when no buffer is attached; the caller then goes through the
    /// queue set's slow path. No allocation, no atomics.
    #[inline]
    pub(crate) fn try_enqueue(&mut self, card: CardPtr) -> bool {
        if self.buf.is_null() || self.index == 0 {
            return false;
        }
        self.index -= 1;
        unsafe { self.buf.add(self.index).write(card) };
        true
    }

    /// Attach an empty node.
    pub(crate) fn install_node(&mut self, node: *mut BufferNode) {
        debug_assert!(self.node.is_null());
        debug_assert!(!node.is_null());
        let node_ref = unsafe { &mut *node };
        debug_assert!(node_ref.is_empty());
        self.index = node_ref.capacity();
        self.buf = node_ref.entries_base();
        self.node = node;
    }

    /// Detach the current node, syncing its index from the barrier
    /// field.
    pub(crate) fn take_node(&mut self) -> *mut BufferNode {
        debug_assert!(!self.node.is_null());
        let node = self.node;
        unsafe { &mut *node }.set_index(self.index);
        self.index = 0;
        self.buf = ptr::null_mut();
        self.node = ptr::null_mut();
        node
    }
}

impl Default for DirtyCardQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DirtyCardQueue {
    fn drop(&mut self) {
        debug_assert!(
            self.node.is_null(),
            "dirty card queue dropped without a flush through its queue set"
        );
    }
}

// A queue is owned by exactly one thread at a time; detach hands it (or
// its buffer) over through the queue set.
unsafe impl Send for DirtyCardQueue {}
