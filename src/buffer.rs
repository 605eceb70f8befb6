//! Buffer nodes and their free-list allocator.
//!
//! A [`BufferNode`] is a fixed-capacity array of card pointers with an
//! intrusive `next` link, used by the per-thread queues, the completed
//! queue, the paused lists and the allocator's free list in turn. A node
//! has exactly one owner at any moment; the link field is only ever
//! written by that owner or under the lock-free protocol of the list the
//! node currently sits in.

use atomic::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use crate::card::CardPtr;
use crate::util::global_counter;

/// A buffer of dirty card pointers.
///
/// `index` is the next free slot counting down from the top: entries at
/// `[index, capacity)` are live, entries at `[0, index)` are undefined.
/// A node is full at `index == 0` and empty at `index == capacity`.
pub struct BufferNode {
    next: AtomicPtr<BufferNode>,
    index: usize,
    entries: Box<[CardPtr]>,
}

impl BufferNode {
    /// Allocate a fresh, empty node outside any free list.
    pub(crate) fn boxed(capacity: usize) -> *mut BufferNode {
        debug_assert!(capacity > 0);
        Box::into_raw(Box::new(BufferNode {
            next: AtomicPtr::new(ptr::null_mut()),
            index: capacity,
            entries: vec![CardPtr::ZERO; capacity].into_boxed_slice(),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        debug_assert!(index <= self.capacity());
        self.index = index;
    }

    pub fn is_empty(&self) -> bool {
        self.index == self.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.index == 0
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.capacity() - self.index
    }

    pub fn entry(&self, i: usize) -> CardPtr {
        debug_assert!(i >= self.index && i < self.capacity());
        self.entries[i]
    }

    pub(crate) fn set_entry(&mut self, i: usize, card: CardPtr) {
        self.entries[i] = card;
    }

    /// Base of the entry array. Stable for the life of the node; the
    /// write barrier publishes it.
    pub(crate) fn entries_base(&mut self) -> *mut CardPtr {
        self.entries.as_mut_ptr()
    }

    /// Successor in whatever list the node currently sits in. For
    /// walking a detached [`BufferNodeList`]; null at the tail.
    pub fn next(&self) -> *mut BufferNode {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn next_load(&self, order: Ordering) -> *mut BufferNode {
        self.next.load(order)
    }

    pub(crate) fn next_store(&self, next: *mut BufferNode, order: Ordering) {
        self.next.store(next, order);
    }

    pub(crate) fn next_atomic(&self) -> &AtomicPtr<BufferNode> {
        &self.next
    }
}

/// Head and tail of a list of nodes linked through their `next` fields,
/// with the total live entry count. Used for bulk moves between the
/// queue set and its collaborators.
pub struct BufferNodeList {
    pub head: *mut BufferNode,
    pub tail: *mut BufferNode,
    pub entry_count: usize,
}

impl BufferNodeList {
    pub fn empty() -> Self {
        BufferNodeList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            entry_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

// The list is a hand-off of exclusively owned nodes.
unsafe impl Send for BufferNodeList {}

/// Like [`BufferNodeList`] but without the entry count; internal bulk
/// moves that have already accounted their cards use this.
#[derive(Clone, Copy)]
pub(crate) struct HeadTail {
    pub(crate) head: *mut BufferNode,
    pub(crate) tail: *mut BufferNode,
}

impl HeadTail {
    pub(crate) fn empty() -> Self {
        HeadTail {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// Desired minimum batch before retired nodes are transferred to the
/// allocatable free list. There is relatively little importance to the
/// specific number; it bounds how much we spend on synchronization when
/// the release rate is high.
const PENDING_TRANSFER_THRESHOLD: usize = 10;

/// Supplies uniformly-sized nodes, recycling released ones.
///
/// Released nodes first go to a push-only *pending* stack. A single
/// transferrer detaches the whole pending stack, waits for a
/// global-counter quiescence, and only then splices the batch onto the
/// allocatable free list. The quiescence closes the window in which a
/// queue popper that lost a race may still be examining a released
/// node's link field, so the free list itself can be popped with a plain
/// CAS inside a critical section without ABA.
pub struct BufferNodeAllocator {
    buffer_capacity: usize,
    free_list: AtomicPtr<BufferNode>,
    free_count: AtomicUsize,
    pending_list: AtomicPtr<BufferNode>,
    pending_count: AtomicUsize,
    transfer_lock: spin::Mutex<()>,
}

impl BufferNodeAllocator {
    pub fn new(buffer_capacity: usize) -> Self {
        assert!(buffer_capacity > 0);
        BufferNodeAllocator {
            buffer_capacity,
            free_list: AtomicPtr::new(ptr::null_mut()),
            free_count: AtomicUsize::new(0),
            pending_list: AtomicPtr::new(ptr::null_mut()),
            pending_count: AtomicUsize::new(0),
            transfer_lock: spin::Mutex::new(()),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Nodes currently allocatable without heap allocation. Approximate.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Released nodes awaiting transfer. Approximate.
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Return an empty node (`index == capacity`, unlinked).
    pub(crate) fn allocate(&self) -> *mut BufferNode {
        let node = global_counter::critical_section(|| {
            let mut head = self.free_list.load(Ordering::Acquire);
            while !head.is_null() {
                let next = unsafe { &*head }.next_load(Ordering::Acquire);
                match self.free_list.compare_exchange_weak(
                    head,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => head = observed,
                }
            }
            head
        });
        if node.is_null() {
            // Free list exhausted; fall through to the heap. Allocation
            // failure aborts, which is the right outcome when the
            // collector cannot make progress.
            BufferNode::boxed(self.buffer_capacity)
        } else {
            self.free_count.fetch_sub(1, Ordering::Relaxed);
            let node_ref = unsafe { &mut *node };
            debug_assert_eq!(node_ref.capacity(), self.buffer_capacity);
            node_ref.next_store(ptr::null_mut(), Ordering::Relaxed);
            node_ref.set_index(self.buffer_capacity);
            node
        }
    }

    /// Recycle a node. The caller must have made the node unreachable
    /// from every queue and list; stale observers from lost pop races
    /// are waited out before the node becomes allocatable again.
    pub(crate) fn release(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        // Push onto the pending stack. Pushes never dereference the
        // observed head, so the loop is ABA-immune.
        let mut head = self.pending_list.load(Ordering::Relaxed);
        loop {
            unsafe { &*node }.next_store(head, Ordering::Relaxed);
            match self.pending_list.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        let pending = self.pending_count.fetch_add(1, Ordering::Relaxed) + 1;
        if pending > PENDING_TRANSFER_THRESHOLD {
            self.try_transfer_pending();
        }
    }

    /// Move the pending batch to the free list after a quiescence. At
    /// most one thread transfers at a time; contenders just skip.
    fn try_transfer_pending(&self) {
        let _guard = match self.transfer_lock.try_lock() {
            Some(guard) => guard,
            None => return,
        };
        let head = self.pending_list.swap(ptr::null_mut(), Ordering::AcqRel);
        if head.is_null() {
            return;
        }
        let mut tail = head;
        let mut count = 1;
        loop {
            let next = unsafe { &*tail }.next_load(Ordering::Relaxed);
            if next.is_null() {
                break;
            }
            tail = next;
            count += 1;
        }
        self.pending_count.fetch_sub(count, Ordering::Relaxed);

        global_counter::write_synchronize();

        trace!("transferring {} buffer nodes to the free list", count);
        let mut old_head = self.free_list.load(Ordering::Relaxed);
        loop {
            unsafe { &*tail }.next_store(old_head, Ordering::Relaxed);
            match self.free_list.compare_exchange_weak(
                old_head,
                head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => old_head = observed,
            }
        }
        self.free_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Free a node that never reaches the recycle path (teardown).
    pub(crate) fn delete(node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        drop(unsafe { Box::from_raw(node) });
    }
}

impl Drop for BufferNodeAllocator {
    fn drop(&mut self) {
        for list in [
            self.free_list.load(Ordering::Relaxed),
            self.pending_list.load(Ordering::Relaxed),
        ] {
            let mut node = list;
            while !node.is_null() {
                let next = unsafe { &*node }.next_load(Ordering::Relaxed);
                Self::delete(node);
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_empty_node() {
        let allocator = BufferNodeAllocator::new(16);
        let node = allocator.allocate();
        let node_ref = unsafe { &*node };
        assert_eq!(node_ref.capacity(), 16);
        assert!(node_ref.is_empty());
        assert!(!node_ref.is_full());
        assert_eq!(node_ref.entry_count(), 0);
        allocator.release(node);
    }

    #[test]
    fn release_feeds_pending_then_free() {
        let allocator = BufferNodeAllocator::new(4);
        let mut nodes = Vec::new();
        for _ in 0..(PENDING_TRANSFER_THRESHOLD * 2) {
            nodes.push(allocator.allocate());
        }
        for node in nodes {
            allocator.release(node);
        }
        // Crossing the threshold must have transferred at least one
        // batch to the free list.
        assert!(allocator.free_count() > 0);
        assert!(allocator.pending_count() <= PENDING_TRANSFER_THRESHOLD);
    }

    #[test]
    fn recycled_node_is_reset() {
        let allocator = BufferNodeAllocator::new(8);
        let node = allocator.allocate();
        unsafe {
            (*node).set_index(3);
            (*node).set_entry(3, CardPtr::from_usize(0x1000));
        }
        // Push enough nodes through to force a transfer and get the
        // same storage back.
        allocator.release(node);
        let mut extra = Vec::new();
        for _ in 0..(PENDING_TRANSFER_THRESHOLD + 1) {
            extra.push(allocator.allocate());
        }
        for n in extra {
            allocator.release(n);
        }
        let recycled = allocator.allocate();
        assert!(unsafe { &*recycled }.is_empty());
        allocator.release(recycled);
    }

    #[test]
    fn concurrent_allocate_release() {
        use std::sync::Arc;
        let allocator = Arc::new(BufferNodeAllocator::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let node = allocator.allocate();
                    assert!(unsafe { &*node }.is_empty());
                    allocator.release(node);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
