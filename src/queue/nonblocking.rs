//! A lock-free multi-producer multi-consumer queue of buffer nodes.
//!
//! Singly linked through the nodes' intrusive `next` fields, FIFO per
//! producer, no global order across producers. Pushes are wait-free
//! aside from the tail exchange; pops are lock-free and may spuriously
//! report the queue empty when they lose a race (callers retry a bounded
//! number of times and then treat the queue as empty for the tick).
//!
//! # ABA safety
//!
//! [`try_pop`](NonblockingQueue::try_pop) must run inside a
//! [`global_counter::critical_section`](crate::util::global_counter).
//! A popped node may not be recycled until a `write_synchronize` has
//! completed after the pop; the node allocator's pending-transfer step
//! provides exactly that. Under this rule a loser of the head CAS can
//! hold a stale head pointer safely: the node it names cannot reappear
//! at the head of the queue while the loser's critical section is open,
//! so the stale CAS is guaranteed to fail rather than succeed wrongly.
//!
//! # The final node
//!
//! Popping the last node is the delicate case: a producer that has
//! already exchanged the tail may still be about to write that node's
//! `next` field. A consumer therefore claims the final node by CASing
//! the *tail* to null first. Success proves no producer obtained the
//! node from a tail exchange (the tail never returns to a node that
//! stayed in the queue), so the consumer owns it exclusively; failure is
//! reported as spurious empty. Producers finding a null tail seed the
//! head themselves, and never touch the claimed node.

use atomic::Ordering;
use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::buffer::{BufferNode, HeadTail};

pub(crate) struct NonblockingQueue {
    head: CachePadded<AtomicPtr<BufferNode>>,
    tail: CachePadded<AtomicPtr<BufferNode>>,
}

impl NonblockingQueue {
    pub(crate) fn new() -> Self {
        NonblockingQueue {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Append a single node. Multi-producer safe; never fails.
    pub(crate) fn push(&self, node: *mut BufferNode) {
        self.append(node, node);
    }

    /// Splice a pre-linked sublist `first..=last` onto the tail.
    /// Multi-producer safe, and safe against concurrent pops.
    pub(crate) fn append(&self, first: *mut BufferNode, last: *mut BufferNode) {
        debug_assert!(!first.is_null() && !last.is_null());
        debug_assert!(unsafe { &*last }.next_load(Ordering::Relaxed).is_null());
        let old_tail = self.tail.swap(last, Ordering::AcqRel);
        if old_tail.is_null() {
            // Queue was empty (or its final node was just claimed); we
            // own head seeding.
            self.head.store(first, Ordering::Release);
        } else {
            // old_tail is still reachable in the queue: a consumer never
            // detaches a node while the tail points at it, and the tail
            // cannot return to it afterwards. We are the unique writer
            // of its next field.
            unsafe { &*old_tail }.next_store(first, Ordering::Release);
        }
    }

    /// Pop the head node, or `None` if the queue is empty *or a
    /// concurrent operation interfered*. Must be called inside a
    /// global-counter critical section.
    pub(crate) fn try_pop(&self) -> Option<*mut BufferNode> {
        let node = self.head.load(Ordering::Acquire);
        if node.is_null() {
            return None;
        }
        let next = unsafe { &*node }.next_load(Ordering::Acquire);
        if !next.is_null() {
            // Interior node: detach by swinging the head. The critical
            // section guarantees a stale `node` cannot be back at the
            // head, so success here is authoritative.
            match self
                .head
                .compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { &*node }.next_store(ptr::null_mut(), Ordering::Relaxed);
                    Some(node)
                }
                Err(_) => None,
            }
        } else {
            // Possibly the final node. Claim it through the tail; see
            // the module comment for why this is the only safe order.
            if self.tail.load(Ordering::Acquire) != node {
                // An in-flight push will link node.next shortly, or the
                // node is already claimed. Either way, try again later.
                return None;
            }
            if self
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
            // Exclusive claim. Clear the head unless a producer has
            // already re-seeded it.
            let _ = self.head.compare_exchange(
                node,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug_assert!(unsafe { &*node }.next_load(Ordering::Relaxed).is_null());
            Some(node)
        }
    }

    /// Detach the whole queue. Not thread-safe; the caller must be at a
    /// safepoint with no push, pop or append in flight.
    pub(crate) fn take_all(&self) -> HeadTail {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        self.tail.store(ptr::null_mut(), Ordering::Relaxed);
        debug_assert_eq!(head.is_null(), tail.is_null());
        HeadTail { head, tail }
    }

    /// Sum of live entries over all queued nodes. Not thread-safe; used
    /// by debug verification at safepoints.
    #[cfg(debug_assertions)]
    pub(crate) fn entry_count(&self) -> usize {
        let mut total = 0;
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            let node_ref = unsafe { &*node };
            total += node_ref.entry_count();
            node = node_ref.next_load(Ordering::Acquire);
        }
        total
    }
}
