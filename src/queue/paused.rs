//! Buffers paused across a safepoint.
//!
//! Refinement may stop mid-buffer when a safepoint is pending. Such a
//! buffer cannot go straight back onto the completed queue: a consumer
//! still inside its pop could observe the same node pointer at the head
//! again and succeed an out-of-window CAS, re-establishing the ABA the
//! epoch scheme exists to prevent. Instead the buffer is parked here,
//! tagged with the safepoint it awaits, and reintroduced only after that
//! safepoint has passed, a moment at which no consumer can be mid-pop.
//!
//! There is at most one live list at a time, because callers must drain
//! buffers from previous safepoints before parking new ones. Many list
//! instances can exist transiently while threads race to install the
//! next list or dispose of a previous one.

use atomic::Ordering;
use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::buffer::{BufferNode, HeadTail};
use crate::util::global_counter;
use crate::util::safepoint::{SafepointId, SafepointTracker};

/// Nodes paused for one specific safepoint.
struct PausedList {
    head: AtomicPtr<BufferNode>,
    /// Written once, by the thread that links the first node; read only
    /// by the taker, after all adders are quiesced.
    tail: AtomicPtr<BufferNode>,
    safepoint_id: SafepointId,
}

impl PausedList {
    /// A list for the next upcoming safepoint.
    /// precondition: not at safepoint.
    fn new(safepoint: &SafepointTracker) -> Self {
        PausedList {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            safepoint_id: safepoint.next_safepoint_id(),
        }
    }

    /// True if this list was created to hold buffers for the next
    /// safepoint.
    /// precondition: not at safepoint.
    fn is_next(&self, safepoint: &SafepointTracker) -> bool {
        debug_assert!(!safepoint.is_at_safepoint());
        self.safepoint_id == safepoint.next_safepoint_id()
    }

    /// True if the safepoint this list was created for has passed.
    fn is_previous(&self, safepoint: &SafepointTracker) -> bool {
        self.safepoint_id <= safepoint.safepoint_id()
    }

    /// Thread-safe prepend.
    /// precondition: not at safepoint; `is_next()`.
    fn add(&self, node: *mut BufferNode) {
        debug_assert!(unsafe { &*node }.next_load(Ordering::Relaxed).is_null());
        let old_head = self.head.swap(node, Ordering::AcqRel);
        if old_head.is_null() {
            self.tail.store(node, Ordering::Release);
        } else {
            // Transiently the chain is broken at `node`; the only
            // traversal happens at take(), after every adder is done.
            unsafe { &*node }.next_store(old_head, Ordering::Release);
        }
    }

    /// Take all the buffers from the list. Not thread-safe.
    fn take(&self) -> HeadTail {
        HeadTail {
            head: self.head.load(Ordering::Acquire),
            tail: self.tail.load(Ordering::Acquire),
        }
    }
}

/// The holding area for paused buffers; owns at most one live
/// [`PausedList`] through `plist`.
pub(crate) struct PausedBuffers {
    plist: CachePadded<AtomicPtr<PausedList>>,
}

impl PausedBuffers {
    pub(crate) fn new() -> Self {
        PausedBuffers {
            plist: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Park `node` for the next safepoint.
    /// precondition: not at safepoint.
    /// precondition: no paused buffers from a previous safepoint (the
    /// caller reintroduces those first).
    pub(crate) fn add(&self, node: *mut BufferNode, safepoint: &SafepointTracker) {
        debug_assert!(!safepoint.is_at_safepoint());
        // The critical section keeps a concurrent take_previous from
        // freeing the list between our load and our prepend.
        global_counter::critical_section(|| {
            let mut list = self.plist.load(Ordering::Acquire);
            if list.is_null() {
                let fresh = Box::into_raw(Box::new(PausedList::new(safepoint)));
                match self.plist.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => list = fresh,
                    Err(installed) => {
                        // Lost the install race.
                        drop(unsafe { Box::from_raw(fresh) });
                        list = installed;
                    }
                }
            }
            let list_ref = unsafe { &*list };
            debug_assert!(list_ref.is_next(safepoint), "previous paused buffers not drained");
            list_ref.add(node);
        });
    }

    /// Take all paused buffers from previous safepoints.
    /// precondition: not at safepoint.
    pub(crate) fn take_previous(&self, safepoint: &SafepointTracker) -> HeadTail {
        debug_assert!(!safepoint.is_at_safepoint());
        let previous = global_counter::critical_section(|| {
            let list = self.plist.load(Ordering::Acquire);
            if list.is_null() || !unsafe { &*list }.is_previous(safepoint) {
                return ptr::null_mut();
            }
            // Detach; a loser either saw null or a list someone else is
            // disposing of, and reports empty.
            match self
                .plist
                .compare_exchange(list, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => list,
                Err(_) => ptr::null_mut(),
            }
        });
        if previous.is_null() {
            return HeadTail::empty();
        }
        // Threads that loaded the pointer before the detach may still be
        // examining the list; wait them out before freeing it.
        global_counter::write_synchronize();
        let list = unsafe { Box::from_raw(previous) };
        list.take()
    }

    /// Take all the paused buffers regardless of generation.
    /// precondition: at safepoint.
    pub(crate) fn take_all(&self, safepoint: &SafepointTracker) -> HeadTail {
        debug_assert!(safepoint.is_at_safepoint());
        self.take_any()
    }

    /// Detach whatever list exists, with no safepoint checks. For
    /// take_all and queue-set teardown, where no adder can be racing.
    pub(crate) fn take_any(&self) -> HeadTail {
        let list = self.plist.swap(ptr::null_mut(), Ordering::AcqRel);
        if list.is_null() {
            HeadTail::empty()
        } else {
            let list = unsafe { Box::from_raw(list) };
            list.take()
        }
    }
}

impl Drop for PausedBuffers {
    fn drop(&mut self) {
        // Any remaining list is freed; its nodes belong to whoever tears
        // down the queue set.
        let list = self.plist.swap(ptr::null_mut(), Ordering::Relaxed);
        if !list.is_null() {
            drop(unsafe { Box::from_raw(list) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferNodeAllocator;

    fn collect(list: HeadTail) -> Vec<*mut BufferNode> {
        let mut nodes = Vec::new();
        let mut node = list.head;
        while !node.is_null() {
            nodes.push(node);
            node = unsafe { &*node }.next_load(Ordering::Relaxed);
        }
        nodes
    }

    #[test]
    fn take_previous_is_empty_for_next_list() {
        let safepoint = SafepointTracker::new();
        let allocator = BufferNodeAllocator::new(4);
        let paused = PausedBuffers::new();
        let node = allocator.allocate();
        paused.add(node, &safepoint);
        // The list awaits safepoint 1, which has not happened.
        assert!(paused.take_previous(&safepoint).is_empty());
        safepoint.begin();
        safepoint.end();
        let taken = paused.take_previous(&safepoint);
        assert_eq!(collect(taken), vec![node]);
        allocator.release(node);
    }

    #[test]
    fn take_all_ignores_generation() {
        let safepoint = SafepointTracker::new();
        let allocator = BufferNodeAllocator::new(4);
        let paused = PausedBuffers::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        paused.add(a, &safepoint);
        paused.add(b, &safepoint);
        safepoint.begin();
        let taken = paused.take_all(&safepoint);
        // Prepend order: most recent first.
        assert_eq!(collect(taken), vec![b, a]);
        safepoint.end();
        for node in [a, b] {
            allocator.release(node);
        }
    }

    #[test]
    fn concurrent_adds_all_arrive() {
        use std::sync::Arc;
        let safepoint = Arc::new(SafepointTracker::new());
        let allocator = Arc::new(BufferNodeAllocator::new(4));
        let paused = Arc::new(PausedBuffers::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let safepoint = safepoint.clone();
            let allocator = allocator.clone();
            let paused = paused.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    paused.add(allocator.allocate(), &safepoint);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        safepoint.begin();
        let taken = paused.take_all(&safepoint);
        let nodes = collect(taken);
        assert_eq!(nodes.len(), 2000);
        safepoint.end();
        for node in nodes {
            allocator.release(node);
        }
    }
}
