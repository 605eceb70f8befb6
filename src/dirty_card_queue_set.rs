//! The dirty card queue set: owner of the completed-buffer queue, the
//! paused buffers, the node allocator and the refinement statistics.
//!
//! Mutators fill per-thread [`DirtyCardQueue`]s; full buffers land in
//! the lock-free completed queue. Refinement workers (and mutators
//! drafted in by the backpressure threshold) pop buffers and feed each
//! card to the [`CardRefinery`]. A buffer interrupted by a yield request
//! is parked in the paused buffers until the pending safepoint passes;
//! a full collection abandons everything.

use atomic::Ordering;
use atomic_refcell::AtomicRefCell;
use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{BufferNode, BufferNodeAllocator, BufferNodeList, HeadTail};
use crate::card::CardPtr;
use crate::dirty_card_queue::DirtyCardQueue;
use crate::queue::{NonblockingQueue, PausedBuffers};
use crate::refine::{CardRefinery, FreeIdSet, RefineStats};
use crate::util::global_counter;
use crate::util::options::RefinementOptions;
use crate::util::safepoint::SafepointTracker;
use crate::util::suspendible::SuspendibleThreadSet;

/// How many spurious-empty pops to retry before treating the completed
/// queue as empty for this tick. Interference is rare and a miss only
/// delays refinement, so the budget is small.
const DEQUEUE_RETRIES: usize = 3;

pub struct DirtyCardQueueSet {
    /// Upper bound on the number of cards in the completed and paused
    /// buffers. Relaxed reads; exact only at a safepoint.
    num_cards: CachePadded<AtomicUsize>,
    /// If the queue holds more cards than this, mutators handing off a
    /// full buffer must do some of the refinement work themselves.
    mutator_refinement_threshold: CachePadded<AtomicUsize>,
    /// Buffers ready for refinement.
    completed: NonblockingQueue,
    /// Buffers whose refinement is paused until the next safepoint.
    paused: PausedBuffers,
    allocator: BufferNodeAllocator,
    free_ids: FreeIdSet,
    safepoint: SafepointTracker,
    refinery: Arc<dyn CardRefinery>,
    suspendible: Arc<dyn SuspendibleThreadSet>,
    options: RefinementOptions,
    /// Folded per-thread stats from safepoint concatenation. Mutated
    /// only under the safepoint invariant.
    concatenated_refinement_stats: AtomicRefCell<RefineStats>,
    /// Stats of threads that detached outside a safepoint.
    detached_refinement_stats: spin::Mutex<RefineStats>,
}

impl DirtyCardQueueSet {
    pub fn new(
        options: RefinementOptions,
        refinery: Arc<dyn CardRefinery>,
        suspendible: Arc<dyn SuspendibleThreadSet>,
    ) -> Self {
        options.validate();
        DirtyCardQueueSet {
            num_cards: CachePadded::new(AtomicUsize::new(0)),
            mutator_refinement_threshold: CachePadded::new(AtomicUsize::new(
                options.mutator_refinement_threshold,
            )),
            completed: NonblockingQueue::new(),
            paused: PausedBuffers::new(),
            allocator: BufferNodeAllocator::new(options.buffer_capacity),
            free_ids: FreeIdSet::new(options.num_par_ids()),
            safepoint: SafepointTracker::new(),
            refinery,
            suspendible,
            options,
            concatenated_refinement_stats: AtomicRefCell::new(RefineStats::new()),
            detached_refinement_stats: spin::Mutex::new(RefineStats::new()),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.allocator.buffer_capacity()
    }

    /// The number of parallel ids that can be claimed for
    /// card-processing work.
    pub fn num_par_ids(&self) -> u32 {
        self.options.num_par_ids()
    }

    pub fn allocator(&self) -> &BufferNodeAllocator {
        &self.allocator
    }

    /// The safepoint tracker the embedder drives around each pause.
    pub fn safepoint(&self) -> &SafepointTracker {
        &self.safepoint
    }

    /// Upper bound on the number of cards currently in this queue set.
    /// Read without synchronization; may be high while buffers are in
    /// motion.
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::Relaxed)
    }

    /// Number of cards above which mutator threads help refine.
    pub fn mutator_refinement_threshold(&self) -> usize {
        self.mutator_refinement_threshold.load(Ordering::Relaxed)
    }

    /// Set the number of cards above which mutator threads help refine.
    /// Takes effect on the next buffer handoff; the refinement control
    /// layer retunes this as the backlog changes.
    pub fn set_mutator_refinement_threshold(&self, value: usize) {
        self.mutator_refinement_threshold
            .store(value, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Enqueue side

    /// Record a dirty card from the write barrier. A single symbol for
    /// the whole fast-and-slow path, so emitted barriers have one call
    /// target on underflow.
    #[inline]
    pub fn enqueue(&self, queue: &mut DirtyCardQueue, card: CardPtr) {
        if !queue.try_enqueue(card) {
            self.handle_zero_index(queue);
            if !queue.try_enqueue(card) {
                unreachable!("store must succeed into a freshly installed buffer");
            }
        }
    }

    /// Slow path: the queue has no buffer, or a full one. Hand off a
    /// full buffer and attach a fresh one.
    fn handle_zero_index(&self, queue: &mut DirtyCardQueue) {
        if queue.has_buffer() {
            let node = queue.take_node();
            debug_assert!(unsafe { &*node }.is_full());
            self.handle_completed_buffer(node, queue.refinement_stats_mut());
        }
        let node = self.allocator.allocate();
        queue.install_node(node);
    }

    /// Add a completed buffer to the queue.
    pub fn enqueue_completed_buffer(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        let cards = unsafe { &*node }.entry_count();
        debug_assert!(cards > 0);
        self.num_cards.fetch_add(cards, Ordering::Relaxed);
        self.completed.push(node);
    }

    /// Enqueue a mutator's full buffer, and refine one buffer inline if
    /// the backlog is above the mutator refinement threshold. The more
    /// dirty cards outstanding, the more mutator cycles go into
    /// draining them.
    pub fn handle_completed_buffer(&self, node: *mut BufferNode, stats: &mut RefineStats) {
        self.enqueue_completed_buffer(node);
        let threshold = self.mutator_refinement_threshold();
        if self.num_cards() <= threshold {
            return;
        }
        let worker_id = self.free_ids.claim_par_id();
        self.refine_completed_buffer_concurrently(worker_id, threshold, stats);
        self.free_ids.release_par_id(worker_id);
    }

    /// Splice a foreign pre-linked buffer list (e.g. the evacuation
    /// redirty queue's output) onto the completed queue.
    pub fn merge_bufferlists(&self, src: BufferNodeList) {
        if src.is_empty() {
            return;
        }
        debug_assert!(unsafe { &*src.tail }.next_load(Ordering::Relaxed).is_null());
        self.num_cards.fetch_add(src.entry_count, Ordering::Relaxed);
        self.completed.append(src.head, src.tail);
    }

    // ------------------------------------------------------------------
    // Dequeue side

    /// One epoch-protected pop attempt.
    fn dequeue_completed_buffer(&self) -> *mut BufferNode {
        global_counter::critical_section(|| self.completed.try_pop()).unwrap_or(ptr::null_mut())
    }

    /// Remove and return a completed buffer, or null if none is
    /// (apparently) available after the retry budget.
    fn get_completed_buffer(&self) -> *mut BufferNode {
        for _ in 0..DEQUEUE_RETRIES {
            let node = self.dequeue_completed_buffer();
            if !node.is_null() {
                self.num_cards
                    .fetch_sub(unsafe { &*node }.entry_count(), Ordering::Relaxed);
                return node;
            }
        }
        ptr::null_mut()
    }

    // ------------------------------------------------------------------
    // Refinement

    /// Refine the cards in `node` from its index up to the capacity,
    /// checking the yield signal before each card. Returns true if the
    /// whole buffer was processed; on yield the node's index is left
    /// covering exactly the unprocessed tail.
    fn refine_buffer(
        &self,
        node: &mut BufferNode,
        worker_id: u32,
        stats: &mut RefineStats,
    ) -> bool {
        let capacity = node.capacity();
        let start = self.options.materialize_counters.then(Instant::now);
        let mut i = node.index();
        let mut fully_processed = true;
        while i < capacity {
            if self.suspendible.should_yield() {
                fully_processed = false;
                break;
            }
            self.refinery.refine_card(node.entry(i), worker_id);
            i += 1;
        }
        stats.refined_cards += i - node.index();
        node.set_index(i);
        if let Some(start) = start {
            stats.refinement_time += start.elapsed();
        }
        fully_processed
    }

    /// After refine_buffer: recycle a finished buffer, park a yielded
    /// one.
    fn handle_refined_buffer(
        &self,
        node: *mut BufferNode,
        fully_processed: bool,
        stats: &mut RefineStats,
    ) {
        if fully_processed {
            debug_assert!(unsafe { &*node }.is_empty());
            stats.refined_buffers += 1;
            self.allocator.release(node);
        } else {
            stats.yield_count += 1;
            trace!(
                "pausing buffer with {} unrefined cards",
                unsafe { &*node }.entry_count()
            );
            self.record_paused_buffer(node);
        }
    }

    /// Park a partially refined buffer for the next safepoint.
    /// precondition: not at safepoint.
    fn record_paused_buffer(&self, node: *mut BufferNode) {
        // The remaining cards are conceptually still queued.
        self.num_cards
            .fetch_add(unsafe { &*node }.entry_count(), Ordering::Relaxed);
        self.paused.add(node, &self.safepoint);
    }

    fn enqueue_paused_buffers_aux(&self, paused: HeadTail) {
        if !paused.is_empty() {
            // Cards in paused buffers never left num_cards.
            self.completed.append(paused.head, paused.tail);
        }
    }

    /// Transfer paused buffers from previous safepoints back to the
    /// completed queue. Each refiner does this before popping, so a
    /// paused list never outlives two safepoint boundaries.
    /// precondition: not at safepoint.
    fn enqueue_previous_paused_buffers(&self) {
        self.enqueue_paused_buffers_aux(self.paused.take_previous(&self.safepoint));
    }

    /// precondition: at safepoint.
    fn enqueue_all_paused_buffers(&self) {
        self.enqueue_paused_buffers_aux(self.paused.take_all(&self.safepoint));
    }

    /// If more than `stop_at` cards are queued, pop one buffer and
    /// refine it; returns false when there is (apparently) nothing to
    /// do. Stops mid-buffer on a yield request, parking the remainder.
    pub fn refine_completed_buffer_concurrently(
        &self,
        worker_id: u32,
        stop_at: usize,
        stats: &mut RefineStats,
    ) -> bool {
        debug_assert!(worker_id < self.num_par_ids());
        if self.num_cards() <= stop_at {
            return false;
        }
        self.enqueue_previous_paused_buffers();
        let node = self.get_completed_buffer();
        if node.is_null() {
            return false;
        }
        let fully_processed = self.refine_buffer(unsafe { &mut *node }, worker_id, stats);
        self.handle_refined_buffer(node, fully_processed, stats);
        true
    }

    /// Front end for dedicated refinement threads: claims a worker id
    /// (blocking until one is free), performs one refinement step,
    /// releases the id.
    pub fn refine_one(&self, stop_at: usize, stats: &mut RefineStats) -> bool {
        let worker_id = self.free_ids.claim_par_id();
        let result = self.refine_completed_buffer_concurrently(worker_id, stop_at, stats);
        self.free_ids.release_par_id(worker_id);
        result
    }

    // ------------------------------------------------------------------
    // Safepoint operations

    /// Verify `num_cards` against the completed queue. Only meaningful
    /// when no enqueue/dequeue is in flight, i.e. at a safepoint with
    /// the paused buffers already drained.
    #[cfg(debug_assertions)]
    fn verify_num_cards(&self) {
        assert_eq!(
            self.completed.entry_count(),
            self.num_cards(),
            "num_cards out of sync with completed queue"
        );
    }

    #[cfg(not(debug_assertions))]
    fn verify_num_cards(&self) {}

    /// Drain the completed queue and the paused buffers into one list
    /// with the exact card count.
    /// precondition: at safepoint.
    pub fn take_all_completed_buffers(&self) -> BufferNodeList {
        debug_assert!(self.safepoint.is_at_safepoint());
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        let all = self.completed.take_all();
        let entry_count = self.num_cards.swap(0, Ordering::Relaxed);
        BufferNodeList {
            head: all.head,
            tail: all.tail,
            entry_count,
        }
    }

    fn abandon_completed_buffers(&self) {
        self.enqueue_all_paused_buffers();
        self.verify_num_cards();
        let all = self.completed.take_all();
        self.num_cards.store(0, Ordering::Relaxed);
        let mut node = all.head;
        let mut buffers = 0usize;
        while !node.is_null() {
            let next = unsafe { &*node }.next_load(Ordering::Relaxed);
            unsafe { &*node }.next_store(ptr::null_mut(), Ordering::Relaxed);
            self.allocator.release(node);
            node = next;
            buffers += 1;
        }
        debug!("abandoned {} completed buffers", buffers);
    }

    /// A full collection makes all queued refinement work irrelevant:
    /// recycle every buffer in the queue, the paused lists and the given
    /// per-thread queues, and reset all statistics. Afterwards
    /// `num_cards() == 0`.
    /// precondition: at safepoint.
    pub fn abandon_logs_and_stats<'a, I>(&self, queues: I)
    where
        I: IntoIterator<Item = &'a mut DirtyCardQueue>,
    {
        debug_assert!(self.safepoint.is_at_safepoint());
        self.abandon_completed_buffers();
        for queue in queues {
            queue.refinement_stats_mut().reset();
            if queue.has_buffer() {
                self.allocator.release(queue.take_node());
            }
        }
        self.concatenated_refinement_stats.borrow_mut().reset();
        self.detached_refinement_stats.lock().reset();
    }

    /// Flush a thread's partial buffer: enqueue it if it holds cards,
    /// recycle it if empty. Called at thread detach and from the
    /// safepoint concatenation pass.
    pub fn flush_queue(&self, queue: &mut DirtyCardQueue) {
        if !queue.has_buffer() {
            return;
        }
        let node = queue.take_node();
        if unsafe { &*node }.is_empty() {
            self.allocator.release(node);
        } else {
            self.enqueue_completed_buffer(node);
        }
    }

    /// Flush `queue` and fold its stats into the concatenated totals.
    /// Returns the folded delta; the queue's own stats are reset.
    /// precondition: at safepoint.
    pub fn concatenate_log_and_stats(&self, queue: &mut DirtyCardQueue) -> RefineStats {
        debug_assert!(self.safepoint.is_at_safepoint());
        self.flush_queue(queue);
        let delta = *queue.refinement_stats();
        *self.concatenated_refinement_stats.borrow_mut() += delta;
        queue.refinement_stats_mut().reset();
        delta
    }

    /// Fold `stats` (e.g. a refinement worker's) plus everything from
    /// detached threads into the concatenated totals.
    /// precondition: at safepoint.
    pub fn update_refinement_stats(&self, stats: RefineStats) {
        debug_assert!(self.safepoint.is_at_safepoint());
        let mut concatenated = self.concatenated_refinement_stats.borrow_mut();
        *concatenated += stats;
        let mut detached = self.detached_refinement_stats.lock();
        *concatenated += *detached;
        detached.reset();
    }

    /// Total refinement stats over all concatenated threads.
    /// precondition: at safepoint, after the concatenation pass.
    pub fn concatenated_refinement_stats(&self) -> RefineStats {
        debug_assert!(self.safepoint.is_at_safepoint());
        *self.concatenated_refinement_stats.borrow()
    }

    /// Thread-safe fold for a thread exiting outside a safepoint.
    pub fn record_detached_refinement_stats(&self, stats: RefineStats) {
        *self.detached_refinement_stats.lock() += stats;
    }
}

impl Drop for DirtyCardQueueSet {
    fn drop(&mut self) {
        // Hand every node back to the allocator's storage; its Drop
        // frees them. No concurrency at teardown.
        let completed = self.completed.take_all();
        let paused = self.paused.take_any();
        for list in [completed, paused] {
            let mut node = list.head;
            while !node.is_null() {
                let next = unsafe { &*node }.next_load(Ordering::Relaxed);
                BufferNodeAllocator::delete(node);
                node = next;
            }
        }
    }
}
