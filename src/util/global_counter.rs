//! A process-wide monotonically advancing counter used for deferred
//! reclamation.
//!
//! Readers wrap accesses to reclamation-sensitive pointers in
//! [`critical_section`]. Writers make a node unreachable, then call
//! [`write_synchronize`]; when it returns, every critical section that
//! could have observed the old pointer has exited, so the node may be
//! reused. This is the only deferred-reclamation mechanism in the crate:
//! it keeps the completed-buffer queue and the node free list safe from
//! ABA without per-node reference counts.
//!
//! The quiescence model is per-thread checkpoint cells with SeqCst
//! ordering on both section entry and synchronize. Entry publishes the
//! observed counter value with the low bit set; synchronize bumps the
//! counter and spins until every registered cell is either inactive or
//! carries a value at least as new as the bump. A cell whose entry store
//! lands after the synchronizing scan necessarily performs its protected
//! loads after the writer's unlink, so missing it is benign.

use atomic::Ordering;
use crossbeam::utils::CachePadded;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

/// Low bit of a checkpoint cell: set while the owning thread is inside a
/// critical section. The rest of the cell holds the counter value
/// observed on entry.
const COUNTER_ACTIVE: usize = 1;

/// The counter advances in steps of 2, keeping the low bit free for
/// [`COUNTER_ACTIVE`].
const COUNTER_STRIDE: usize = 2;

/// `a >= b` under wraparound, assuming the two values are within half the
/// counter range of each other.
fn counter_ge(a: usize, b: usize) -> bool {
    a.wrapping_sub(b) as isize >= 0
}

/// Per-thread checkpoint cell. Zero when the thread is outside any
/// critical section.
struct CheckpointCell {
    value: AtomicUsize,
}

impl CheckpointCell {
    fn enter(&self, global: &AtomicUsize) {
        debug_assert_eq!(
            self.value.load(Ordering::Relaxed) & COUNTER_ACTIVE,
            0,
            "critical sections do not nest"
        );
        let observed = global.load(Ordering::SeqCst);
        self.value.store(observed | COUNTER_ACTIVE, Ordering::SeqCst);
        // The fence orders the cell publication before the section's
        // protected loads against a synchronizer's unlink-then-scan;
        // either the scan sees this cell, or the loads see the unlink.
        atomic::fence(Ordering::SeqCst);
    }

    fn exit(&self) {
        debug_assert_ne!(self.value.load(Ordering::Relaxed) & COUNTER_ACTIVE, 0);
        self.value.store(0, Ordering::Release);
    }

    fn is_quiescent(&self, since: usize) -> bool {
        let v = self.value.load(Ordering::SeqCst);
        (v & COUNTER_ACTIVE) == 0 || counter_ge(v & !COUNTER_ACTIVE, since)
    }
}

struct GlobalCounter {
    counter: CachePadded<AtomicUsize>,
    /// All registered checkpoint cells. A cell whose only remaining
    /// reference is this registry belongs to an exited thread and is
    /// swept during synchronize.
    cells: Mutex<Vec<Arc<CheckpointCell>>>,
}

impl GlobalCounter {
    fn new() -> Self {
        GlobalCounter {
            // Start past zero so an inactive cell (0) is never a valid
            // observed value.
            counter: CachePadded::new(AtomicUsize::new(COUNTER_STRIDE)),
            cells: Mutex::new(Vec::new()),
        }
    }

    fn register(&self) -> Arc<CheckpointCell> {
        let cell = Arc::new(CheckpointCell {
            value: AtomicUsize::new(0),
        });
        self.cells.lock().unwrap().push(cell.clone());
        cell
    }

    fn write_synchronize(&self) {
        let new = self.counter.fetch_add(COUNTER_STRIDE, Ordering::SeqCst) + COUNTER_STRIDE;
        let mut cells = self.cells.lock().unwrap();
        cells.retain(|cell| {
            // Exited threads leave an inactive cell behind; drop it.
            Arc::strong_count(cell) > 1 || !cell.is_quiescent(new)
        });
        for cell in cells.iter() {
            let mut spins = 0usize;
            while !cell.is_quiescent(new) {
                spins += 1;
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

lazy_static! {
    static ref GLOBAL_COUNTER: GlobalCounter = GlobalCounter::new();
}

thread_local! {
    static CHECKPOINT: Arc<CheckpointCell> = GLOBAL_COUNTER.register();
}

/// Exits the critical section even on unwind; a panicking reader must not
/// wedge every later `write_synchronize`.
struct SectionGuard<'a>(&'a CheckpointCell);

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Run `f` inside a reader critical section of the global counter.
///
/// Pointers popped from an epoch-protected structure may be dereferenced
/// only within the section that performed the pop. Sections do not nest,
/// and calling [`write_synchronize`] from inside one deadlocks (it would
/// wait on the caller's own cell).
pub fn critical_section<R, F: FnOnce() -> R>(f: F) -> R {
    CHECKPOINT.with(|cell| {
        cell.enter(&GLOBAL_COUNTER.counter);
        let _guard = SectionGuard(cell);
        f()
    })
}

/// Advance the counter and wait until every critical section that might
/// have observed state preceding the call has exited.
pub fn write_synchronize() {
    CHECKPOINT.with(|cell| {
        debug_assert_eq!(
            cell.value.load(Ordering::Relaxed) & COUNTER_ACTIVE,
            0,
            "write_synchronize inside a critical section would deadlock"
        );
    });
    GLOBAL_COUNTER.write_synchronize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn critical_section_returns_value() {
        let x = critical_section(|| 42);
        assert_eq!(x, 42);
    }

    #[test]
    fn synchronize_without_readers_completes() {
        write_synchronize();
        write_synchronize();
    }

    #[test]
    fn synchronize_waits_for_open_section() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let entered = entered.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                critical_section(|| {
                    entered.wait();
                    while !release.load(Ordering::Acquire) {
                        std::thread::yield_now();
                    }
                });
            })
        };

        entered.wait();
        let synchronizer = {
            let done = done.clone();
            std::thread::spawn(move || {
                write_synchronize();
                done.store(true, Ordering::Release);
            })
        };

        // The reader's section is still open, so synchronize must not
        // have finished.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::Acquire));

        release.store(true, Ordering::Release);
        reader.join().unwrap();
        synchronizer.join().unwrap();
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn sections_after_synchronize_do_not_block_it() {
        // A section entered strictly after the bump must not be waited
        // on; run a few rounds concurrently to shake the retain sweep.
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    critical_section(|| std::hint::spin_loop());
                }
            })
        };
        for _ in 0..100 {
            write_synchronize();
        }
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
    }
}
