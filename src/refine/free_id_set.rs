//! Claim and release of a bounded set of worker ids.
//!
//! Refinement workers and mutators doing inline refinement claim an id
//! in `[0, num_par_ids)` for the duration of one refinement step. The
//! bound lets the remembered-set layer key statically sized per-worker
//! scratch structures by id.

use std::sync::{Condvar, Mutex};

pub struct FreeIdSet {
    sync: Mutex<FreeIdSetSync>,
    /// Signalled when an id is returned.
    available: Condvar,
}

struct FreeIdSetSync {
    /// Free ids, claimed from the back.
    free: Vec<u32>,
}

impl FreeIdSet {
    pub fn new(num_par_ids: u32) -> Self {
        assert!(num_par_ids > 0);
        FreeIdSet {
            sync: Mutex::new(FreeIdSetSync {
                free: (0..num_par_ids).rev().collect(),
            }),
            available: Condvar::new(),
        }
    }

    /// Claim an id, blocking until one is free.
    pub fn claim_par_id(&self) -> u32 {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if let Some(id) = sync.free.pop() {
                return id;
            }
            sync = self.available.wait(sync).unwrap();
        }
    }

    /// Claim an id if one is free right now.
    pub fn try_claim_par_id(&self) -> Option<u32> {
        self.sync.lock().unwrap().free.pop()
    }

    /// Return a previously claimed id.
    pub fn release_par_id(&self, id: u32) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(!sync.free.contains(&id), "id {} double-released", id);
        sync.free.push(id);
        drop(sync);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn claims_are_distinct() {
        let set = FreeIdSet::new(3);
        let a = set.claim_par_id();
        let b = set.claim_par_id();
        let c = set.claim_par_id();
        let mut ids = vec![a, b, c];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(set.try_claim_par_id(), None);
        set.release_par_id(b);
        assert_eq!(set.try_claim_par_id(), Some(b));
    }

    #[test]
    fn claim_blocks_until_release() {
        let set = Arc::new(FreeIdSet::new(1));
        let id = set.claim_par_id();
        let waiter = {
            let set = set.clone();
            std::thread::spawn(move || set.claim_par_id())
        };
        // The waiter cannot finish until we release.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        set.release_par_id(id);
        assert_eq!(waiter.join().unwrap(), id);
    }

    #[test]
    fn hammered_claims_stay_bounded() {
        let set = Arc::new(FreeIdSet::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let id = set.claim_par_id();
                    assert!(id < 4);
                    set.release_par_id(id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
