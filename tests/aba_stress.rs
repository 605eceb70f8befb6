//! Continuous producers and consumers over one shared allocator.
//!
//! Buffer nodes are recycled aggressively (small capacity, hot free
//! list), so any hole in the pop-side ABA defense shows up as a card
//! delivered twice, a card lost, or a crash. The refinery records every
//! delivery and the test checks the multisets match.

use cardq::{
    CardPtr, CardRefinery, DirtyCardQueue, DirtyCardQueueSet, NeverYield, RefineStats,
    RefinementOptions,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct RecordingRefinery {
    seen: Mutex<Vec<CardPtr>>,
}

impl CardRefinery for RecordingRefinery {
    fn refine_card(&self, card: CardPtr, _worker_id: u32) {
        self.seen.lock().unwrap().push(card);
    }
}

#[test]
fn two_producers_two_consumers() {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 2;
    const CARDS_PER_PRODUCER: usize = 100_000;

    let _ = env_logger::builder().is_test(true).try_init();

    let refinery = Arc::new(RecordingRefinery {
        seen: Mutex::new(Vec::new()),
    });
    let options = RefinementOptions {
        // Tiny buffers keep nodes cycling through the free list.
        buffer_capacity: 16,
        mutator_refinement_threshold: usize::MAX,
        refinement_threads: CONSUMERS,
        mutator_helpers: PRODUCERS,
        materialize_counters: false,
    };
    let qset = Arc::new(DirtyCardQueueSet::new(
        options,
        refinery.clone(),
        Arc::new(NeverYield),
    ));
    let producing = Arc::new(AtomicBool::new(true));

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let qset = qset.clone();
        producers.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut queue = DirtyCardQueue::new();
            for i in 0..CARDS_PER_PRODUCER {
                let card = CardPtr::from_usize((p * CARDS_PER_PRODUCER + i + 1) * 512);
                qset.enqueue(&mut queue, card);
                // Jitter the schedule so handoffs interleave with pops
                // in more ways than a tight loop would produce.
                if rng.gen_ratio(1, 1024) {
                    std::thread::yield_now();
                }
            }
            qset.flush_queue(&mut queue);
        }));
    }

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let qset = qset.clone();
        let producing = producing.clone();
        consumers.push(std::thread::spawn(move || {
            let mut stats = RefineStats::new();
            loop {
                if qset.refine_one(0, &mut stats) {
                    continue;
                }
                if !producing.load(Ordering::Acquire) && qset.num_cards() == 0 {
                    return stats;
                }
                std::thread::yield_now();
            }
        }));
    }

    for producer in producers {
        producer.join().unwrap();
    }
    producing.store(false, Ordering::Release);

    let mut total = RefineStats::new();
    for consumer in consumers {
        total += consumer.join().unwrap();
    }

    let seen = refinery.seen.lock().unwrap();
    assert_eq!(seen.len(), PRODUCERS * CARDS_PER_PRODUCER, "cards lost");
    let distinct: HashSet<usize> = seen.iter().map(|c| c.as_usize()).collect();
    assert_eq!(
        distinct.len(),
        PRODUCERS * CARDS_PER_PRODUCER,
        "card delivered twice"
    );
    assert_eq!(total.refined_cards, PRODUCERS * CARDS_PER_PRODUCER);
    assert_eq!(total.yield_count, 0);
    // Recycling actually happened; otherwise this test proves nothing.
    let allocator = qset.allocator();
    assert!(allocator.free_count() + allocator.pending_count() > 0);
}
