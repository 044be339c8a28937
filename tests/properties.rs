use cq_reactor::transport::memory::MemoryQueue;
use cq_reactor::{Deadline, Engine, InvokeMode, OperationResult};

use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_record_completes_exactly_once(producers in 1usize..6, per_producer in 1usize..64) {
        let engine = Arc::new(Engine::new(MemoryQueue::new()));
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..producers * per_producer).map(|_| AtomicUsize::new(0)).collect());

        // Held until every producer has submitted, so run cannot return early.
        engine.work_started();

        let handles: Vec<_> = (0..producers)
            .map(|producer| {
                let engine = engine.clone();
                let counts = counts.clone();
                thread::spawn(move || {
                    for index in 0..per_producer {
                        let counts = counts.clone();
                        engine.submit(move |result: OperationResult, _: &Engine| {
                            assert_eq!(result, OperationResult::Success);
                            counts[producer * per_producer + index].fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        let closer = {
            let engine = engine.clone();
            thread::spawn(move || {
                for handle in handles {
                    handle.join().unwrap();
                }
                engine.work_finished();
            })
        };

        engine.run().unwrap();
        closer.join().unwrap();

        prop_assert!(counts.iter().all(|count| count.load(Ordering::SeqCst) == 1));
        prop_assert_eq!(engine.outstanding_work(), 0);
    }

    #[test]
    fn prop_local_submissions_keep_order(ids in proptest::collection::vec(any::<u16>(), 1..50)) {
        let engine = Engine::new(MemoryQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut running = engine.enter().unwrap();

        for id in ids.iter().copied() {
            let log = log.clone();
            engine.submit(move |_: OperationResult, _: &Engine| log.lock().unwrap().push(id));
        }

        while running.run_one(Deadline::Immediate, InvokeMode::Normal) {}
        drop(running);

        let recorded = log.lock().unwrap().clone();
        prop_assert_eq!(recorded, ids);
        prop_assert_eq!(engine.outstanding_work(), 0);
    }
}
