use cq_reactor::transport::memory::MemoryQueue;
use cq_reactor::{Engine, OperationResult};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Log = Arc<Mutex<Vec<(&'static str, OperationResult)>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn record(log: &Log, name: &'static str) -> impl FnOnce(OperationResult, &Engine) + Send + 'static {
    let log = log.clone();
    move |result: OperationResult, _: &Engine| log.lock().unwrap().push((name, result))
}

fn must_not_run() {
    unreachable!("posted work must not run during teardown");
}

fn refuse_shutdown(_: OperationResult, _: &Engine) {
    panic!("entry refused shutdown");
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_initiate_shutdown_completes_notify_when_done_entries_once() {
    init_tracing();
    let engine = Engine::new(MemoryQueue::new());
    let log = Log::default();

    for name in ["a", "b", "c"] {
        assert!(engine.notify_when_done(record(&log, name)).is_some());
    }
    assert_eq!(engine.outstanding_work(), 3);

    engine.initiate_shutdown();
    engine.initiate_shutdown();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("a", OperationResult::ShutdownFailure),
            ("b", OperationResult::ShutdownFailure),
            ("c", OperationResult::ShutdownFailure),
        ],
        "Every entry completes exactly once"
    );
    assert_eq!(engine.outstanding_work(), 0);
    assert!(engine.is_shutdown());

    let late = engine.notify_when_done(record(&log, "late"));
    assert!(late.is_none(), "Entries added after shutdown complete at once");
    assert_eq!(
        log.lock().unwrap().last(),
        Some(&("late", OperationResult::ShutdownFailure))
    );
}

#[test]
fn test_finished_entry_is_not_completed_again_at_shutdown() {
    let engine = Engine::new(MemoryQueue::new());
    let log = Log::default();

    let handle = engine.notify_when_done(record(&log, "call")).unwrap();
    assert!(engine.finish_notify_when_done(handle, OperationResult::Success));
    assert!(
        !engine.finish_notify_when_done(handle, OperationResult::Success),
        "Second finish is a no-op"
    );

    engine.initiate_shutdown();

    assert_eq!(
        *log.lock().unwrap(),
        vec![("call", OperationResult::Success)]
    );
    assert_eq!(engine.outstanding_work(), 0);
}

#[test]
fn test_pending_records_complete_with_shutdown_results() {
    init_tracing();
    let queue = Arc::new(MemoryQueue::new());
    let engine = Engine::new(queue.clone());
    let log = Log::default();
    let ran = Arc::new(AtomicBool::new(false));

    let ready = engine.register(record(&log, "ready"));
    queue.complete(ready, true);

    let armed = engine.register(record(&log, "armed"));
    queue.alarm(Instant::now() + Duration::from_secs(60), armed);

    let posted = ran.clone();
    engine.post(move || posted.store(true, Ordering::SeqCst));

    engine.initiate_shutdown();
    assert!(engine.run().unwrap());

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("ready", OperationResult::ShutdownSuccess),
            ("armed", OperationResult::ShutdownFailure),
        ]
    );
    assert!(
        !ran.load(Ordering::SeqCst),
        "Posted work is not run after shutdown"
    );
    assert_eq!(engine.outstanding_work(), 0);
}

#[test]
fn test_initiate_delivers_alarm_outcome_to_handler() {
    let queue = Arc::new(MemoryQueue::new());
    let engine = Engine::new(queue.clone());
    let fired = Arc::new(Mutex::new(Vec::new()));

    let first = fired.clone();
    engine
        .initiate(
            move |ok: bool| first.lock().unwrap().push(ok),
            |tag| queue.alarm(Instant::now() + Duration::from_millis(10), tag),
        )
        .unwrap();

    let second = fired.clone();
    let tag = engine
        .initiate(
            move |ok: bool| second.lock().unwrap().push(ok),
            |tag| queue.alarm(Instant::now() + Duration::from_secs(60), tag),
        )
        .unwrap();

    assert!(queue.cancel_alarm(tag));
    assert!(!queue.cancel_alarm(tag), "Alarm was already cancelled");

    engine.run().unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![false, true]);
    assert_eq!(queue.pending(), 0);
}

#[test]
fn test_shutdown_destroys_pending_handlers_without_invoking_them() {
    let queue = Arc::new(MemoryQueue::new());
    let engine = Engine::new(queue.clone());
    let invoked = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    let guard = DropCounter(dropped.clone());
    let calls = invoked.clone();
    engine
        .initiate(
            move |_ok: bool| {
                let _guard = &guard;
                calls.fetch_add(1, Ordering::SeqCst);
            },
            |tag| queue.alarm(Instant::now() + Duration::from_secs(60), tag),
        )
        .unwrap();

    drop(engine);

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert!(queue.is_shutdown());
}

#[test]
fn test_dropping_engine_completes_unreported_records() {
    let log = Log::default();
    let engine = Engine::new(MemoryQueue::new());

    engine.register(record(&log, "orphan"));
    engine.post(must_not_run);

    drop(engine);

    assert_eq!(
        *log.lock().unwrap(),
        vec![("orphan", OperationResult::ShutdownFailure)]
    );
}

#[test]
fn test_panicking_entry_does_not_strand_shutdown() {
    init_tracing();
    let queue = Arc::new(MemoryQueue::new());
    let engine = Engine::new(queue.clone());
    let log = Log::default();

    engine.notify_when_done(refuse_shutdown).unwrap();
    engine.notify_when_done(record(&log, "after")).unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.initiate_shutdown()));

    assert!(outcome.is_err(), "The entry's panic reaches the caller");
    assert!(queue.is_shutdown(), "The transport is shut down regardless");
    assert_eq!(
        *log.lock().unwrap(),
        vec![("after", OperationResult::ShutdownFailure)],
        "Entries behind the panicking one still complete"
    );
    assert_eq!(engine.outstanding_work(), 0);

    engine.initiate_shutdown();
    assert_eq!(log.lock().unwrap().len(), 1);

    drop(engine);
}
