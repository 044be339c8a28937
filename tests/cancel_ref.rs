use cq_reactor::transport::memory::MemoryCall;
use cq_reactor::{CallHandle, CancelRef};

use std::thread;

#[test]
fn test_drop_without_clear_cancels_once() {
    let call = MemoryCall::new();

    {
        let reference = CancelRef::new(&call);
        assert!(!reference.is_null());
    }

    assert_eq!(call.cancel_requests(), 1, "Drop should cancel exactly once");
    assert!(call.is_cancelled());
}

#[test]
fn test_clear_then_drop_does_not_cancel() {
    let call = MemoryCall::new();

    let reference = CancelRef::new(&call);
    reference.clear();
    assert!(reference.is_null());
    drop(reference);

    assert_eq!(call.cancel_requests(), 0, "A finished call is never cancelled");
}

#[test]
fn test_assigning_over_an_active_reference_cancels_the_previous_call() {
    let first = MemoryCall::new();
    let second = MemoryCall::new();

    let mut reference = CancelRef::new(&first);
    assert!(!reference.is_null());

    reference = CancelRef::new(&second);
    assert_eq!(first.cancel_requests(), 1);
    assert_eq!(second.cancel_requests(), 0);

    reference.clear();
    drop(reference);

    assert_eq!(first.cancel_requests(), 1, "The first call is never touched again");
    assert_eq!(second.cancel_requests(), 0);
}

#[test]
fn test_replace_through_a_shared_reference() {
    let first = MemoryCall::new();
    let second = MemoryCall::new();

    let reference = CancelRef::new(&first);
    reference.replace(CancelRef::new(&second));

    assert_eq!(first.cancel_requests(), 1);
    assert_eq!(second.cancel_requests(), 0);
    assert!(std::ptr::eq(reference.context().unwrap(), &second));

    drop(reference);
    assert_eq!(first.cancel_requests(), 1);
    assert_eq!(second.cancel_requests(), 1);
}

#[test]
fn test_moved_from_reference_is_inert() {
    let call = MemoryCall::new();

    let source = CancelRef::new(&call);
    let target = source.take();

    drop(source);
    assert_eq!(call.cancel_requests(), 0);

    target.cancel();
    target.cancel();
    assert_eq!(call.cancel_requests(), 2, "Explicit cancel may repeat");

    target.clear();
    drop(target);
    assert_eq!(call.cancel_requests(), 2);
}

#[test]
fn test_empty_reference_does_nothing() {
    let reference = CancelRef::<MemoryCall>::default();

    assert!(reference.is_null());
    assert!(reference.context().is_none());
    reference.cancel();
}

#[test]
fn test_call_handle_tracks_writes_done_and_finish() {
    let call = MemoryCall::new();
    let handle = CallHandle::new(&call);

    assert!(!handle.is_finished());
    assert!(!handle.is_writes_done());

    handle.set_writes_done();
    assert!(handle.is_writes_done());
    assert!(!handle.is_finished(), "Half-closing does not finish the call");

    handle.set_finished();
    assert!(handle.is_finished());

    drop(handle);
    assert_eq!(call.cancel_requests(), 0);
}

#[test]
fn test_unfinished_call_handle_cancels_on_drop() {
    let call = MemoryCall::new();

    let handle = CallHandle::new(&call);
    handle.set_writes_done();
    let moved = handle.take();

    assert!(handle.is_finished());
    assert!(moved.is_writes_done(), "State bits travel with the call");

    drop(handle);
    drop(moved);

    assert_eq!(call.cancel_requests(), 1);
}

#[test]
fn test_call_handle_cancel_from_another_thread() {
    let call = MemoryCall::new();
    let handle = CallHandle::new(&call);

    thread::scope(|scope| {
        scope.spawn(|| handle.cancel());
    });

    assert!(call.is_cancelled());
    assert!(!handle.is_finished(), "Cancelling does not finish the call");

    handle.set_finished();
    drop(handle);
    assert_eq!(call.cancel_requests(), 1);
}
