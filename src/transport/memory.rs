//! In-process completion channel.
//!
//! [`MemoryQueue`] stands in for a real transport: operations are "started" by
//! arming an alarm or are completed directly with [`MemoryQueue::complete`], and
//! the engine drains the resulting events through [`CompletionQueue::next`].
//!
//! Alarms are kept as a plain list of `(deadline, tag)` pairs and fired when
//! their deadline has passed; a blocked `next` sleeps on a condition variable
//! until either an event is pushed or the nearest alarm (or its own deadline)
//! expires.
//!
//! # Example
//!
//! ```ignore
//! use cq_reactor::transport::memory::MemoryQueue;
//! use cq_reactor::Engine;
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! let queue = Arc::new(MemoryQueue::new());
//! let engine = Engine::new(queue.clone());
//!
//! engine.initiate(|ok: bool| println!("alarm fired: {ok}"), |tag| {
//!     queue.alarm(Instant::now() + Duration::from_millis(5), tag);
//! })?;
//!
//! engine.run()?;
//! ```

use crate::transport::{CallContext, CompletionQueue, Deadline, Event, Next, Tag};

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Default)]
struct State {
    events: VecDeque<Event>,
    alarms: Vec<(Instant, Tag)>,
    shutdown: bool,
}

impl State {
    /// Moves every alarm whose deadline has passed onto the event list.
    fn fire_expired(&mut self, now: Instant) {
        let events = &mut self.events;

        self.alarms.retain(|(deadline, tag)| {
            if now >= *deadline {
                events.push_back(Event { tag: *tag, ok: true });
                false
            } else {
                true
            }
        });
    }

    fn next_alarm(&self) -> Option<Instant> {
        self.alarms.iter().map(|(deadline, _)| *deadline).min()
    }
}

/// Completion channel backed by a mutex-protected event list and alarm set.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    ready: Condvar,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports the operation tagged `tag` as finished.
    pub fn complete(&self, tag: Tag, ok: bool) {
        self.state.lock().events.push_back(Event { tag, ok });
        self.ready.notify_one();
    }

    /// Arms an alarm that completes `tag` with `ok = true` at `deadline`.
    ///
    /// After shutdown the alarm completes immediately with `ok = false`.
    pub fn alarm(&self, deadline: Instant, tag: Tag) {
        let mut state = self.state.lock();

        if state.shutdown {
            state.events.push_back(Event { tag, ok: false });
        } else {
            state.alarms.push((deadline, tag));
        }

        drop(state);
        self.ready.notify_one();
    }

    /// Cancels a pending alarm, completing it right away with `ok = false`.
    ///
    /// Returns `false` if no alarm with that tag was pending.
    pub fn cancel_alarm(&self, tag: Tag) -> bool {
        let mut state = self.state.lock();
        let Some(position) = state.alarms.iter().position(|(_, t)| *t == tag) else {
            return false;
        };

        state.alarms.swap_remove(position);
        state.events.push_back(Event { tag, ok: false });

        drop(state);
        self.ready.notify_one();
        true
    }

    /// Number of events plus alarms not yet delivered.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.events.len() + state.alarms.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl CompletionQueue for MemoryQueue {
    fn next(&self, deadline: Deadline) -> Next {
        let limit = deadline.instant();
        let mut state = self.state.lock();

        loop {
            let now = Instant::now();
            state.fire_expired(now);

            if let Some(event) = state.events.pop_front() {
                return Next::Event(event);
            }

            if state.shutdown && state.alarms.is_empty() {
                return Next::Shutdown;
            }

            if limit.is_some_and(|limit| now >= limit) {
                return Next::Timeout;
            }

            let wake_at = match (limit, state.next_alarm()) {
                (Some(limit), Some(alarm)) => Some(limit.min(alarm)),
                (limit, alarm) => limit.or(alarm),
            };

            match wake_at {
                Some(instant) => {
                    self.ready.wait_until(&mut state, instant);
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    fn notify(&self, tag: Tag) {
        self.complete(tag, true);
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }

        state.shutdown = true;

        // Outstanding alarms are flushed as failures, the way a transport
        // fails operations that can no longer run.
        let alarms = std::mem::take(&mut state.alarms);
        state
            .events
            .extend(alarms.into_iter().map(|(_, tag)| Event { tag, ok: false }));

        drop(state);
        self.ready.notify_all();
    }
}

/// Call context that only records cancellation requests.
#[derive(Debug, Default)]
pub struct MemoryCall {
    cancelled: AtomicBool,
    cancel_requests: AtomicUsize,
}

impl MemoryCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// How many times [`CallContext::try_cancel`] was invoked on this call.
    pub fn cancel_requests(&self) -> usize {
        self.cancel_requests.load(Ordering::Acquire)
    }
}

impl CallContext for MemoryCall {
    fn try_cancel(&self) {
        self.cancel_requests.fetch_add(1, Ordering::AcqRel);
        self.cancelled.store(true, Ordering::Release);
    }
}
