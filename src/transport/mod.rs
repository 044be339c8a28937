//! Interface to the RPC transport's completion channel.
//!
//! The engine never talks to a wire. It only needs three things from the
//! transport underneath it:
//!
//! - a blocking, tag-addressed completion channel ([`CompletionQueue::next`])
//! - a way to make that channel yield a chosen tag promptly ([`CompletionQueue::notify`]),
//!   used for cross-thread wake-ups
//! - a way to request cancellation of a live call ([`CallContext::try_cancel`])
//!
//! [`memory::MemoryQueue`] is an in-process implementation with alarms, used by
//! the tests and by embedders that want the engine without a real transport.
//!
//! # Example
//!
//! ```ignore
//! use cq_reactor::transport::{CompletionQueue, Deadline, Next};
//!
//! match queue.next(Deadline::after(Duration::from_millis(10))) {
//!     Next::Event(event) => println!("tag {:?} finished, ok = {}", event.tag, event.ok),
//!     Next::Timeout => println!("nothing happened"),
//!     Next::Shutdown => println!("queue drained"),
//! }
//! ```

pub mod memory;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque value correlating a completion event with the record that is waiting for it.
///
/// Real tags are handed out by [`Engine::register`](crate::Engine::register).
/// [`Tag::WAKE_UP`] is reserved for the engine's own wake-up notifications and is
/// never issued to a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Sentinel the engine arms to interrupt a blocked poll when remote work arrives.
    pub const WAKE_UP: Tag = Tag(u64::MAX);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn is_wake_up(self) -> bool {
        self.0 == u64::MAX
    }
}

/// How long a poll of the completion channel may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Do not block; report only events that are already available.
    Immediate,

    /// Block until the given instant at the latest.
    At(Instant),

    /// Block until an event arrives.
    Never,
}

impl Deadline {
    /// Deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Deadline::At(Instant::now() + duration)
    }

    /// Returns `true` once the deadline lies in the past.
    pub fn has_expired(&self) -> bool {
        match self {
            Deadline::Immediate => true,
            Deadline::At(instant) => Instant::now() >= *instant,
            Deadline::Never => false,
        }
    }

    /// The instant to block until, or `None` for an unbounded wait.
    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::Immediate => Some(Instant::now()),
            Deadline::At(instant) => Some(*instant),
            Deadline::Never => None,
        }
    }
}

/// One completion-channel event: which tag finished, and whether it succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub tag: Tag,
    pub ok: bool,
}

/// Outcome of a single [`CompletionQueue::next`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Event(Event),

    /// The deadline expired without an event. Not an error.
    Timeout,

    /// The channel has been shut down and fully drained.
    Shutdown,
}

/// The transport's blocking completion channel.
pub trait CompletionQueue: Send + Sync {
    /// Waits for the next event, blocking no later than `deadline`.
    fn next(&self, deadline: Deadline) -> Next;

    /// Makes a current or future [`next`](CompletionQueue::next) yield `tag` with
    /// `ok = true` promptly, like a zero-delay alarm.
    fn notify(&self, tag: Tag);

    /// Stops accepting new work. Outstanding operations still complete (usually
    /// with `ok = false`); once they have, `next` returns [`Next::Shutdown`].
    fn shutdown(&self);
}

impl<Q: CompletionQueue + ?Sized> CompletionQueue for Arc<Q> {
    fn next(&self, deadline: Deadline) -> Next {
        (**self).next(deadline)
    }

    fn notify(&self, tag: Tag) {
        (**self).notify(tag)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Transport-side state of one live call.
///
/// Cancellation is cooperative: `try_cancel` asks the transport to mark the call
/// dead, and operations still outstanding on it complete with `ok = false` later.
pub trait CallContext: Sync {
    fn try_cancel(&self);
}
