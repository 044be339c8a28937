//! Thread identity and the running guard.
//!
//! An engine is drained by at most one thread at a time. That thread holds a
//! [`Running`] guard, obtained from [`Engine::enter`]; while the guard lives the
//! engine's running-thread marker names the current thread, and submissions
//! made from it go straight to the local queue without synchronisation.
//! Producers on other threads never block on the marker: they fall back to the
//! remote queue.
//!
//! # Example
//!
//! ```ignore
//! let mut running = engine.enter()?;
//! while !engine.is_stopped() {
//!     running.run_one(Deadline::Never, InvokeMode::Normal);
//! }
//! ```

use crate::operation::InvokeMode;
use crate::runtime::Engine;
use crate::transport::Deadline;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Marker value meaning "no thread is running the engine".
pub(crate) const NO_THREAD: usize = 0;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small, process-unique, non-zero identifier of the calling thread.
pub(crate) fn current_thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

/// Proof that the current thread is the engine's running thread.
///
/// Dropping the guard, including during unwinding, clears the marker again.
/// The guard cannot leave the thread that acquired it.
pub struct Running<'a> {
    engine: &'a Engine,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Running<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            _not_send: PhantomData,
        }
    }

    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Performs one step: drain remote work, run the local batch, then poll the
    /// completion channel once. Stops short of polling when no work is known to
    /// be pending and the engine is stopped or has no outstanding work.
    ///
    /// Returns whether anything was processed.
    pub fn run_one(&mut self, deadline: Deadline, mode: InvokeMode) -> bool {
        let engine = self.engine;
        engine.do_one(deadline, mode, &mut || engine.should_stop())
    }

    /// Like [`run_one`](Self::run_one) with a caller-supplied stop predicate.
    pub fn run_one_with<P>(&mut self, deadline: Deadline, mode: InvokeMode, mut stop: P) -> bool
    where
        P: FnMut() -> bool,
    {
        self.engine.do_one(deadline, mode, &mut stop)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.engine.leave();
    }
}

impl std::fmt::Debug for Running<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Running").finish_non_exhaustive()
    }
}
