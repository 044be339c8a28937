//! Executor association for completion handlers.
//!
//! A handler names the executor it must run on. When the engine completes a
//! handler on some other thread, the handler is re-posted to that executor
//! instead of being invoked in place.

use crate::handler::ErasedHandler;
use crate::operation::ExecutorWork;
use crate::runtime::Engine;

use std::sync::Arc;

/// Something that can run posted work.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Schedules `work` for execution. Must not run it before returning unless
    /// the executor is [`Inline`].
    fn execute(&self, work: ErasedHandler<()>);

    /// `true` when work invoked on the current thread already satisfies this
    /// executor's concurrency contract.
    fn running_in_this_thread(&self) -> bool;
}

/// Runs work immediately on whichever thread completes it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, mut work: ErasedHandler<()>) {
        work.complete(());
    }

    fn running_in_this_thread(&self) -> bool {
        true
    }
}

/// Executor that runs work on an [`Engine`]'s running thread.
///
/// Obtained from [`Engine::executor`].
#[derive(Clone)]
pub struct EngineExecutor {
    engine: Arc<Engine>,
}

impl EngineExecutor {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Executor for EngineExecutor {
    fn execute(&self, work: ErasedHandler<()>) {
        self.engine.submit(ExecutorWork::new(work));
    }

    fn running_in_this_thread(&self) -> bool {
        self.engine.running_in_this_thread()
    }
}

impl std::fmt::Debug for EngineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineExecutor")
            .field("engine", &Arc::as_ptr(&self.engine))
            .finish()
    }
}
