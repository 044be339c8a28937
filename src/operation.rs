//! Operation records: the units of work the engine queues and completes.
//!
//! Every asynchronous step is an [`Operation`]. The engine takes ownership of a
//! boxed record when it is submitted or registered, and gives it back exactly
//! once, by value, through [`Operation::complete`]. Because the record is moved
//! into the queue it sits in, it can never be linked into two queues or
//! completed twice.
//!
//! Plain closures are records too:
//!
//! ```ignore
//! engine.submit(|result: OperationResult, _engine: &Engine| {
//!     assert_eq!(result, OperationResult::Success);
//! });
//! ```

use crate::handler::ErasedHandler;
use crate::runtime::Engine;

use tracing::{trace, warn};

/// Classification handed to a record when it completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationResult {
    /// The operation finished normally and succeeded.
    Success,

    /// The operation finished normally and the transport reported failure.
    Failure,

    /// Completed during a forced drain from an event that arrived flagged ok.
    ShutdownSuccess,

    /// Completed during a forced drain or shutdown without doing real work.
    ShutdownFailure,
}

impl OperationResult {
    /// Classifies a completion-channel event.
    pub fn from_event(ok: bool, mode: InvokeMode) -> Self {
        match (mode, ok) {
            (InvokeMode::Normal, true) => OperationResult::Success,
            (InvokeMode::Normal, false) => OperationResult::Failure,
            (InvokeMode::ForceDrain, true) => OperationResult::ShutdownSuccess,
            (InvokeMode::ForceDrain, false) => OperationResult::ShutdownFailure,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(
            self,
            OperationResult::Success | OperationResult::ShutdownSuccess
        )
    }

    /// `true` for both shutdown classifications. Higher layers use this to avoid
    /// retrying work after the engine has begun shutting down.
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            OperationResult::ShutdownSuccess | OperationResult::ShutdownFailure
        )
    }
}

/// Whether a step performs real work or only force-drains records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InvokeMode {
    #[default]
    Normal,
    ForceDrain,
}

impl InvokeMode {
    /// Result handed to records taken from the local or remote queue.
    pub(crate) fn queued_result(self) -> OperationResult {
        match self {
            InvokeMode::Normal => OperationResult::Success,
            InvokeMode::ForceDrain => OperationResult::ShutdownFailure,
        }
    }
}

/// A queueable unit of work with a single completion entry point.
pub trait Operation: Send + 'static {
    /// Consumes the record. Called exactly once by the engine.
    fn complete(self: Box<Self>, result: OperationResult, engine: &Engine);
}

impl<F> Operation for F
where
    F: FnOnce(OperationResult, &Engine) + Send + 'static,
{
    fn complete(self: Box<Self>, result: OperationResult, engine: &Engine) {
        (*self)(result, engine)
    }
}

/// Record that runs a callable, unless it is being force-drained.
pub(crate) struct Posted<F>(pub(crate) F);

impl<F> Operation for Posted<F>
where
    F: FnOnce() + Send + 'static,
{
    fn complete(self: Box<Self>, result: OperationResult, _engine: &Engine) {
        if result.is_shutdown() {
            trace!("dropping posted work during shutdown");
            return;
        }

        (self.0)()
    }
}

/// Record that delivers a completion-channel outcome to a type-erased handler.
///
/// On a shutdown classification the handler is destroyed without being invoked.
/// If re-posting the handler to its executor fails, the failure unwinds out of
/// the engine's run entry point.
pub(crate) struct HandlerOperation {
    handler: ErasedHandler<bool>,
}

impl HandlerOperation {
    pub(crate) fn new(handler: ErasedHandler<bool>) -> Self {
        Self { handler }
    }
}

impl Operation for HandlerOperation {
    fn complete(mut self: Box<Self>, result: OperationResult, _engine: &Engine) {
        if result.is_shutdown() {
            trace!(?result, "destroying completion handler without invoking it");
            return;
        }

        if let Err(error) = self.handler.dispatch(result == OperationResult::Success) {
            warn!(%error, "could not reschedule completion handler");
            panic!("could not reschedule completion handler: {error}");
        }
    }
}

/// Record that delivers work posted to the engine through the executor interface.
pub(crate) struct ExecutorWork {
    work: ErasedHandler<()>,
}

impl ExecutorWork {
    pub(crate) fn new(work: ErasedHandler<()>) -> Self {
        Self { work }
    }
}

impl Operation for ExecutorWork {
    fn complete(mut self: Box<Self>, result: OperationResult, _engine: &Engine) {
        if result.is_shutdown() {
            return;
        }

        self.work.complete(());
    }
}
