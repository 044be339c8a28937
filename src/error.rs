//! Error types surfaced by the engine and the completion-handler machinery.
//!
//! Transport failures are not errors here: they reach records as
//! [`OperationResult::Failure`](crate::OperationResult::Failure). Misuse such as
//! consuming a completion handler twice is a programming error and panics.

use thiserror::Error;

/// Failure to store a completion handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler's allocator could not provide storage for it.
    #[error("allocator refused {size} bytes (align {align}) for a completion handler")]
    Allocation { size: usize, align: usize },
}

/// Failure to drive an [`Engine`](crate::Engine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another thread is already running the engine.
    #[error("engine is already being run by another thread")]
    AlreadyRunning,

    #[error("failed to spawn engine driver thread")]
    DriverSpawn(#[from] std::io::Error),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}
