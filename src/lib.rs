//! Completion-queue execution engine for RPC transports.
//!
//! This crate lets application code issue and await asynchronous operations on
//! top of a transport that only exposes a blocking, tag-addressed completion
//! channel. Any number of threads submit work; exactly one thread at a time
//! runs the engine, which interleaves that work with events drained from the
//! completion channel.
//!
//! # Architecture
//!
//! - **Engine**: single-consumer run loop over a local queue, a lock-free remote
//!   queue and the completion channel
//! - **Operation**: queueable record completed exactly once with an `OperationResult`
//! - **ErasedHandler**: type-erased, allocator- and executor-aware completion callback
//! - **CancelRef / CallHandle**: atomic reference to a live call, cancelled on drop
//! - **EngineBuilder**: fluent builder pattern for engine configuration
//! - **driver**: background thread running an engine
//! - **transport**: completion-channel interface plus an in-memory implementation

mod builder;
pub mod cancel;
mod error;
pub mod handler;
mod operation;
mod runtime;
pub mod transport;
mod utils;

pub use builder::EngineBuilder;
pub use cancel::{CallHandle, CancelRef};
pub use error::{EngineError, HandlerError};
pub use handler::{CompletionHandler, ErasedHandler, bind};
pub use operation::{InvokeMode, Operation, OperationResult};
pub use runtime::{DriverHandle, Engine, NotifyHandle, OperationFuture, Running, driver};
pub use transport::{CompletionQueue, Deadline, Tag};
