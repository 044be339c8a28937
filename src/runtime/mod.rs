//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub mod driver;
mod future;
pub(crate) mod queue;

pub use context::Running;
pub use core::Engine;
pub use driver::DriverHandle;
pub use future::OperationFuture;
pub use queue::NotifyHandle;
