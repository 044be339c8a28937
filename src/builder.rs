//! Fluent builder for Engine construction.
//!
//! Provides a builder pattern interface for creating and configuring Engine instances.

use crate::runtime::Engine;
use crate::transport::CompletionQueue;

use std::time::Duration;

/// Default upper bound the background driver blocks between stop checks.
const DEFAULT_DRIVER_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Builder for constructing Engine instances with fluent API.
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .name("client")
///     .driver_idle_timeout(Duration::from_millis(20))
///     .build(MemoryQueue::new());
/// ```
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    name: Option<String>,
    driver_idle_timeout: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Creates a new engine builder with default settings.
    pub fn new() -> Self {
        Self {
            name: None,
            driver_idle_timeout: DEFAULT_DRIVER_IDLE_TIMEOUT,
        }
    }

    /// Names the engine. The name shows up in log spans and driver thread names.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Sets how long the background driver may block in the completion channel
    /// before re-checking whether it was stopped.
    pub fn driver_idle_timeout(mut self, timeout: Duration) -> Self {
        self.driver_idle_timeout = timeout;
        self
    }

    /// Builds an engine on top of `queue`.
    ///
    /// Consumes the builder.
    ///
    /// # Arguments
    /// * `queue` - The transport's completion channel the engine will drain
    ///
    /// # Returns
    /// A newly constructed Engine, not yet running
    pub fn build<Q>(self, queue: Q) -> Engine
    where
        Q: CompletionQueue + 'static,
    {
        Engine::from_parts(Box::new(queue), self.name, self.driver_idle_timeout)
    }
}
