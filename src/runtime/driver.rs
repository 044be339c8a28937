//! Background driver thread.
//!
//! Some embedders never want to call `run` themselves, for example when every
//! caller is blocking code that only submits work and waits on futures. The
//! driver runs the engine on a dedicated thread instead, waking at least every
//! idle timeout to check whether it has been asked to stop.

use crate::error::EngineError;
use crate::operation::InvokeMode;
use crate::runtime::Engine;
use crate::transport::Deadline;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Starts a thread that runs `engine` until it is stopped or its completion
/// channel has been shut down and drained.
///
/// # Errors
/// Returns [`EngineError::DriverSpawn`] if the thread could not be created.
///
/// # Example
/// ```ignore
/// let engine = Arc::new(Engine::new(queue.clone()));
/// let driver = driver::spawn(engine.clone())?;
///
/// engine.post(|| println!("runs on the driver thread"));
/// driver.stop()?;
/// ```
pub fn spawn(engine: Arc<Engine>) -> Result<DriverHandle, EngineError> {
    let name = match engine.name() {
        Some(name) => format!("{name}-driver"),
        None => "cq-reactor-driver".to_owned(),
    };

    let worker = engine.clone();
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || drive(&worker))?;

    Ok(DriverHandle {
        engine,
        thread: Some(thread),
    })
}

fn drive(engine: &Engine) -> Result<(), EngineError> {
    let mut running = engine.enter()?;
    let idle_timeout = engine.driver_idle_timeout();
    debug!(engine = engine.name(), ?idle_timeout, "driver started");

    loop {
        if engine.stop_requested() {
            break;
        }

        let progressed = running.run_one_with(
            Deadline::after(idle_timeout),
            InvokeMode::Normal,
            || engine.stop_requested(),
        );

        // A shut-down channel keeps reporting no progress once it is drained.
        if !progressed && engine.is_shutdown() {
            break;
        }
    }

    debug!(engine = engine.name(), "driver stopped");
    Ok(())
}

/// Owner of a running driver thread. Dropping it stops the engine and joins.
#[derive(Debug)]
pub struct DriverHandle {
    engine: Arc<Engine>,
    thread: Option<JoinHandle<Result<(), EngineError>>>,
}

impl DriverHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stops the engine and waits for the driver thread to exit.
    ///
    /// The engine stays stopped; call [`Engine::reset`] before running it again.
    ///
    /// # Panics
    /// Resumes the panic of a record that panicked on the driver thread.
    pub fn stop(self) -> Result<(), EngineError> {
        self.engine.stop();
        self.join()
    }

    /// Waits for the driver to exit on its own, after shutdown or an external stop.
    pub fn join(mut self) -> Result<(), EngineError> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.engine.stop();

            if thread.join().is_err() {
                warn!(engine = self.engine.name(), "driver thread panicked");
            }
        }
    }
}
