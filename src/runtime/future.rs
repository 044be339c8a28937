//! Future-based completion of tagged operations.
//!
//! Instead of handing the engine a callback, a caller can await the outcome of
//! a tagged operation. The record registered for the tag owns the sending half
//! of a oneshot channel and resolves it exactly once when it completes.

use crate::operation::{Operation, OperationResult};
use crate::runtime::Engine;
use crate::transport::Tag;

use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Resolves with the [`OperationResult`] of one tagged operation.
///
/// If the record is dropped without completing, for instance because the engine
/// was torn down abnormally, the future resolves with
/// [`OperationResult::ShutdownFailure`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct OperationFuture {
    tag: Tag,
    receiver: oneshot::Receiver<OperationResult>,
}

impl OperationFuture {
    /// Tag the transport reports when the operation finishes.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

impl Future for OperationFuture {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(OperationResult::ShutdownFailure),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct FutureOperation {
    sender: oneshot::Sender<OperationResult>,
}

impl Operation for FutureOperation {
    fn complete(self: Box<Self>, result: OperationResult, _engine: &Engine) {
        // The receiver may be gone; nobody is interested then.
        let _ = self.sender.send(result);
    }
}

impl Engine {
    /// Registers a tagged operation, passes its tag to `start`, and returns a
    /// future resolving with its result.
    ///
    /// The engine must still be run for the future to resolve.
    ///
    /// # Example
    /// ```ignore
    /// let alarm = engine.initiate_future(|tag| queue.alarm(deadline, tag));
    /// engine.run()?;
    /// assert_eq!(futures::executor::block_on(alarm), OperationResult::Success);
    /// ```
    pub fn initiate_future<S>(&self, start: S) -> OperationFuture
    where
        S: FnOnce(Tag),
    {
        let (sender, receiver) = oneshot::channel();
        let tag = self.register(FutureOperation { sender });
        start(tag);

        OperationFuture { tag, receiver }
    }
}
