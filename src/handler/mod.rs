//! Type-erased completion handlers.
//!
//! An [`ErasedHandler<T>`] owns one callable accepting a `T`, stored in memory
//! obtained from the callable's own [`HandlerAllocator`]. The concrete type is
//! forgotten at [`emplace`](ErasedHandler::emplace) time; what remains is a
//! storage pointer plus a small table of function pointers that know how to
//!
//! - move the callable out, free its storage and invoke it in place
//!   ([`complete`](ErasedHandler::complete))
//! - move the callable out, free its storage and re-post the invocation to the
//!   callable's own [`Executor`] ([`post_complete`](ErasedHandler::post_complete))
//! - drop it without invoking it, when the handler is destroyed unfired
//!
//! A handler fires at most once. Consuming an empty handler is a programming
//! error and panics.
//!
//! # Example
//!
//! ```ignore
//! use cq_reactor::handler::{ErasedHandler, bind};
//!
//! let mut handler = ErasedHandler::new(|ok: bool| println!("finished: {ok}"))?;
//! handler.complete(true);
//! assert!(handler.is_empty());
//!
//! // Bound to an engine: invocation is re-posted onto the engine's running thread.
//! let mut handler = ErasedHandler::new(bind(|ok: bool| {}).with_executor(engine.executor()))?;
//! handler.post_complete(false)?;
//! ```

pub mod alloc;
pub mod executor;

pub use alloc::{Global, HandlerAllocator};
pub use executor::{EngineExecutor, Executor, Inline};

use crate::error::HandlerError;

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use tracing::trace;

/// A callable that completes an asynchronous operation with a `T`.
///
/// Every `FnOnce(T) + Send + 'static` closure is a handler that allocates from
/// [`Global`] and runs [`Inline`]. Use [`bind`] to associate a different
/// allocator or executor.
pub trait CompletionHandler<T>: Send + 'static {
    type Allocator: HandlerAllocator;
    type Executor: Executor;

    fn allocator(&self) -> Self::Allocator;

    fn executor(&self) -> Self::Executor;

    fn call(self, value: T);
}

impl<T, F> CompletionHandler<T> for F
where
    F: FnOnce(T) + Send + 'static,
{
    type Allocator = Global;
    type Executor = Inline;

    fn allocator(&self) -> Global {
        Global
    }

    fn executor(&self) -> Inline {
        Inline
    }

    fn call(self, value: T) {
        self(value)
    }
}

/// A callable together with the allocator and executor it is associated with.
#[derive(Clone, Debug)]
pub struct Bound<F, A = Global, E = Inline> {
    function: F,
    allocator: A,
    executor: E,
}

/// Starts associating `function` with an allocator and/or executor.
pub fn bind<F>(function: F) -> Bound<F> {
    Bound {
        function,
        allocator: Global,
        executor: Inline,
    }
}

impl<F, A, E> Bound<F, A, E> {
    pub fn with_allocator<B: HandlerAllocator>(self, allocator: B) -> Bound<F, B, E> {
        Bound {
            function: self.function,
            allocator,
            executor: self.executor,
        }
    }

    pub fn with_executor<X: Executor>(self, executor: X) -> Bound<F, A, X> {
        Bound {
            function: self.function,
            allocator: self.allocator,
            executor,
        }
    }
}

impl<T, F, A, E> CompletionHandler<T> for Bound<F, A, E>
where
    F: FnOnce(T) + Send + 'static,
    A: HandlerAllocator,
    E: Executor,
{
    type Allocator = A;
    type Executor = E;

    fn allocator(&self) -> A {
        self.allocator.clone()
    }

    fn executor(&self) -> E {
        self.executor.clone()
    }

    fn call(self, value: T) {
        (self.function)(value)
    }
}

/// Entry points recorded for one concrete handler type.
struct VTable<T> {
    complete: unsafe fn(NonNull<u8>, T),
    post_complete: unsafe fn(NonNull<u8>, T) -> Result<(), HandlerError>,
    runs_in_place: unsafe fn(NonNull<u8>) -> bool,
    destroy: unsafe fn(NonNull<u8>),
}

struct Raw<T> {
    storage: NonNull<u8>,
    vtable: VTable<T>,
}

/// Owning, move-only, type-erased completion handler.
pub struct ErasedHandler<T> {
    raw: Option<Raw<T>>,
}

// SAFETY: only `CompletionHandler` types, which are `Send`, are ever stored.
unsafe impl<T: Send> Send for ErasedHandler<T> {}

impl<T: Send + 'static> ErasedHandler<T> {
    /// Creates a handler holding `handler`.
    ///
    /// # Errors
    /// Returns [`HandlerError::Allocation`] if the handler's allocator cannot
    /// provide storage.
    pub fn new<H>(handler: H) -> Result<Self, HandlerError>
    where
        H: CompletionHandler<T>,
    {
        let mut erased = Self::empty();
        erased.emplace(handler)?;

        Ok(erased)
    }

    /// Stores `handler`, allocating with its associated allocator.
    ///
    /// On allocation failure the handler is dropped and `self` stays empty.
    ///
    /// # Panics
    /// Panics if `self` already holds a callable.
    pub fn emplace<H>(&mut self, handler: H) -> Result<(), HandlerError>
    where
        H: CompletionHandler<T>,
    {
        assert!(
            self.raw.is_none(),
            "completion handler already holds a callable"
        );

        let layout = Layout::new::<H>();
        let storage = if layout.size() == 0 {
            NonNull::<H>::dangling().cast::<u8>()
        } else {
            handler.allocator().allocate(layout)?
        };

        // SAFETY: storage is valid for writes of `H` and suitably aligned.
        unsafe { storage.cast::<H>().as_ptr().write(handler) };

        self.raw = Some(Raw {
            storage,
            vtable: VTable {
                complete: complete_in_place::<H, T>,
                post_complete: post_and_complete::<H, T>,
                runs_in_place: runs_in_place::<H, T>,
                destroy: destroy::<H, T>,
            },
        });

        Ok(())
    }

    /// Invokes the callable on the current thread with `value`.
    ///
    /// # Panics
    /// Panics if the handler is empty.
    pub fn complete(&mut self, value: T) {
        let raw = self.take("complete");

        // SAFETY: storage was filled by `emplace` for the type the vtable was built for.
        unsafe { (raw.vtable.complete)(raw.storage, value) }
    }

    /// Re-posts invocation with `value` to the callable's associated executor.
    ///
    /// The deferred invocation is stored with the callable's allocator. If that
    /// allocation fails, the callable is dropped unfired and the error returned.
    ///
    /// # Panics
    /// Panics if the handler is empty.
    pub fn post_complete(&mut self, value: T) -> Result<(), HandlerError> {
        let raw = self.take("post_complete");

        // SAFETY: as in `complete`.
        unsafe { (raw.vtable.post_complete)(raw.storage, value) }
    }

    /// Invokes in place when the callable's executor allows it here, otherwise
    /// re-posts like [`post_complete`](Self::post_complete).
    pub fn dispatch(&mut self, value: T) -> Result<(), HandlerError> {
        let in_place = match &self.raw {
            // SAFETY: storage holds a live handler.
            Some(raw) => unsafe { (raw.vtable.runs_in_place)(raw.storage) },
            None => panic!("dispatch called on an empty completion handler"),
        };

        if in_place {
            self.complete(value);
            Ok(())
        } else {
            self.post_complete(value)
        }
    }
}

impl<T> ErasedHandler<T> {
    pub const fn empty() -> Self {
        Self { raw: None }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Moves the stored callable into a new handle without invoking it.
    pub fn release(&mut self) -> ErasedHandler<T> {
        ErasedHandler {
            raw: self.raw.take(),
        }
    }

    fn take(&mut self, operation: &str) -> Raw<T> {
        match self.raw.take() {
            Some(raw) => raw,
            None => panic!("{operation} called on an empty completion handler"),
        }
    }
}

impl<T> Default for ErasedHandler<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for ErasedHandler<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            trace!("dropping completion handler without invoking it");

            // SAFETY: storage holds a live handler that is not used again.
            unsafe { (raw.vtable.destroy)(raw.storage) }
        }
    }
}

impl<T> fmt::Debug for ErasedHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedHandler")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Moves the handler out of its storage and gives the storage back to the
/// handler's allocator.
///
/// # Safety
/// `storage` must hold an initialised `H` written by `emplace`, and must not be
/// used afterwards.
unsafe fn take_handler<H, T>(storage: NonNull<u8>) -> H
where
    H: CompletionHandler<T>,
{
    // SAFETY: upheld by the caller.
    let handler = unsafe { storage.cast::<H>().as_ptr().read() };
    let layout = Layout::new::<H>();

    if layout.size() != 0 {
        // SAFETY: storage came from this allocator with this layout.
        unsafe { handler.allocator().deallocate(storage, layout) };
    }

    handler
}

unsafe fn complete_in_place<H, T>(storage: NonNull<u8>, value: T)
where
    H: CompletionHandler<T>,
{
    // SAFETY: forwarded from `ErasedHandler::complete`.
    let handler = unsafe { take_handler::<H, T>(storage) };
    handler.call(value);
}

unsafe fn post_and_complete<H, T>(storage: NonNull<u8>, value: T) -> Result<(), HandlerError>
where
    H: CompletionHandler<T>,
    T: Send + 'static,
{
    // SAFETY: forwarded from `ErasedHandler::post_complete`.
    let handler = unsafe { take_handler::<H, T>(storage) };
    let executor = handler.executor();
    let allocator = handler.allocator();

    let work = ErasedHandler::new(bind(move |()| handler.call(value)).with_allocator(allocator))?;
    executor.execute(work);

    Ok(())
}

unsafe fn runs_in_place<H, T>(storage: NonNull<u8>) -> bool
where
    H: CompletionHandler<T>,
{
    // SAFETY: storage holds a live `H`.
    let handler = unsafe { storage.cast::<H>().as_ref() };
    handler.executor().running_in_this_thread()
}

unsafe fn destroy<H, T>(storage: NonNull<u8>)
where
    H: CompletionHandler<T>,
{
    // SAFETY: forwarded from `Drop`.
    drop(unsafe { take_handler::<H, T>(storage) });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingAllocator {
        live: Arc<AtomicUsize>,
    }

    impl HandlerAllocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HandlerError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Global.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            unsafe { Global.deallocate(ptr, layout) }
        }
    }

    #[test]
    fn test_complete_invokes_and_frees_storage() {
        let allocator = CountingAllocator::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let mut handler = ErasedHandler::new(
            bind(move |value: usize| {
                seen_clone.store(value, Ordering::SeqCst);
            })
            .with_allocator(allocator.clone()),
        )
        .unwrap();

        assert_eq!(allocator.live.load(Ordering::SeqCst), 1);

        handler.complete(7);

        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(allocator.live.load(Ordering::SeqCst), 0);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_drop_without_invoking_frees_storage() {
        let allocator = CountingAllocator::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let handler = ErasedHandler::new(
            bind(move |_: bool| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            })
            .with_allocator(allocator.clone()),
        )
        .unwrap();

        drop(handler);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_sized_callable_skips_allocator() {
        let mut handler = ErasedHandler::new(|_: ()| {}).unwrap();
        assert!(!handler.is_empty());
        handler.complete(());
    }

    #[test]
    fn test_release_transfers_ownership() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mut original = ErasedHandler::new(move |_: ()| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let mut released = original.release();

        assert!(original.is_empty());
        released.complete(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
