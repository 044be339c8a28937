//! Cancellable references to live calls.
//!
//! A call handle that goes away while its call is still in flight must cancel
//! that call, exactly once, and must never touch it again afterwards. The
//! handle's reference to the transport's call context lives in one atomic word
//! together with two spare low bits of per-call state, so that moving the
//! reference out, clearing it, and flipping a state bit are each one atomic
//! operation.
//!
//! # Example
//!
//! ```ignore
//! let call = MemoryCall::new();
//! {
//!     let handle = CallHandle::new(&call);
//!     handle.set_writes_done();
//! } // dropped while unfinished: cancelled once
//!
//! assert_eq!(call.cancel_requests(), 1);
//! ```

use crate::transport::CallContext;

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Low bits of the word that hold state rather than address.
const TAG_MASK: usize = 0b11;

/// Nullable reference to a call context, cancelled on drop unless cleared.
///
/// States are ACTIVE (points at a call) and EMPTY. The only way out of ACTIVE is
/// [`clear`](Self::clear), [`take`](Self::take), or dropping, which cancels.
pub struct CancelRef<'a, C: CallContext> {
    word: AtomicUsize,
    _context: PhantomData<&'a C>,
}

impl<'a, C: CallContext> CancelRef<'a, C> {
    const ALIGNED: () = assert!(
        align_of::<C>() > TAG_MASK,
        "call contexts must be at least 4-byte aligned"
    );

    pub fn new(context: &'a C) -> Self {
        let () = Self::ALIGNED;

        Self {
            word: AtomicUsize::new(ptr::from_ref(context).expose_provenance()),
            _context: PhantomData,
        }
    }

    pub const fn empty() -> Self {
        Self {
            word: AtomicUsize::new(0),
            _context: PhantomData,
        }
    }

    fn decode(word: usize) -> Option<&'a C> {
        let address = word & !TAG_MASK;
        if address == 0 {
            return None;
        }

        // SAFETY: non-zero addresses were exposed from a `&'a C` in `new`, and
        // the borrow keeps the context alive for `'a`.
        Some(unsafe { &*ptr::with_exposed_provenance::<C>(address) })
    }

    pub fn context(&self) -> Option<&'a C> {
        Self::decode(self.word.load(Ordering::Acquire))
    }

    pub fn is_null(&self) -> bool {
        self.word.load(Ordering::Acquire) & !TAG_MASK == 0
    }

    /// Forgets the call without cancelling it. Used once the call finished.
    pub fn clear(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Requests cancellation of the referenced call, if any. May be repeated.
    pub fn cancel(&self) {
        if let Some(context) = self.context() {
            context.try_cancel();
        }
    }

    /// Moves the reference and its state bits out, leaving `self` empty.
    pub fn take(&self) -> Self {
        Self {
            word: AtomicUsize::new(self.word.swap(0, Ordering::AcqRel)),
            _context: PhantomData,
        }
    }

    /// Installs `other` in place of the current reference. A call that was
    /// still referenced is cancelled first and not touched again.
    pub fn replace(&self, other: Self) {
        let other = ManuallyDrop::new(other);
        let previous = self
            .word
            .swap(other.word.load(Ordering::Acquire), Ordering::AcqRel);

        if let Some(context) = Self::decode(previous) {
            context.try_cancel();
        }
    }

    pub fn has_bit<const BIT: usize>(&self) -> bool {
        const { assert!(BIT < 2, "only bits 0 and 1 are available") };

        self.word.load(Ordering::Acquire) & (1 << BIT) != 0
    }

    pub fn set_bit<const BIT: usize>(&self) {
        const { assert!(BIT < 2, "only bits 0 and 1 are available") };

        self.word.fetch_or(1 << BIT, Ordering::AcqRel);
    }
}

impl<C: CallContext> Default for CancelRef<'_, C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: CallContext> Drop for CancelRef<'_, C> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<C: CallContext> fmt::Debug for CancelRef<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.word.load(Ordering::Acquire);

        f.debug_struct("CancelRef")
            .field("null", &(word & !TAG_MASK == 0))
            .field("bits", &(word & TAG_MASK))
            .finish()
    }
}

const WRITES_DONE: usize = 0;

/// Per-call bookkeeping shared by every client call object.
///
/// Finishing the call through the normal protocol calls
/// [`set_finished`](Self::set_finished); a handle dropped before that cancels
/// its call.
pub struct CallHandle<'a, C: CallContext> {
    context: CancelRef<'a, C>,
}

impl<'a, C: CallContext> CallHandle<'a, C> {
    pub fn new(context: &'a C) -> Self {
        Self {
            context: CancelRef::new(context),
        }
    }

    pub fn context(&self) -> Option<&'a C> {
        self.context.context()
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_null()
    }

    pub fn set_finished(&self) {
        self.context.clear();
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// `true` once the client declared it will send no more messages.
    pub fn is_writes_done(&self) -> bool {
        self.context.has_bit::<WRITES_DONE>()
    }

    pub fn set_writes_done(&self) {
        self.context.set_bit::<WRITES_DONE>();
    }

    /// Moves the call out, leaving this handle finished.
    pub fn take(&self) -> Self {
        Self {
            context: self.context.take(),
        }
    }
}

impl<C: CallContext> Default for CallHandle<'_, C> {
    fn default() -> Self {
        Self {
            context: CancelRef::empty(),
        }
    }
}

impl<C: CallContext> fmt::Debug for CallHandle<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("finished", &self.is_finished())
            .field("writes_done", &self.is_writes_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryCall;

    #[test]
    fn test_bits_survive_transfer() {
        let call = MemoryCall::new();
        let source = CancelRef::new(&call);
        source.set_bit::<1>();

        let moved = source.take();
        assert!(source.is_null());
        assert!(!source.has_bit::<1>(), "bits move with the reference");
        assert!(moved.has_bit::<1>());
        assert!(!moved.has_bit::<0>());
        assert!(std::ptr::eq(moved.context().unwrap(), &call));

        drop(source);
        assert_eq!(call.cancel_requests(), 0);

        drop(moved);
        assert_eq!(call.cancel_requests(), 1);
    }

    #[test]
    fn test_cleared_reference_keeps_bits() {
        let call = MemoryCall::new();
        let handle = CancelRef::new(&call);
        handle.clear();
        handle.set_bit::<0>();

        assert!(handle.is_null());
        assert!(handle.has_bit::<0>());
        assert!(handle.context().is_none());

        drop(handle);
        assert_eq!(call.cancel_requests(), 0);
    }
}
