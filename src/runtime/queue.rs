//! Work queues owned by the engine.
//!
//! - [`LocalQueue`]: single-threaded intrusive FIFO, touched only by the running thread.
//! - [`RemoteQueue`]: lock-free multi-producer, single-consumer stack of the same
//!   nodes. The consumer takes everything in one swap and restores FIFO order.
//! - [`NotifyList`]: records that must be force-completed when shutdown begins,
//!   with O(1) removal for calls that finish first.

use crate::operation::Operation;
use crate::utils::slab::{Key, Slab};

use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Queue link wrapped around one record.
pub(crate) struct Node {
    next: *mut Node,
    operation: Box<dyn Operation>,
}

impl Node {
    pub(crate) fn new(operation: Box<dyn Operation>) -> Box<Self> {
        Box::new(Self {
            next: ptr::null_mut(),
            operation,
        })
    }

    pub(crate) fn into_operation(self: Box<Self>) -> Box<dyn Operation> {
        self.operation
    }
}

/// Intrusive singly-linked FIFO.
pub(crate) struct LocalQueue {
    head: *mut Node,
    tail: *mut Node,
    len: usize,
}

// SAFETY: the queue exclusively owns every node linked into it.
unsafe impl Send for LocalQueue {}

impl LocalQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_back(&mut self, node: Box<Node>) {
        let node = Box::into_raw(node);

        // SAFETY: `node` is freshly leaked and owned by this queue from here on.
        unsafe { (*node).next = ptr::null_mut() };

        if self.tail.is_null() {
            self.head = node;
        } else {
            // SAFETY: tail is a live node owned by this queue.
            unsafe { (*self.tail).next = node };
        }

        self.tail = node;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Box<Node>> {
        if self.head.is_null() {
            return None;
        }

        // SAFETY: head is a live node owned by this queue; ownership returns to the caller.
        let mut node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        node.next = ptr::null_mut();

        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }

        self.len -= 1;
        Some(node)
    }

    /// Moves every node of `other` to the back of `self` in O(1).
    pub(crate) fn append(&mut self, mut other: LocalQueue) {
        if other.is_empty() {
            return;
        }

        if self.tail.is_null() {
            self.head = other.head;
        } else {
            // SAFETY: tail is a live node owned by this queue.
            unsafe { (*self.tail).next = other.head };
        }

        self.tail = other.tail;
        self.len += other.len;

        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }

    /// Steals the current contents, leaving `self` empty.
    pub(crate) fn take(&mut self) -> LocalQueue {
        std::mem::replace(self, LocalQueue::new())
    }

    /// Builds a FIFO from a newest-first chain produced by [`RemoteQueue`].
    ///
    /// # Safety
    /// `chain` must be null or the head of a chain of leaked nodes that nobody else owns.
    unsafe fn from_lifo_chain(mut chain: *mut Node) -> LocalQueue {
        let mut queue = LocalQueue::new();
        let tail = chain;

        while !chain.is_null() {
            // SAFETY: every node in the chain is live and owned by us.
            let next = unsafe { (*chain).next };
            unsafe { (*chain).next = queue.head };

            queue.head = chain;
            queue.len += 1;
            chain = next;
        }

        queue.tail = tail;
        queue
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        while let Some(node) = self.pop_front() {
            drop(node);
        }
    }
}

/// Marker stored in the head while the consumer considers the queue idle.
static INACTIVE_MARKER: u8 = 0;

fn inactive() -> *mut Node {
    ptr::addr_of!(INACTIVE_MARKER).cast_mut().cast::<Node>()
}

/// Multi-producer queue with an "inactive" state used to avoid missed wake-ups.
///
/// The head is either null (active, empty), the inactive marker (idle, empty,
/// the next producer must wake the consumer), or the newest node.
pub(crate) struct RemoteQueue {
    head: CachePadded<AtomicPtr<Node>>,
}

// SAFETY: nodes are only reachable through the atomic head and are handed off
// wholesale; operations are `Send`.
unsafe impl Send for RemoteQueue {}
unsafe impl Sync for RemoteQueue {}

impl RemoteQueue {
    /// Creates an empty queue. An inactive queue makes the very first enqueue
    /// report that a wake-up is needed.
    pub(crate) fn new(active: bool) -> Self {
        let head = if active { ptr::null_mut() } else { inactive() };

        Self {
            head: CachePadded::new(AtomicPtr::new(head)),
        }
    }

    /// Pushes `node`. Returns `true` if the queue was inactive, in which case the
    /// caller must wake the consumer.
    pub(crate) fn enqueue(&self, node: Box<Node>) -> bool {
        let node = Box::into_raw(node);
        let marker = inactive();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let next = if head == marker { ptr::null_mut() } else { head };

            // SAFETY: `node` is not yet published, so we still own it exclusively.
            unsafe { (*node).next = next };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return head == marker,
                Err(actual) => head = actual,
            }
        }
    }

    /// Takes every queued node in FIFO order. If nothing is queued, marks the
    /// queue inactive instead and returns an empty queue.
    pub(crate) fn dequeue_all_or_mark_inactive(&self) -> LocalQueue {
        let marker = inactive();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            if head == marker {
                return LocalQueue::new();
            }

            if head.is_null() {
                match self.head.compare_exchange_weak(
                    ptr::null_mut(),
                    marker,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return LocalQueue::new(),
                    Err(actual) => {
                        head = actual;
                        continue;
                    }
                }
            }

            // Producers only ever add, so the swap yields a non-empty chain.
            let chain = self.head.swap(ptr::null_mut(), Ordering::Acquire);

            // SAFETY: the swap detached the chain; no producer can reach it any more.
            return unsafe { LocalQueue::from_lifo_chain(chain) };
        }
    }

    /// Takes every queued node without touching the inactive state.
    pub(crate) fn dequeue_all(&self) -> LocalQueue {
        let marker = inactive();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            if head.is_null() || head == marker {
                return LocalQueue::new();
            }

            match self.head.compare_exchange_weak(
                head,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                // SAFETY: as in `dequeue_all_or_mark_inactive`.
                Ok(chain) => return unsafe { LocalQueue::from_lifo_chain(chain) },
                Err(actual) => head = actual,
            }
        }
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        drop(self.dequeue_all());
    }
}

/// Handle identifying one entry of a [`NotifyList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NotifyHandle(Key);

struct NotifyEntry {
    prev: Option<Key>,
    next: Option<Key>,
    operation: Box<dyn Operation>,
}

/// Doubly-linked list of records threaded through a slab.
pub(crate) struct NotifyList {
    entries: Slab<NotifyEntry>,
    head: Option<Key>,
    tail: Option<Key>,
}

impl NotifyList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn push_back(&mut self, operation: Box<dyn Operation>) -> NotifyHandle {
        let key = self.entries.insert(NotifyEntry {
            prev: self.tail,
            next: None,
            operation,
        });

        match self.tail.and_then(|tail| self.entries.get_mut(tail)) {
            Some(tail) => tail.next = Some(key),
            None => self.head = Some(key),
        }

        self.tail = Some(key);
        NotifyHandle(key)
    }

    /// Unlinks the entry behind `handle`. Returns `None` if it was already removed.
    pub(crate) fn remove(&mut self, handle: NotifyHandle) -> Option<Box<dyn Operation>> {
        let entry = self.entries.remove(handle.0)?;

        match entry.prev.and_then(|prev| self.entries.get_mut(prev)) {
            Some(prev) => prev.next = entry.next,
            None => self.head = entry.next,
        }

        match entry.next.and_then(|next| self.entries.get_mut(next)) {
            Some(next) => next.prev = entry.prev,
            None => self.tail = entry.prev,
        }

        Some(entry.operation)
    }

    pub(crate) fn pop_front(&mut self) -> Option<Box<dyn Operation>> {
        let head = self.head?;
        self.remove(NotifyHandle(head))
    }
}

impl Default for NotifyList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationResult;
    use crate::runtime::Engine;
    use crate::transport::memory::MemoryQueue;

    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> Box<Node> {
        let log = log.clone();
        Node::new(Box::new(move |_: OperationResult, _: &Engine| {
            log.lock().unwrap().push(id);
        }))
    }

    fn run_all(queue: &mut LocalQueue, engine: &Engine) {
        while let Some(node) = queue.pop_front() {
            node.into_operation()
                .complete(OperationResult::Success, engine);
        }
    }

    #[test]
    fn test_local_queue_fifo_and_append() {
        let engine = Engine::new(MemoryQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut first = LocalQueue::new();
        first.push_back(recording(&log, 1));
        first.push_back(recording(&log, 2));

        let mut second = LocalQueue::new();
        second.push_back(recording(&log, 3));

        first.append(second);
        assert_eq!(first.len(), 3);

        let mut snapshot = first.take();
        assert!(first.is_empty());

        run_all(&mut snapshot, &engine);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_remote_drain_restores_submission_order() {
        let engine = Engine::new(MemoryQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new(true);

        for id in 0..5 {
            queue.enqueue(recording(&log, id));
        }

        let mut drained = queue.dequeue_all_or_mark_inactive();
        run_all(&mut drained, &engine);

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_remote_queue_reports_wake_up_only_when_inactive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new(false);

        assert!(
            queue.enqueue(recording(&log, 1)),
            "inactive queue must request a wake-up"
        );
        assert!(!queue.enqueue(recording(&log, 2)));

        let drained = queue.dequeue_all_or_mark_inactive();
        assert_eq!(drained.len(), 2);

        // Active and empty: the consumer is still checking, no wake-up needed.
        assert!(!queue.enqueue(recording(&log, 3)));
        assert_eq!(queue.dequeue_all_or_mark_inactive().len(), 1);

        // An empty drain marks the queue inactive, so the next producer wakes again.
        assert!(queue.dequeue_all_or_mark_inactive().is_empty());
        assert!(queue.enqueue(recording(&log, 4)));
        assert!(log.lock().unwrap().is_empty(), "nothing was completed");
    }

    #[test]
    fn test_notify_list_removes_from_the_middle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = NotifyList::new();

        let a = list.push_back(recording(&log, 1).into_operation());
        let b = list.push_back(recording(&log, 2).into_operation());
        let c = list.push_back(recording(&log, 3).into_operation());

        assert!(list.remove(b).is_some());
        assert!(list.remove(b).is_none(), "second removal must be a no-op");
        assert_eq!(list.len(), 2);

        assert!(list.pop_front().is_some());
        assert!(list.remove(a).is_none(), "front was already popped");
        assert!(list.remove(c).is_some());
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());
    }
}
