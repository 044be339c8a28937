//! Execution engine that multiplexes queued work with completion-channel events.
//!
//! One thread at a time "runs" the engine. Each step it migrates remotely
//! submitted records into its local queue, runs a snapshot of the local queue,
//! and then polls the transport's completion channel for one event. Producers on
//! any other thread push onto a lock-free remote queue and, when that queue was
//! idle, arm a wake-up event so that a blocked poll returns promptly.

use crate::builder::EngineBuilder;
use crate::error::{EngineError, HandlerError};
use crate::handler::{CompletionHandler, EngineExecutor, ErasedHandler};
use crate::operation::{HandlerOperation, InvokeMode, Operation, OperationResult, Posted};
use crate::runtime::context::{NO_THREAD, Running, current_thread_id};
use crate::runtime::queue::{LocalQueue, Node, NotifyHandle, NotifyList, RemoteQueue};
use crate::transport::{CompletionQueue, Deadline, Next, Tag};
use crate::utils::slab::{Key, Slab};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, trace, warn};

/// Single-consumer, multi-producer execution engine.
///
/// Owns the local and remote work queues, the arena of records waiting for a
/// completion-channel event, the notify-when-done list, and the outstanding-work
/// counter. Dropping the engine shuts it down and force-completes every record it
/// still holds.
///
/// # Example
/// ```ignore
/// let queue = Arc::new(MemoryQueue::new());
/// let engine = Engine::new(queue.clone());
///
/// engine.initiate(|ok: bool| println!("alarm fired: {ok}"), |tag| {
///     queue.alarm(Instant::now() + Duration::from_millis(5), tag);
/// })?;
///
/// engine.run()?;
/// ```
pub struct Engine {
    name: Option<String>,
    completion_queue: Box<dyn CompletionQueue>,
    outstanding_work: CachePadded<AtomicUsize>,
    running_thread: AtomicUsize,
    stopped: AtomicBool,
    shutdown: AtomicBool,
    channel_drained: AtomicBool,
    check_remote_work: AtomicBool,
    local_queue: UnsafeCell<LocalQueue>,
    remote_queue: RemoteQueue,
    records: Mutex<Slab<Box<dyn Operation>>>,
    notify_when_done: Mutex<NotifyList>,
    driver_idle_timeout: Duration,
}

// SAFETY: `local_queue` is only touched by the thread recorded in
// `running_thread`, which `enter` hands out to one thread at a time. Everything
// else is atomic or behind a lock.
unsafe impl Sync for Engine {}

impl Engine {
    /// Creates an engine on top of `queue` with default settings.
    pub fn new<Q>(queue: Q) -> Self
    where
        Q: CompletionQueue + 'static,
    {
        EngineBuilder::new().build(queue)
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(
        completion_queue: Box<dyn CompletionQueue>,
        name: Option<String>,
        driver_idle_timeout: Duration,
    ) -> Self {
        Self {
            name,
            completion_queue,
            outstanding_work: CachePadded::new(AtomicUsize::new(0)),
            running_thread: AtomicUsize::new(NO_THREAD),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            channel_drained: AtomicBool::new(false),
            check_remote_work: AtomicBool::new(false),
            local_queue: UnsafeCell::new(LocalQueue::new()),
            remote_queue: RemoteQueue::new(false),
            records: Mutex::new(Slab::new()),
            notify_when_done: Mutex::new(NotifyList::new()),
            driver_idle_timeout,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn completion_queue(&self) -> &dyn CompletionQueue {
        &*self.completion_queue
    }

    pub(crate) fn driver_idle_timeout(&self) -> Duration {
        self.driver_idle_timeout
    }

    /// Counts one more outstanding operation.
    pub fn work_started(&self) {
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one operation as finished.
    ///
    /// When the count reaches zero a thread blocked running the engine is woken
    /// so that it can notice there is nothing left to wait for.
    pub fn work_finished(&self) {
        let previous = self.outstanding_work.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "work_finished without a matching work_started");

        if previous == 1 {
            self.wake_running_thread();
        }
    }

    pub fn outstanding_work(&self) -> usize {
        self.outstanding_work.load(Ordering::Acquire)
    }

    /// Asks the running thread to return from its run loop as soon as possible.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(engine = self.name(), "stop requested");
            self.wake_running_thread();
        }
    }

    /// Clears a previous [`stop`](Self::stop) so that the engine can run again.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// `true` if stopped explicitly, or if nothing is outstanding and no thread
    /// is running the engine (no more work can ever arrive on its own).
    pub fn is_stopped(&self) -> bool {
        self.stop_requested()
            || (self.outstanding_work() == 0
                && self.running_thread.load(Ordering::Acquire) == NO_THREAD)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn running_in_this_thread(&self) -> bool {
        self.running_thread.load(Ordering::Acquire) == current_thread_id()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop predicate used by the run entry points.
    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested() || self.outstanding_work() == 0
    }

    /// Makes the current thread the running thread.
    ///
    /// # Errors
    /// Returns [`EngineError::AlreadyRunning`] if another thread, or an outer
    /// frame of this one, is already running the engine.
    pub fn enter(&self) -> Result<Running<'_>, EngineError> {
        let id = current_thread_id();

        match self.running_thread.compare_exchange(
            NO_THREAD,
            id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(Running::new(self)),
            Err(owner) => {
                warn!(
                    engine = self.name(),
                    owner,
                    thread = id,
                    "engine is already being run"
                );
                Err(EngineError::AlreadyRunning)
            }
        }
    }

    pub(crate) fn leave(&self) {
        self.running_thread.store(NO_THREAD, Ordering::Release);
    }

    /// Hands `operation` to the engine to be completed on its running thread.
    ///
    /// From the running thread the record goes straight onto the local queue and
    /// runs in FIFO order with other local work. From any other thread it goes
    /// through the remote queue, and the first record after the consumer went
    /// idle arms a wake-up event.
    pub fn submit<O>(&self, operation: O)
    where
        O: Operation,
    {
        self.submit_boxed(Box::new(operation));
    }

    pub(crate) fn submit_boxed(&self, operation: Box<dyn Operation>) {
        self.work_started();
        let node = Node::new(operation);

        if self.running_in_this_thread() {
            self.with_local_queue(|local| local.push_back(node));
            return;
        }

        if self.remote_queue.enqueue(node) {
            trace!(engine = self.name(), "remote work arrived, waking engine");
            self.completion_queue.notify(Tag::WAKE_UP);
        }
    }

    /// Runs `function` on the engine's running thread. Dropped without being
    /// called if the engine shuts down first.
    pub fn post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Posted(function));
    }

    /// Executor that schedules work onto this engine.
    ///
    /// The executor keeps the engine alive. Handlers bound to it that are still
    /// queued inside the same engine form a cycle, so drain or shut the engine
    /// down before dropping the last outside reference.
    pub fn executor(self: &Arc<Self>) -> EngineExecutor {
        EngineExecutor::new(self.clone())
    }

    /// Parks `operation` in the record arena and returns the tag the transport
    /// must report when the corresponding operation finishes.
    pub fn register<O>(&self, operation: O) -> Tag
    where
        O: Operation,
    {
        self.work_started();
        let key = self.records.lock().insert(Box::new(operation));

        Tag::from_raw(key.to_raw())
    }

    fn take_record(&self, tag: Tag) -> Option<Box<dyn Operation>> {
        self.records.lock().remove(Key::from_raw(tag.into_raw()))
    }

    /// Starts a tagged operation whose outcome is delivered to `handler`.
    ///
    /// The handler is stored first; only once that succeeded is the record
    /// registered and `start` called with its tag to arm the transport. On
    /// completion the handler receives `true` for success and `false` for a
    /// transport failure. A shutdown classification destroys it unfired.
    ///
    /// # Errors
    /// Returns [`HandlerError::Allocation`] if the handler's allocator refused to
    /// provide storage; nothing is registered and `start` is not called.
    pub fn initiate<H, S>(&self, handler: H, start: S) -> Result<Tag, HandlerError>
    where
        H: CompletionHandler<bool>,
        S: FnOnce(Tag),
    {
        let handler = ErasedHandler::new(handler)?;
        let tag = self.register(HandlerOperation::new(handler));
        start(tag);

        Ok(tag)
    }

    /// Adds `operation` to the list of records completed with
    /// [`OperationResult::ShutdownFailure`] when shutdown begins.
    ///
    /// Returns `None` and completes the record right away if shutdown already
    /// began.
    pub fn notify_when_done<O>(&self, operation: O) -> Option<NotifyHandle>
    where
        O: Operation,
    {
        let operation: Box<dyn Operation> = Box::new(operation);
        let mut list = self.notify_when_done.lock();
        self.work_started();

        if !self.is_shutdown() {
            return Some(list.push_back(operation));
        }

        drop(list);
        let _finished = WorkFinishedOnExit::new(self);
        operation.complete(OperationResult::ShutdownFailure, self);

        None
    }

    /// Removes an entry that finished before shutdown and completes it with
    /// `result`. Returns `false` if shutdown already completed it.
    pub fn finish_notify_when_done(&self, handle: NotifyHandle, result: OperationResult) -> bool {
        let operation = self.notify_when_done.lock().remove(handle);

        match operation {
            Some(operation) => {
                let _finished = WorkFinishedOnExit::new(self);
                operation.complete(result, self);
                true
            }
            None => false,
        }
    }

    /// Begins shutdown. Idempotent.
    ///
    /// The completion channel is told to shut down and every notify-when-done
    /// entry is completed with [`OperationResult::ShutdownFailure`] before this
    /// returns. From then on every record is completed with a shutdown
    /// classification.
    ///
    /// # Panics
    /// If an entry panics, the remaining entries are still completed and the
    /// first panic is resumed afterwards.
    pub fn initiate_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = self.notify_when_done.lock().len();
        debug!(engine = self.name(), pending, "initiating shutdown");

        self.completion_queue.shutdown();

        let mut first_panic = None;
        loop {
            let next = self.notify_when_done.lock().pop_front();
            let Some(operation) = next else { break };

            let _finished = WorkFinishedOnExit::new(self);
            let completed = panic::catch_unwind(AssertUnwindSafe(|| {
                operation.complete(OperationResult::ShutdownFailure, self)
            }));

            if let Err(payload) = completed {
                warn!(engine = self.name(), "notify-when-done entry panicked during shutdown");
                first_panic.get_or_insert(payload);
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    /// Runs until stopped or until no work is outstanding.
    ///
    /// # Returns
    /// Whether any record was processed.
    ///
    /// # Errors
    /// Returns [`EngineError::AlreadyRunning`] if another thread is running the engine.
    pub fn run(&self) -> Result<bool, EngineError> {
        self.run_loop("run", Deadline::Never)
    }

    /// Processes whatever is ready without blocking.
    pub fn poll(&self) -> Result<bool, EngineError> {
        self.run_loop("poll", Deadline::Immediate)
    }

    /// Like [`run`](Self::run), but returns once `deadline` has passed.
    pub fn run_until(&self, deadline: Instant) -> Result<bool, EngineError> {
        self.run_loop("run_until", Deadline::At(deadline))
    }

    /// Runs while `condition` holds and the engine is not stopped.
    ///
    /// Blocks on the completion channel between checks, so `condition` should
    /// depend on work the engine itself completes.
    pub fn run_while<P>(&self, mut condition: P) -> Result<bool, EngineError>
    where
        P: FnMut() -> bool,
    {
        let mut running = self.enter()?;
        let _span = debug_span!("engine", name = self.name(), entry = "run_while").entered();

        let mut processed = false;
        while condition() {
            let progressed = running.run_one_with(Deadline::Never, InvokeMode::Normal, || {
                self.stop_requested() || !condition()
            });

            if !progressed {
                break;
            }
            processed = true;
        }

        Ok(processed)
    }

    /// Handles only completion-channel events that are already available,
    /// leaving queued work for the next step.
    pub fn poll_completion_queue(&self) -> Result<bool, EngineError> {
        let _running = self.enter()?;
        let mode = self.effective_mode(InvokeMode::Normal);

        let mut processed = false;
        while self.handle_next_completion_queue_event(Deadline::Immediate, mode) {
            processed = true;
        }

        Ok(processed)
    }

    fn run_loop(&self, entry: &'static str, deadline: Deadline) -> Result<bool, EngineError> {
        let mut running = self.enter()?;
        let _span = debug_span!("engine", name = self.name(), entry).entered();
        debug!("engine started");

        let mut processed = false;
        while running.run_one(deadline, InvokeMode::Normal) {
            processed = true;
        }

        debug!(processed, outstanding = self.outstanding_work(), "engine returned");
        Ok(processed)
    }

    /// One step of the run loop. Only called through [`Running`].
    pub(crate) fn do_one(
        &self,
        deadline: Deadline,
        mode: InvokeMode,
        stop: &mut dyn FnMut() -> bool,
    ) -> bool {
        let mode = self.effective_mode(mode);

        if self.check_remote_work.load(Ordering::Acquire) {
            self.move_remote_work_to_local_queue();
        }

        let processed_local = self.process_local_queue(mode);

        let more_work = self.check_remote_work.load(Ordering::Acquire)
            || !self.with_local_queue(|local| local.is_empty());

        if !more_work && stop() {
            return processed_local;
        }

        let deadline = if more_work {
            Deadline::Immediate
        } else {
            deadline
        };

        let handled_event = self.handle_next_completion_queue_event(deadline, mode);

        processed_local || handled_event
    }

    fn effective_mode(&self, mode: InvokeMode) -> InvokeMode {
        if self.is_shutdown() {
            InvokeMode::ForceDrain
        } else {
            mode
        }
    }

    fn move_remote_work_to_local_queue(&self) {
        let remote = self.remote_queue.dequeue_all_or_mark_inactive();

        if remote.is_empty() {
            // The queue is marked inactive now; the next producer re-arms a wake-up.
            self.check_remote_work.store(false, Ordering::Release);
            return;
        }

        trace!(count = remote.len(), "moving remote work to the local queue");
        self.with_local_queue(|local| local.append(remote));
    }

    /// Runs the records that were in the local queue when the step began.
    /// Records they submit wait for the next step.
    fn process_local_queue(&self, mode: InvokeMode) -> bool {
        let mut batch = Batch {
            engine: self,
            queue: self.with_local_queue(LocalQueue::take),
        };

        if batch.queue.is_empty() {
            return false;
        }

        let result = mode.queued_result();
        while let Some(node) = batch.queue.pop_front() {
            let _finished = WorkFinishedOnExit::new(self);
            node.into_operation().complete(result, self);
        }

        true
    }

    /// Polls the completion channel once and dispatches what it yields.
    fn handle_next_completion_queue_event(&self, deadline: Deadline, mode: InvokeMode) -> bool {
        let event = match self.completion_queue.next(deadline) {
            Next::Event(event) => event,
            Next::Timeout => return false,
            Next::Shutdown => {
                self.channel_drained.store(true, Ordering::Release);
                return false;
            }
        };

        if event.tag.is_wake_up() {
            self.check_remote_work.store(true, Ordering::Release);
            return true;
        }

        let Some(operation) = self.take_record(event.tag) else {
            warn!(tag = ?event.tag, ok = event.ok, "completion event for an unknown tag");
            return true;
        };

        // Events that race with shutdown are classified as forced completions.
        let result = OperationResult::from_event(event.ok, self.effective_mode(mode));

        let _finished = WorkFinishedOnExit::new(self);
        operation.complete(result, self);

        true
    }

    /// Wakes the running thread if it is some other thread that may be blocked
    /// in the completion channel.
    fn wake_running_thread(&self) {
        let running = self.running_thread.load(Ordering::Acquire);

        if running != NO_THREAD && running != current_thread_id() {
            trace!(engine = self.name(), "waking running thread");
            self.completion_queue.notify(Tag::WAKE_UP);
        }
    }

    fn with_local_queue<R>(&self, f: impl FnOnce(&mut LocalQueue) -> R) -> R {
        debug_assert!(self.running_in_this_thread());

        // SAFETY: only the running thread gets here, and no caller re-enters the
        // engine from `f`, so this is the only live reference.
        unsafe { f(&mut *self.local_queue.get()) }
    }

    /// Completes every record that is still queued or registered with a
    /// shutdown classification.
    fn force_drain(&self) {
        debug!(engine = self.name(), "force-draining engine");

        while !self.channel_drained.load(Ordering::Acquire) {
            self.handle_next_completion_queue_event(Deadline::Never, InvokeMode::ForceDrain);
        }

        loop {
            let remote = self.remote_queue.dequeue_all();
            self.with_local_queue(|local| local.append(remote));
            let processed = self.process_local_queue(InvokeMode::ForceDrain);

            let orphans = self.records.lock().drain();
            let had_orphans = !orphans.is_empty();
            if had_orphans {
                debug!(count = orphans.len(), "completing records the transport never reported");
            }

            for operation in orphans {
                let _finished = WorkFinishedOnExit::new(self);
                operation.complete(OperationResult::ShutdownFailure, self);
            }

            if !processed && !had_orphans {
                break;
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let shutdown = panic::catch_unwind(AssertUnwindSafe(|| self.initiate_shutdown()));
        debug_assert!(self.notify_when_done.get_mut().is_empty());

        // Nothing else can reach the engine any more; the dropping thread drains it.
        *self.running_thread.get_mut() = current_thread_id();
        self.force_drain();
        *self.running_thread.get_mut() = NO_THREAD;

        if let Err(payload) = shutdown {
            panic::resume_unwind(payload);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("outstanding_work", &self.outstanding_work())
            .field("stopped", &self.stop_requested())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Calls `work_finished` when dropped, including during unwinding.
struct WorkFinishedOnExit<'a> {
    engine: &'a Engine,
}

impl<'a> WorkFinishedOnExit<'a> {
    fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }
}

impl Drop for WorkFinishedOnExit<'_> {
    fn drop(&mut self) {
        self.engine.work_finished();
    }
}

/// Local-queue snapshot being processed. If a record panics, the records that
/// did not run yet go back to the front of the local queue.
struct Batch<'a> {
    engine: &'a Engine,
    queue: LocalQueue,
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let rest = self.queue.take();
        self.engine.with_local_queue(|local| {
            let newer = local.take();
            local.append(rest);
            local.append(newer);
        });
    }
}
