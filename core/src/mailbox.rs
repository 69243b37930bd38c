//! Serialized work queues.
//!
//! A [`Mailbox`] owns one island of state and a FIFO of work items. At most
//! one worker thread services the queue, so every item runs with exclusive
//! access to the island and items never overlap. The worker is lazy: it is
//! spawned on the first enqueue, lingers for the configured idle timeout
//! once the queue drains, then exits and releases its thread until the next
//! enqueue respawns it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::options::ActorOptions;

/// A unit of work executed with exclusive access to the island state.
pub type WorkItem<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Queue-level failures surfaced to blocking callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// A blocking call was made from the mailbox's own worker thread. The
    /// worker can never service the call it is itself waiting on.
    #[error("blocking call re-entered its own worker thread")]
    Reentrant,

    /// The work item was discarded by [`Mailbox::clear`] before it ran.
    #[error("work item was discarded before it ran")]
    Discarded,
}

struct QueueCore<S> {
    items: VecDeque<WorkItem<S>>,
    worker_live: bool,
    worker_thread: Option<ThreadId>,
}

struct MailboxInner<S> {
    options: ActorOptions,
    island: Mutex<S>,
    queue: Mutex<QueueCore<S>>,
    work_ready: Condvar,
}

/// A FIFO work queue serviced by at most one background worker at a time.
pub struct Mailbox<S: Send + 'static> {
    inner: Arc<MailboxInner<S>>,
}

impl<S: Send + 'static> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A mailbox reference that does not keep the island alive. Used for the
/// actor's internal self-links so timers and observers never pin a dead
/// actor in memory.
pub struct WeakMailbox<S: Send + 'static> {
    inner: Weak<MailboxInner<S>>,
}

impl<S: Send + 'static> Clone for WeakMailbox<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> Mailbox<S> {
    pub fn new(island: S, options: ActorOptions) -> Self {
        Self::build(options, |_| island)
    }

    /// Builds a mailbox whose island needs a [`WeakMailbox`] back-reference,
    /// e.g. an actor holding its own link.
    pub(crate) fn new_cyclic(
        options: ActorOptions,
        make_island: impl FnOnce(WeakMailbox<S>) -> S,
    ) -> Self {
        Self::build(options, make_island)
    }

    fn build(options: ActorOptions, make_island: impl FnOnce(WeakMailbox<S>) -> S) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<MailboxInner<S>>| {
            let island = make_island(WeakMailbox {
                inner: Weak::clone(weak),
            });
            MailboxInner {
                options,
                island: Mutex::new(island),
                queue: Mutex::new(QueueCore {
                    items: VecDeque::new(),
                    worker_live: false,
                    worker_thread: None,
                }),
                work_ready: Condvar::new(),
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    /// Appends work to the queue. The work never runs synchronously on the
    /// calling thread; a worker is started if none is live.
    pub fn enqueue(&self, work: impl FnOnce(&mut S) + Send + 'static) {
        self.push(Box::new(work));
    }

    fn push(&self, work: WorkItem<S>) {
        let must_spawn = {
            let mut queue = self.inner.queue.lock();
            queue.items.push_back(work);
            if queue.worker_live {
                self.inner.work_ready.notify_one();
                false
            } else {
                queue.worker_live = true;
                true
            }
        };
        if must_spawn {
            Self::spawn_worker(&self.inner);
        }
    }

    fn spawn_worker(inner: &Arc<MailboxInner<S>>) {
        let name = inner.options.name.clone();
        let for_worker = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(for_worker));
        if let Err(err) = spawned {
            inner.queue.lock().worker_live = false;
            error!(mailbox = %name, %err, "failed to spawn mailbox worker");
        }
    }

    /// Enqueues `work` and blocks until it completes, returning its value.
    /// A panic inside `work` is propagated back to this caller rather than
    /// the worker.
    pub fn execute<R: Send + 'static>(
        &self,
        work: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, MailboxError> {
        if self.current_thread_on() {
            return Err(MailboxError::Reentrant);
        }
        let completion = Arc::new(Completion::new());
        let relay = CompletionRelay {
            completion: Arc::clone(&completion),
            work: Some(work),
        };
        self.enqueue(move |island| relay.run(island));
        completion.wait()
    }

    /// Discards all queued items that have not started. The currently
    /// executing item, if any, is not interrupted. Blocked `execute` callers
    /// whose items are discarded observe [`MailboxError::Discarded`].
    pub fn clear(&self) {
        let drained: Vec<WorkItem<S>> = {
            let mut queue = self.inner.queue.lock();
            queue.items.drain(..).collect()
        };
        if !drained.is_empty() {
            trace!(mailbox = %self.name(), discarded = drained.len(), "cleared queue");
        }
    }

    /// Number of queued items not yet started.
    pub fn count(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    /// Blocks until every item queued before this call has completed, by
    /// enqueuing a sentinel and awaiting it.
    pub fn wait(&self) -> Result<(), MailboxError> {
        self.execute(|_island| ())
    }

    /// Whether the calling thread is this mailbox's worker.
    pub fn current_thread_on(&self) -> bool {
        self.inner.queue.lock().worker_thread == Some(thread::current().id())
    }

    pub fn downgrade(&self) -> WeakMailbox<S> {
        WeakMailbox {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<S: Send + 'static> WeakMailbox<S> {
    pub fn upgrade(&self) -> Option<Mailbox<S>> {
        self.inner.upgrade().map(|inner| Mailbox { inner })
    }

    /// Enqueues if the island is still alive. Returns false when the actor
    /// is gone and the work was dropped.
    pub fn enqueue(&self, work: impl FnOnce(&mut S) + Send + 'static) -> bool {
        match self.upgrade() {
            Some(mailbox) => {
                mailbox.enqueue(work);
                true
            }
            None => {
                trace!("dropped work item for dead mailbox");
                false
            }
        }
    }
}

fn run_worker<S: Send + 'static>(inner: Arc<MailboxInner<S>>) {
    let idle = inner.options.idle_timeout();
    inner.queue.lock().worker_thread = Some(thread::current().id());
    debug!(mailbox = %inner.options.name, "worker started");
    loop {
        let item = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(item) = queue.items.pop_front() {
                    break Some(item);
                }
                let timed_out = inner.work_ready.wait_for(&mut queue, idle).timed_out();
                if timed_out && queue.items.is_empty() {
                    queue.worker_live = false;
                    queue.worker_thread = None;
                    break None;
                }
            }
        };
        let Some(item) = item else {
            break;
        };
        let mut island = inner.island.lock();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| item(&mut island))) {
            error!(
                mailbox = %inner.options.name,
                "work item panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
    debug!(mailbox = %inner.options.name, "worker exited after idle timeout");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

enum CompletionState<R> {
    Pending,
    Finished(thread::Result<R>),
    Discarded,
}

struct Completion<R> {
    slot: Mutex<CompletionState<R>>,
    done: Condvar,
}

impl<R> Completion<R> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(CompletionState::Pending),
            done: Condvar::new(),
        }
    }

    fn fill(&self, state: CompletionState<R>) {
        *self.slot.lock() = state;
        self.done.notify_all();
    }

    fn wait(&self) -> Result<R, MailboxError> {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, CompletionState::Pending) {
                CompletionState::Pending => self.done.wait(&mut slot),
                CompletionState::Finished(Ok(value)) => return Ok(value),
                CompletionState::Finished(Err(panic)) => {
                    drop(slot);
                    resume_unwind(panic);
                }
                CompletionState::Discarded => return Err(MailboxError::Discarded),
            }
        }
    }
}

/// Carries an `execute` work item into the queue. If the item is dropped
/// without running (the queue was cleared), the blocked caller is released
/// with [`MailboxError::Discarded`] instead of hanging.
struct CompletionRelay<R, F> {
    completion: Arc<Completion<R>>,
    work: Option<F>,
}

impl<R, F> CompletionRelay<R, F> {
    fn run<S>(mut self, island: &mut S)
    where
        F: FnOnce(&mut S) -> R,
    {
        if let Some(work) = self.work.take() {
            let result = catch_unwind(AssertUnwindSafe(|| work(island)));
            self.completion.fill(CompletionState::Finished(result));
        }
    }
}

impl<R, F> Drop for CompletionRelay<R, F> {
    fn drop(&mut self) {
        if self.work.is_some() {
            self.completion.fill(CompletionState::Discarded);
        }
    }
}
