//! Actor base: a serialized island of state behind a message facade.
//!
//! An actor is user data living inside a [`Mailbox`]; every interaction is a
//! work item and the mailbox guarantees items never overlap, so the data is
//! a logical single-threaded island. The [`ActorHandle`] is the facade held
//! by callers: void dispatches are fire-and-forget, value dispatches block
//! for the result, and every work item runs inside the error-handling
//! wrapper so failures reach the [`Behavior`] hooks instead of the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, debug_span, info, warn};
use uuid::Uuid;

use crate::errors::{ActorError, ErrorKind};
use crate::mailbox::{Mailbox, WeakMailbox};
use crate::observers::{ObserverList, Subscription};
use crate::options::ActorOptions;

/// User-defined behavior hosted by a plain actor. All hooks default to
/// no-ops; a timeout degrades to fault handling unless overridden.
pub trait Behavior: Send + Sized + 'static {
    /// Domain-level failure the actor is expected to recover from.
    fn on_fault(&mut self, _error: &ActorError) {}

    /// An elapsed deadline.
    fn on_timeout(&mut self, error: &ActorError) {
        self.on_fault(error);
    }

    /// Any other failure.
    fn on_error(&mut self, _error: &ActorError) {}
}

/// Weak self-reference used by code already running on the actor to bounce
/// follow-up work onto its own mailbox. Never keeps a dead actor alive.
pub struct ActorLink<C: Send + 'static> {
    pub(crate) mailbox: WeakMailbox<C>,
    pub(crate) name: Arc<str>,
}

impl<C: Send + 'static> Clone for ActorLink<C> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            name: Arc::clone(&self.name),
        }
    }
}

impl<C: Send + 'static> ActorLink<C> {
    pub(crate) fn new(mailbox: WeakMailbox<C>, name: Arc<str>) -> Self {
        Self { mailbox, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw enqueue; dropped silently when the actor is gone.
    pub(crate) fn send(&self, work: impl FnOnce(&mut C) + Send + 'static) {
        self.mailbox.enqueue(work);
    }
}

impl<D: Behavior> ActorLink<Actor<D>> {
    /// Enqueues a closure through the error-handling wrapper.
    pub fn act(&self, work: impl FnOnce(&mut Actor<D>) -> Result<(), ActorError> + Send + 'static) {
        self.send(move |actor| {
            if let Err(error) = work(actor) {
                actor.deliver_exception(error);
            }
        });
    }
}

/// Work-item view of a plain actor: the domain data plus the plumbing the
/// data's callbacks may touch.
pub struct Actor<D: Behavior> {
    data: D,
    link: ActorLink<Actor<D>>,
    errors: ObserverList<ActorError>,
    name: Arc<str>,
}

impl<D: Behavior> Actor<D> {
    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn link(&self) -> &ActorLink<Actor<D>> {
        &self.link
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routes a failure through the error policy: observers first, then the
    /// kind-matched behavior hook. A secondary failure inside handling is
    /// reported at debug level and swallowed; nothing escapes the worker.
    pub fn deliver_exception(&mut self, error: ActorError) {
        warn!(actor = %self.name, %error, "actor error");
        let delivery = catch_unwind(AssertUnwindSafe(|| {
            self.errors.notify(&error);
            match error.kind() {
                ErrorKind::Timeout => self.data.on_timeout(&error),
                ErrorKind::Fault | ErrorKind::WatchedState => self.data.on_fault(&error),
                _ => self.data.on_error(&error),
            }
        }));
        if delivery.is_err() {
            debug!(actor = %self.name, "secondary failure inside error handling was swallowed");
        }
    }
}

/// Identity shared by every actor facade; lets heterogeneous handles live in
/// one registry.
pub trait ActorIdentity {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
}

/// Owning facade of a plain actor. Cloneable; the actor lives as long as a
/// facade (or its worker) does.
pub struct ActorHandle<D: Behavior> {
    mailbox: Mailbox<Actor<D>>,
    errors: ObserverList<ActorError>,
    id: Uuid,
    name: Arc<str>,
}

impl<D: Behavior> Clone for ActorHandle<D> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            errors: self.errors.clone(),
            id: self.id,
            name: Arc::clone(&self.name),
        }
    }
}

impl<D: Behavior> std::fmt::Debug for ActorHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl<D: Behavior> ActorIdentity for ActorHandle<D> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<D: Behavior> ActorHandle<D> {
    pub fn spawn(data: D, options: ActorOptions) -> Self {
        let name: Arc<str> = options.name.clone().into();
        let errors = ObserverList::new();
        let errors_cell = errors.clone();
        let name_cell = Arc::clone(&name);
        let mailbox = Mailbox::new_cyclic(options, move |weak| Actor {
            data,
            link: ActorLink::new(weak, Arc::clone(&name_cell)),
            errors: errors_cell,
            name: name_cell,
        });
        let id = Uuid::new_v4();
        info!(actor = %name, %id, "spawned actor");
        Self {
            mailbox,
            errors,
            id,
            name,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a closure through the error-handling wrapper.
    pub fn act(&self, work: impl FnOnce(&mut Actor<D>) -> Result<(), ActorError> + Send + 'static) {
        self.mailbox.enqueue(move |actor| {
            if let Err(error) = work(actor) {
                actor.deliver_exception(error);
            }
        });
    }

    /// Runs `work` as one uninterrupted work item: no other facade call can
    /// interleave with the batch.
    pub fn atomically(
        &self,
        work: impl FnOnce(&mut Actor<D>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.act(work);
    }

    /// Void dispatch: fire-and-forget. Returns as soon as the call is
    /// queued; failures reach the error observers and behavior hooks only.
    pub fn post(
        &self,
        method: &'static str,
        work: impl FnOnce(&mut Actor<D>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.mailbox.enqueue(move |actor| {
            let _span = debug_span!("invoke", actor = %actor.name, method).entered();
            if let Err(error) = work(actor) {
                actor.deliver_exception(error);
            }
        });
    }

    /// Value dispatch: blocks until the handler has run and returns its
    /// result. Handler errors are routed through the error policy *and*
    /// propagated to this caller.
    pub fn call<R: Send + 'static>(
        &self,
        method: &'static str,
        work: impl FnOnce(&mut Actor<D>) -> Result<R, ActorError> + Send + 'static,
    ) -> Result<R, ActorError> {
        let outcome = self.mailbox.execute(move |actor| {
            let _span = debug_span!("invoke", actor = %actor.name, method).entered();
            match work(actor) {
                Ok(value) => Ok(value),
                Err(error) => {
                    actor.deliver_exception(error.clone());
                    Err(error)
                }
            }
        });
        match outcome {
            Ok(result) => result,
            Err(queue_error) => Err(ActorError::Mailbox(queue_error)),
        }
    }

    /// Observes every error the actor's policy handles.
    #[must_use = "dropping the subscription immediately unsubscribes"]
    pub fn observe_errors(&self, callback: impl Fn(&ActorError) + Send + Sync + 'static) -> Subscription {
        self.errors.subscribe(callback)
    }

    /// Blocks until all work queued before this call has completed.
    pub fn wait(&self) -> Result<(), ActorError> {
        self.mailbox.wait().map_err(ActorError::Mailbox)
    }

    /// Number of queued calls not yet started.
    pub fn pending(&self) -> usize {
        self.mailbox.count()
    }

    /// Whether the calling thread is this actor's worker.
    pub fn on_worker(&self) -> bool {
        self.mailbox.current_thread_on()
    }
}
