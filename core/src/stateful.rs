//! Stateful actors: a serialized island driven by a hierarchical state
//! machine, with per-state command validity.
//!
//! A [`StatefulActor`] is built from an [`Automaton`] implementation: the
//! behavior describes its state chart and command table once, and the
//! runtime enforces them on every facade call. Dispatch runs on the worker:
//! the command table may reject the call in the current state, translate it
//! into a trigger, or fall through to the handler body. Triggers fired from
//! inside a transition are re-enqueued, so transitions never nest.
//!
//! Beyond dispatch, the actor offers lifecycle-scoped plumbing: one-shot
//! watchers that fire when a state is left, periodic timers and one-shot
//! deadlines that cancel themselves on state exit, watches over other
//! actors' state changes, and continuations of asynchronous tasks that are
//! dropped if the actor has moved on.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::channel::oneshot;
use futures::executor::block_on;
use tracing::{debug, debug_span, info, warn};
use uuid::Uuid;

use crate::actor::{ActorIdentity, ActorLink};
use crate::errors::{ActorError, ErrorKind};
use crate::mailbox::Mailbox;
use crate::observers::{ObserverList, Subscription};
use crate::options::ActorOptions;
use crate::state_machine::{
    MachineBuilder, StateChanged, StateMachine, StateMirror,
};
use crate::timer::Scheduler;

/// Bounded transition history kept per actor.
const HISTORY_LIMIT: usize = 256;

/// Self-link of a stateful actor.
pub type StatefulLink<A> = ActorLink<StatefulActor<A>>;

/// Builder type returned by [`Automaton::states`].
pub type MachineLayout<A> = MachineBuilder<
    <A as Automaton>::State,
    <A as Automaton>::Trigger,
    ActorBody<A>,
>;

/// The subclass contract of a stateful actor: the state chart, the command
/// table, and the overridable error and lifecycle hooks.
pub trait Automaton: Send + Sized + 'static {
    type State: crate::state_machine::StateKey;
    type Trigger: crate::state_machine::TriggerKey;

    /// Describes the state chart. Called once at spawn; configuration
    /// errors fail the spawn.
    fn states(&self) -> MachineLayout<Self>;

    /// Per-method command policy, indexed by method identity. Methods with
    /// no entry are unrestricted.
    fn commands(&self) -> Vec<Command<Self::State, Self::Trigger>> {
        Vec::new()
    }

    /// Domain-level failure the actor recovers from, typically by firing a
    /// fault trigger through `link`.
    fn on_fault(&mut self, _link: &StatefulLink<Self>, _error: &ActorError) {}

    /// An elapsed deadline.
    fn on_timeout(&mut self, link: &StatefulLink<Self>, error: &ActorError) {
        self.on_fault(link, error);
    }

    /// Any other failure.
    fn on_error(&mut self, _link: &StatefulLink<Self>, _error: &ActorError) {}

    /// First look at errors raised inside the state machine (guard, setup,
    /// enter/exit hooks, mid-transition fires). Return true to consume the
    /// error; false routes it through the standard handling.
    fn state_error(&mut self, _link: &StatefulLink<Self>, _error: &ActorError) -> bool {
        false
    }

    /// Invoked after every completed transition.
    fn on_state_changed(
        &mut self,
        _link: &StatefulLink<Self>,
        _change: &StateChanged<Self::State, Self::Trigger>,
    ) {
    }

    /// Invoked when a fired trigger matches no transition anywhere up the
    /// parent chain. Non-fatal; the default only logs.
    fn on_unhandled_trigger(&mut self, _link: &StatefulLink<Self>, _trigger: Self::Trigger) {}
}

/// Per-method dispatch policy: the states a call is valid in, and an
/// optional trigger the call translates into.
#[derive(Clone)]
pub struct Command<S, T> {
    method: &'static str,
    valid_in: Option<Vec<S>>,
    trigger: Option<T>,
}

impl<S: Copy, T: Copy> Command<S, T> {
    /// Unrestricted command for `method`.
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            valid_in: None,
            trigger: None,
        }
    }

    /// Restricts the command to calls made while in any of `states`
    /// (directly or via a substate).
    pub fn valid_in(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.valid_in = Some(states.into_iter().collect());
        self
    }

    /// Translates the call into a trigger instead of running a handler.
    pub fn fires(mut self, trigger: T) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn method(&self) -> &'static str {
        self.method
    }
}

/// One recorded transition.
#[derive(Clone, Debug)]
pub struct TransitionRecord<S, T> {
    pub at: DateTime<Utc>,
    pub from: S,
    pub to: S,
    pub trigger: Option<T>,
}

type WatcherFn<A> = Box<dyn FnOnce(&mut ActorBody<A>) + Send>;

/// One-shot callback armed to fire when the actor leaves `state`.
struct Watcher<A: Automaton> {
    state: A::State,
    callback: WatcherFn<A>,
}

type TimeoutFn<A> =
    Box<dyn FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send>;

/// The portion of a stateful actor visible to state-machine callbacks: the
/// domain data plus watchers, timers, history, and the self-link. Enter and
/// exit hooks receive `&mut ActorBody<A>`; everything that additionally
/// needs the machine itself (firing, updating) goes through the link and is
/// re-enqueued.
pub struct ActorBody<A: Automaton> {
    data: A,
    link: StatefulLink<A>,
    mirror: Arc<StateMirror<A::State>>,
    commands: Arc<HashMap<&'static str, Command<A::State, A::Trigger>>>,
    watchers: Vec<Watcher<A>>,
    history: VecDeque<TransitionRecord<A::State, A::Trigger>>,
    errors: ObserverList<ActorError>,
    name: Arc<str>,
}

impl<A: Automaton> ActorBody<A> {
    pub fn data(&self) -> &A {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut A {
        &mut self.data
    }

    pub fn link(&self) -> &StatefulLink<A> {
        &self.link
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, read through the published cursor.
    pub fn state(&self) -> A::State {
        self.mirror.current()
    }

    /// Whether `state` is the current state or one of its ancestors.
    pub fn in_state(&self, state: A::State) -> bool {
        self.mirror.in_state(state)
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord<A::State, A::Trigger>> {
        self.history.iter().cloned().collect()
    }

    /// Routes a failure through the error policy: observers first, then the
    /// kind-matched behavior hook. A secondary failure inside handling is
    /// reported and swallowed; nothing escapes the worker.
    pub fn deliver_exception(&mut self, error: ActorError) {
        warn!(actor = %self.name, %error, "actor error");
        let Self {
            data, link, errors, ..
        } = self;
        let delivery = catch_unwind(AssertUnwindSafe(|| {
            errors.notify(&error);
            match error.kind() {
                ErrorKind::Timeout => data.on_timeout(link, &error),
                ErrorKind::Fault | ErrorKind::WatchedState => data.on_fault(link, &error),
                _ => data.on_error(link, &error),
            }
        }));
        if delivery.is_err() {
            debug!(actor = %self.name, "secondary failure inside error handling was swallowed");
        }
    }

    /// Arms a one-shot callback that fires the first time the actor is no
    /// longer in `state`. If the actor is already outside it, the callback
    /// fires immediately on the calling thread.
    pub fn watch_state(
        &mut self,
        state: A::State,
        callback: impl FnOnce(&mut ActorBody<A>) + Send + 'static,
    ) {
        if !self.in_state(state) {
            callback(self);
            return;
        }
        self.watchers.push(Watcher {
            state,
            callback: Box::new(callback),
        });
    }

    fn flush_watchers(&mut self, change: &StateChanged<A::State, A::Trigger>) {
        if self.watchers.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.watchers.len());
        let mut matured = Vec::new();
        for watcher in std::mem::take(&mut self.watchers) {
            if change.still_in(watcher.state) {
                kept.push(watcher);
            } else {
                matured.push(watcher);
            }
        }
        // Reinstall survivors before running callbacks so a callback can
        // arm new watchers without clobbering them.
        self.watchers = kept;
        for watcher in matured {
            (watcher.callback)(self);
        }
    }

    fn note_transition(&mut self, change: &StateChanged<A::State, A::Trigger>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            at: Utc::now(),
            from: change.old,
            to: change.new,
            trigger: change.trigger,
        });
    }

    /// Starts a periodic timer scoped to `scope` (the current state when
    /// `None`). Ticks run on the worker and receive the high-resolution
    /// elapsed time since the previous tick. Leaving the scope cancels the
    /// timer; ticks already in flight are discarded.
    pub fn repeat_while_in_state(
        &mut self,
        interval: Duration,
        scope: Option<A::State>,
        callback: impl Fn(&mut StatefulActor<A>, Duration) -> Result<(), ActorError>
            + Send
            + Sync
            + 'static,
    ) {
        let scope = scope.unwrap_or_else(|| self.state());
        let left = Arc::new(AtomicBool::new(false));
        let link = self.link.clone();
        let callback = Arc::new(callback);
        let tick_left = Arc::clone(&left);
        let mut last = Instant::now();
        let timer = Scheduler::global().every(interval, move || {
            let now = Instant::now();
            let elapsed = now - last;
            last = now;
            if tick_left.load(Ordering::SeqCst) {
                return;
            }
            let callback = Arc::clone(&callback);
            let item_left = Arc::clone(&tick_left);
            link.act(move |actor| {
                // The scope may have been left while this tick was in
                // flight; the flag, not the timer, is the source of truth.
                if item_left.load(Ordering::SeqCst) {
                    return Ok(());
                }
                callback(actor, elapsed)
            });
        });
        self.watch_state(scope, move |_body| {
            left.store(true, Ordering::SeqCst);
            timer.cancel();
        });
    }

    /// One-shot deadline scoped to `scope` (the current state when `None`).
    /// If the deadline elapses while still in scope, a timeout fault is
    /// raised through the error policy. Delivered at most once.
    pub fn timeout_while_in_state(&mut self, delay: Duration, scope: Option<A::State>) {
        self.arm_timeout(delay, scope, None);
    }

    /// Like [`ActorBody::timeout_while_in_state`], but runs `callback`
    /// instead of raising a timeout fault.
    pub fn timeout_while_in_state_with(
        &mut self,
        delay: Duration,
        scope: Option<A::State>,
        callback: impl FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.arm_timeout(delay, scope, Some(Box::new(callback)));
    }

    fn arm_timeout(&mut self, delay: Duration, scope: Option<A::State>, callback: Option<TimeoutFn<A>>) {
        let scope = scope.unwrap_or_else(|| self.state());
        let fired = Arc::new(AtomicBool::new(false));
        let link = self.link.clone();
        let fire_flag = Arc::clone(&fired);
        let timer = Scheduler::global().once(delay, move || {
            link.act(move |actor| {
                if fire_flag.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                match callback {
                    Some(callback) => callback(actor),
                    None => Err(ActorError::Timeout(format!(
                        "state deadline of {delay:?} elapsed"
                    ))),
                }
            });
        });
        self.watch_state(scope, move |_body| {
            fired.store(true, Ordering::SeqCst);
            timer.cancel();
        });
    }

    /// While in `scope`, follows another actor's state changes. Each change
    /// is bounced onto this actor's worker; `action` runs when the actor is
    /// still in scope and `condition(other_state, Some(change))` holds. The
    /// condition is also evaluated immediately against the other actor's
    /// current state (with no change event). Leaving the scope drops the
    /// subscription.
    pub fn watch_other_while_in_state<O: Automaton>(
        &mut self,
        other: &StatefulHandle<O>,
        condition: impl Fn(O::State, Option<&StateChanged<O::State, O::Trigger>>) -> bool
            + Send
            + Sync
            + 'static,
        action: impl Fn(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + Sync + 'static,
        scope: A::State,
    ) {
        if !self.in_state(scope) {
            return;
        }
        let condition = Arc::new(condition);
        let action = Arc::new(action);
        let link = self.link.clone();
        let notify_condition = Arc::clone(&condition);
        let notify_action = Arc::clone(&action);
        let subscription = other.observe_state(move |change| {
            let change = change.clone();
            let condition = Arc::clone(&notify_condition);
            let action = Arc::clone(&notify_action);
            link.act(move |actor| {
                if actor.in_state(scope) && condition(change.new, Some(&change)) {
                    action(actor)
                } else {
                    Ok(())
                }
            });
        });
        self.watch_state(scope, move |_body| subscription.cancel());
        if condition(other.state(), None) {
            let action = Arc::clone(&action);
            self.link.act(move |actor| {
                if actor.in_state(scope) {
                    action(actor)
                } else {
                    Ok(())
                }
            });
        }
    }

    /// Re-evaluates this actor's guards whenever `other` changes state, for
    /// as long as the current state is held.
    pub fn watch_other_and_update<O: Automaton>(&mut self, other: &StatefulHandle<O>) {
        let scope = self.state();
        self.watch_other_while_in_state(
            other,
            |_, _| true,
            |actor| {
                actor.update();
                Ok(())
            },
            scope,
        );
    }

    /// Like [`ActorBody::watch_other_and_update`], but raises a
    /// watched-state fault naming the other actor whenever it sits in
    /// `error_state`.
    pub fn watch_other_and_update_or_fault<O: Automaton>(
        &mut self,
        other: &StatefulHandle<O>,
        error_state: O::State,
    ) {
        let scope = self.state();
        let other_name = other.name().to_string();
        let probe = other.clone();
        self.watch_other_while_in_state(
            other,
            |_, _| true,
            move |actor| {
                if probe.in_state(error_state) {
                    Err(ActorError::WatchedState {
                        actor: other_name.clone(),
                        state: format!("{error_state:?}"),
                    })
                } else {
                    actor.update();
                    Ok(())
                }
            },
            scope,
        );
    }

    /// Attaches a completion to an asynchronous task. When the task
    /// finishes and the actor is still in `scope`, `then` runs on the
    /// worker with the result. A dropped sender counts as cancellation and
    /// raises [`ActorError::Canceled`].
    pub fn continue_while_in_state<R: Send + 'static>(
        &mut self,
        task: oneshot::Receiver<R>,
        then: impl FnOnce(&mut StatefulActor<A>, R) -> Result<(), ActorError> + Send + 'static,
        scope: A::State,
    ) {
        let link = self.link.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-continuation", self.name))
            .spawn(move || match block_on(task) {
                Ok(value) => link.act(move |actor| {
                    if actor.in_state(scope) {
                        then(actor, value)
                    } else {
                        Ok(())
                    }
                }),
                Err(oneshot::Canceled) => link.act(|actor| {
                    actor.body.deliver_exception(ActorError::Canceled);
                    Ok(())
                }),
            });
        if let Err(err) = spawned {
            self.deliver_exception(ActorError::Error(format!(
                "failed to spawn continuation bridge: {err}"
            )));
        }
    }
}

impl<A: Automaton> ActorLink<StatefulActor<A>> {
    /// Enqueues a closure through the error-handling wrapper.
    pub fn act(
        &self,
        work: impl FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.send(move |actor| {
            if let Err(error) = work(actor) {
                actor.body.deliver_exception(error);
            }
        });
    }

    /// Fires a trigger as a follow-up work item.
    pub fn fire(&self, trigger: A::Trigger) {
        self.act(move |actor| {
            actor.fire(trigger);
            Ok(())
        });
    }
}

/// Work-item view of a stateful actor: the state machine plus the body.
pub struct StatefulActor<A: Automaton> {
    machine: StateMachine<A::State, A::Trigger, ActorBody<A>>,
    body: ActorBody<A>,
}

impl<A: Automaton> StatefulActor<A> {
    pub fn state(&self) -> A::State {
        self.machine.current()
    }

    pub fn transitioning(&self) -> bool {
        self.machine.transitioning()
    }

    pub fn in_state(&self, state: A::State) -> bool {
        self.machine.in_state(state)
    }

    pub fn data(&self) -> &A {
        self.body.data()
    }

    pub fn data_mut(&mut self) -> &mut A {
        self.body.data_mut()
    }

    pub fn link(&self) -> &StatefulLink<A> {
        self.body.link()
    }

    pub fn name(&self) -> &str {
        self.body.name()
    }

    /// The lifecycle-scoped plumbing (watchers, timers, cross-actor
    /// watches).
    pub fn body(&mut self) -> &mut ActorBody<A> {
        &mut self.body
    }

    pub fn history(&self) -> Vec<TransitionRecord<A::State, A::Trigger>> {
        self.body.history()
    }

    pub fn deliver_exception(&mut self, error: ActorError) {
        self.body.deliver_exception(error);
    }

    /// Fires a trigger. If a transition is already in progress the fire is
    /// re-enqueued through the mailbox, so triggers never nest; it runs
    /// after the transition and its guard-driven follow-ups complete.
    pub fn fire(&mut self, trigger: A::Trigger) {
        if self.machine.transitioning() {
            self.body.link.fire(trigger);
        } else {
            self.machine.fire(trigger, &mut self.body);
        }
    }

    /// Re-evaluates condition-driven transitions until none applies.
    pub fn update(&mut self) {
        self.machine.update(&mut self.body);
    }

    pub fn watch_state(
        &mut self,
        state: A::State,
        callback: impl FnOnce(&mut ActorBody<A>) + Send + 'static,
    ) {
        self.body.watch_state(state, callback);
    }

    fn dispatch<R: Default>(
        &mut self,
        method: &'static str,
        handler: impl FnOnce(&mut Self) -> Result<R, ActorError>,
    ) -> Result<R, ActorError> {
        let command = self.body.commands.get(method).cloned();
        if let Some(command) = command {
            if let Some(valid) = &command.valid_in {
                if !valid.iter().any(|state| self.in_state(*state)) {
                    return Err(ActorError::InvalidCommand {
                        method,
                        state: format!("{:?}", self.state()),
                    });
                }
            }
            if let Some(trigger) = command.trigger {
                // Enqueued rather than fired inline so calls already queued
                // behind this one keep their order.
                self.body.link.fire(trigger);
                return Ok(R::default());
            }
        }
        handler(self)
    }
}

/// Owning facade of a stateful actor.
pub struct StatefulHandle<A: Automaton> {
    mailbox: Mailbox<StatefulActor<A>>,
    mirror: Arc<StateMirror<A::State>>,
    errors: ObserverList<ActorError>,
    changes: ObserverList<StateChanged<A::State, A::Trigger>>,
    id: Uuid,
    name: Arc<str>,
}

impl<A: Automaton> Clone for StatefulHandle<A> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            mirror: Arc::clone(&self.mirror),
            errors: self.errors.clone(),
            changes: self.changes.clone(),
            id: self.id,
            name: Arc::clone(&self.name),
        }
    }
}

impl<A: Automaton> std::fmt::Debug for StatefulHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<A: Automaton> ActorIdentity for StatefulHandle<A> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<A: Automaton> StatefulHandle<A> {
    /// Builds the machine and command table from the behavior and starts
    /// the actor in the chart's initial state. Fails on an invalid chart.
    pub fn spawn(data: A, options: ActorOptions) -> Result<Self, ActorError> {
        let name: Arc<str> = options.name.clone().into();
        let errors = ObserverList::new();
        let changes = ObserverList::new();
        let mut machine = data.states().build()?;
        let commands: Arc<HashMap<&'static str, Command<A::State, A::Trigger>>> = Arc::new(
            data.commands()
                .into_iter()
                .map(|command| (command.method, command))
                .collect(),
        );
        let mirror = machine.mirror();

        machine.set_error_sink(|body: &mut ActorBody<A>, error| {
            let consumed = {
                let ActorBody { data, link, .. } = body;
                data.state_error(link, &error)
            };
            if !consumed {
                body.deliver_exception(error);
            }
        });
        machine.set_unhandled_sink(|body: &mut ActorBody<A>, trigger| {
            let ActorBody { data, link, .. } = body;
            data.on_unhandled_trigger(link, trigger);
        });
        let change_list = changes.clone();
        machine.observe(move |body: &mut ActorBody<A>, change| {
            body.note_transition(change);
            body.flush_watchers(change);
            {
                let ActorBody { data, link, .. } = body;
                data.on_state_changed(link, change);
            }
            change_list.notify(change);
        });

        let errors_cell = errors.clone();
        let mirror_cell = Arc::clone(&mirror);
        let commands_cell = Arc::clone(&commands);
        let name_cell = Arc::clone(&name);
        let mailbox = Mailbox::new_cyclic(options, move |weak| StatefulActor {
            machine,
            body: ActorBody {
                data,
                link: ActorLink::new(weak, Arc::clone(&name_cell)),
                mirror: mirror_cell,
                commands: commands_cell,
                watchers: Vec::new(),
                history: VecDeque::new(),
                errors: errors_cell,
                name: name_cell,
            },
        });
        let id = Uuid::new_v4();
        info!(actor = %name, %id, initial = ?mirror.current(), "spawned stateful actor");
        Ok(Self {
            mailbox,
            mirror,
            errors,
            changes,
            id,
            name,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, readable from any thread.
    pub fn state(&self) -> A::State {
        self.mirror.current()
    }

    /// Whether `state` is the current state or one of its ancestors.
    pub fn in_state(&self, state: A::State) -> bool {
        self.mirror.in_state(state)
    }

    pub fn transitioning(&self) -> bool {
        self.mirror.transitioning()
    }

    /// Blocks until `state` becomes active or the timeout elapses.
    pub fn wait_for_state(&self, state: A::State, timeout: Duration) -> bool {
        self.mirror.wait_for(state, timeout)
    }

    /// Queues a trigger fire.
    pub fn fire(&self, trigger: A::Trigger) {
        self.mailbox.enqueue(move |actor| actor.fire(trigger));
    }

    /// Enqueues a closure through the error-handling wrapper.
    pub fn act(
        &self,
        work: impl FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.mailbox.enqueue(move |actor| {
            if let Err(error) = work(actor) {
                actor.body.deliver_exception(error);
            }
        });
    }

    /// Runs `work` as one uninterrupted work item.
    pub fn atomically(
        &self,
        work: impl FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.act(work);
    }

    /// Void dispatch through the command table: fire-and-forget. A command
    /// rejected in the current state surfaces only through the error
    /// observers and hooks.
    pub fn post(
        &self,
        method: &'static str,
        work: impl FnOnce(&mut StatefulActor<A>) -> Result<(), ActorError> + Send + 'static,
    ) {
        self.mailbox.enqueue(move |actor| {
            let _span = debug_span!("invoke", actor = %actor.body.name, method).entered();
            if let Err(error) = actor.dispatch(method, work) {
                actor.body.deliver_exception(error);
            }
        });
    }

    /// Value dispatch through the command table: blocks for the handler's
    /// result. A rejected command returns the invalid-command error; a
    /// trigger-translated command queues the fire and returns the value
    /// type's default.
    pub fn call<R: Send + Default + 'static>(
        &self,
        method: &'static str,
        work: impl FnOnce(&mut StatefulActor<A>) -> Result<R, ActorError> + Send + 'static,
    ) -> Result<R, ActorError> {
        let outcome = self.mailbox.execute(move |actor| {
            let _span = debug_span!("invoke", actor = %actor.body.name, method).entered();
            match actor.dispatch(method, work) {
                Ok(value) => Ok(value),
                Err(error) => {
                    actor.body.deliver_exception(error.clone());
                    Err(error)
                }
            }
        });
        match outcome {
            Ok(result) => result,
            Err(queue_error) => Err(ActorError::Mailbox(queue_error)),
        }
    }

    /// Arms a one-shot callback on the actor's worker that fires when the
    /// actor leaves `state` (immediately if it is already outside it).
    pub fn watch_state(
        &self,
        state: A::State,
        callback: impl FnOnce(&mut ActorBody<A>) + Send + 'static,
    ) {
        self.act(move |actor| {
            actor.watch_state(state, callback);
            Ok(())
        });
    }

    /// Observes every completed transition. Callbacks run on the actor's
    /// worker and must bounce to their own actor before touching state.
    #[must_use = "dropping the subscription immediately unsubscribes"]
    pub fn observe_state(
        &self,
        callback: impl Fn(&StateChanged<A::State, A::Trigger>) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(callback)
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
