//! Hierarchical state machine.
//!
//! States form a forest: each state may name a parent, and the machine's
//! cursor always sits on exactly one node (resting on an internal node is
//! legal and means no substate is active). Transitions are either
//! trigger-driven (taken by [`StateMachine::fire`], matched up the parent
//! chain) or condition-driven (taken by [`StateMachine::update`], guards
//! re-evaluated to a fixpoint). Enter and exit hooks run across the
//! least-common-ancestor boundary in the usual order: exits leaf to root,
//! then the transition's setup, then the cursor moves, then enters root to
//! leaf, then the state-changed observers.
//!
//! The machine is context-generic: every callback receives `&mut C`, the
//! host-owned context. Inside the actor runtime `C` is the actor body; in
//! tests it can be any scratch struct.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::errors::ActorError;

/// Identifies one node of the state hierarchy. Blanket-implemented for any
/// copyable, hashable id type (typically a fieldless enum).
pub trait StateKey: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<S> StateKey for S where S: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Names an event that may cause transitions.
pub trait TriggerKey: Copy + Eq + fmt::Debug + Send + Sync + 'static {}

impl<T> TriggerKey for T where T: Copy + Eq + fmt::Debug + Send + Sync + 'static {}

pub type GuardFn<C> = Arc<dyn Fn(&C) -> Result<bool, ActorError> + Send + Sync>;
pub type SetupFn<S, C> = Arc<dyn Fn(&mut C, S) -> Result<(), ActorError> + Send + Sync>;
pub type HookFn<S, T, C> =
    Arc<dyn Fn(&mut C, S, &Transition<S, T, C>) -> Result<(), ActorError> + Send + Sync>;

type ErrorSink<C> = Arc<dyn Fn(&mut C, ActorError) + Send + Sync>;
type UnhandledSink<T, C> = Arc<dyn Fn(&mut C, T) + Send + Sync>;
type ChangeObserver<S, T, C> = Arc<dyn Fn(&mut C, &StateChanged<S, T>) + Send + Sync>;

/// One outbound edge of a state.
///
/// A transition is trigger-driven when it has no guard and condition-driven
/// when it has one; `fire` only matches the former and `update` only scans
/// the latter.
pub struct Transition<S, T, C> {
    trigger: Option<T>,
    target: S,
    guard: Option<GuardFn<C>>,
    setup: Option<SetupFn<S, C>>,
}

impl<S, T, C> Clone for Transition<S, T, C>
where
    S: Copy,
    T: Copy,
{
    fn clone(&self) -> Self {
        Self {
            trigger: self.trigger,
            target: self.target,
            guard: self.guard.clone(),
            setup: self.setup.clone(),
        }
    }
}

impl<S: StateKey, T: TriggerKey, C> Transition<S, T, C> {
    /// Trigger-driven edge: taken when `fire(trigger)` reaches the owning
    /// state or one of its descendants.
    pub fn on(trigger: T, target: S) -> Self {
        Self {
            trigger: Some(trigger),
            target,
            guard: None,
            setup: None,
        }
    }

    /// Condition-driven edge: taken during `update` when the guard holds.
    /// Guards must be side-effect free.
    pub fn when(target: S, guard: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        Self::try_when(target, move |context| Ok(guard(context)))
    }

    /// Condition-driven edge with a fallible guard; a guard error is routed
    /// to the error sink and reads as `false`.
    pub fn try_when(
        target: S,
        guard: impl Fn(&C) -> Result<bool, ActorError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            trigger: None,
            target,
            guard: Some(Arc::new(guard)),
            setup: None,
        }
    }

    /// Callback invoked after the exit hooks and before the cursor moves,
    /// typically to prepare state specific to the target.
    pub fn setup(self, setup: impl Fn(&mut C, S) + Send + Sync + 'static) -> Self {
        self.try_setup(move |context, target| {
            setup(context, target);
            Ok(())
        })
    }

    pub fn try_setup(
        mut self,
        setup: impl Fn(&mut C, S) -> Result<(), ActorError> + Send + Sync + 'static,
    ) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub fn target(&self) -> S {
        self.target
    }

    pub fn trigger(&self) -> Option<T> {
        self.trigger
    }

    /// Whether this edge is condition-driven.
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

/// Static description of one state: its place in the hierarchy, its
/// outbound transitions in declaration order, and its lifecycle hooks.
pub struct StateInfo<S, T, C> {
    id: S,
    parent: Option<S>,
    transitions: Vec<Transition<S, T, C>>,
    enter: Option<HookFn<S, T, C>>,
    exit: Option<HookFn<S, T, C>>,
}

impl<S: StateKey, T: TriggerKey, C> StateInfo<S, T, C> {
    pub fn new(id: S) -> Self {
        Self {
            id,
            parent: None,
            transitions: Vec::new(),
            enter: None,
            exit: None,
        }
    }

    pub fn parent(mut self, parent: S) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn transition(mut self, transition: Transition<S, T, C>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn enter(self, hook: impl Fn(&mut C, S, &Transition<S, T, C>) + Send + Sync + 'static) -> Self {
        self.try_enter(move |context, old, transition| {
            hook(context, old, transition);
            Ok(())
        })
    }

    pub fn try_enter(
        mut self,
        hook: impl Fn(&mut C, S, &Transition<S, T, C>) -> Result<(), ActorError> + Send + Sync + 'static,
    ) -> Self {
        self.enter = Some(Arc::new(hook));
        self
    }

    pub fn exit(self, hook: impl Fn(&mut C, S, &Transition<S, T, C>) + Send + Sync + 'static) -> Self {
        self.try_exit(move |context, old, transition| {
            hook(context, old, transition);
            Ok(())
        })
    }

    pub fn try_exit(
        mut self,
        hook: impl Fn(&mut C, S, &Transition<S, T, C>) -> Result<(), ActorError> + Send + Sync + 'static,
    ) -> Self {
        self.exit = Some(Arc::new(hook));
        self
    }
}

/// Event delivered to state-changed observers.
#[derive(Clone, Debug)]
pub struct StateChanged<S, T> {
    pub old: S,
    pub new: S,
    /// Trigger carried by the transition, if trigger-driven.
    pub trigger: Option<T>,
    /// The new state and its transitive ancestors, leaf first.
    pub lineage: Vec<S>,
}

impl<S: StateKey, T> StateChanged<S, T> {
    /// Whether `state` is still active (the new state or one of its
    /// ancestors) after this change.
    pub fn still_in(&self, state: S) -> bool {
        self.lineage.contains(&state)
    }
}

#[derive(Clone)]
struct MirrorSnapshot<S> {
    current: S,
    lineage: Vec<S>,
    transitioning: bool,
}

/// Thread-safe view of the machine's cursor, published at every cursor
/// assignment. Lets non-worker threads read the state and block in
/// [`StateMirror::wait_for`] without touching the machine itself.
pub struct StateMirror<S: StateKey> {
    snapshot: Mutex<MirrorSnapshot<S>>,
    changed: Condvar,
}

impl<S: StateKey> StateMirror<S> {
    fn new(current: S, lineage: Vec<S>) -> Self {
        Self {
            snapshot: Mutex::new(MirrorSnapshot {
                current,
                lineage,
                transitioning: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn current(&self) -> S {
        self.snapshot.lock().current
    }

    /// Whether `state` is the current state or one of its ancestors.
    pub fn in_state(&self, state: S) -> bool {
        self.snapshot.lock().lineage.contains(&state)
    }

    pub fn transitioning(&self) -> bool {
        self.snapshot.lock().transitioning
    }

    /// Blocks until `state` becomes active or the timeout elapses. Returns
    /// whether the state is active on return.
    pub fn wait_for(&self, state: S, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut snapshot = self.snapshot.lock();
        loop {
            if snapshot.lineage.contains(&state) {
                return true;
            }
            if self.changed.wait_until(&mut snapshot, deadline).timed_out() {
                return snapshot.lineage.contains(&state);
            }
        }
    }

    fn set_cursor(&self, current: S, lineage: Vec<S>) {
        let mut snapshot = self.snapshot.lock();
        snapshot.current = current;
        snapshot.lineage = lineage;
        self.changed.notify_all();
    }

    fn set_transitioning(&self, transitioning: bool) {
        self.snapshot.lock().transitioning = transitioning;
    }
}

/// Builder for a [`StateMachine`]. Collects state descriptions, then
/// `build` validates the chart as a whole.
pub struct MachineBuilder<S: StateKey, T: TriggerKey, C> {
    initial: S,
    states: Vec<StateInfo<S, T, C>>,
}

impl<S: StateKey, T: TriggerKey, C> MachineBuilder<S, T, C> {
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            states: Vec::new(),
        }
    }

    pub fn state(mut self, info: StateInfo<S, T, C>) -> Self {
        self.states.push(info);
        self
    }

    /// Validates the chart and produces the machine. Unknown ids, duplicate
    /// states, and cyclic parent chains are configuration errors.
    pub fn build(self) -> Result<StateMachine<S, T, C>, ActorError> {
        let mut states: HashMap<S, StateInfo<S, T, C>> = HashMap::with_capacity(self.states.len());
        for info in self.states {
            let id = info.id;
            if states.insert(id, info).is_some() {
                return Err(ActorError::Configuration(format!(
                    "duplicate state {id:?}"
                )));
            }
        }
        for info in states.values() {
            if let Some(parent) = info.parent {
                if !states.contains_key(&parent) {
                    return Err(ActorError::Configuration(format!(
                        "state {:?} names unknown parent {parent:?}",
                        info.id
                    )));
                }
            }
            for transition in &info.transitions {
                if !states.contains_key(&transition.target) {
                    return Err(ActorError::Configuration(format!(
                        "state {:?} has a transition to unknown state {:?}",
                        info.id, transition.target
                    )));
                }
            }
        }
        if !states.contains_key(&self.initial) {
            return Err(ActorError::Configuration(format!(
                "unknown initial state {:?}",
                self.initial
            )));
        }
        for id in states.keys() {
            let mut seen = Vec::new();
            let mut probe = Some(*id);
            while let Some(state) = probe {
                if seen.contains(&state) {
                    return Err(ActorError::Configuration(format!(
                        "cyclic parent chain through {state:?}"
                    )));
                }
                seen.push(state);
                probe = states.get(&state).and_then(|info| info.parent);
            }
        }
        let lineage = lineage_in(&states, self.initial);
        let mirror = Arc::new(StateMirror::new(self.initial, lineage));
        Ok(StateMachine {
            states,
            current: self.initial,
            transitioning: false,
            mirror,
            error_sink: None,
            unhandled_sink: None,
            observers: Vec::new(),
            next_observer_id: 1,
        })
    }
}

fn lineage_in<S: StateKey, T, C>(states: &HashMap<S, StateInfo<S, T, C>>, from: S) -> Vec<S> {
    let mut lineage = Vec::new();
    let mut probe = Some(from);
    while let Some(state) = probe {
        lineage.push(state);
        probe = states.get(&state).and_then(|info| info.parent);
    }
    lineage
}

/// A running hierarchical state machine: the immutable chart plus the
/// current-state cursor.
pub struct StateMachine<S: StateKey, T: TriggerKey, C> {
    states: HashMap<S, StateInfo<S, T, C>>,
    current: S,
    transitioning: bool,
    mirror: Arc<StateMirror<S>>,
    error_sink: Option<ErrorSink<C>>,
    unhandled_sink: Option<UnhandledSink<T, C>>,
    observers: Vec<(u64, ChangeObserver<S, T, C>)>,
    next_observer_id: u64,
}

impl<S: StateKey, T: TriggerKey, C> fmt::Debug for StateMachine<S, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("transitioning", &self.transitioning)
            .field("states", &self.states.len())
            .finish()
    }
}

impl<S: StateKey, T: TriggerKey, C> StateMachine<S, T, C> {
    pub fn builder(initial: S) -> MachineBuilder<S, T, C> {
        MachineBuilder::new(initial)
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn transitioning(&self) -> bool {
        self.transitioning
    }

    /// The shared cursor view; cheap to clone and safe to read from any
    /// thread.
    pub fn mirror(&self) -> Arc<StateMirror<S>> {
        Arc::clone(&self.mirror)
    }

    /// Whether `state` is the current state or one of its transitive
    /// ancestors.
    pub fn in_state(&self, state: S) -> bool {
        let mut probe = Some(self.current);
        while let Some(candidate) = probe {
            if candidate == state {
                return true;
            }
            probe = self.states.get(&candidate).and_then(|info| info.parent);
        }
        false
    }

    /// Routes callback and configuration failures raised while the machine
    /// is running. Without a sink they are only logged.
    pub fn set_error_sink(&mut self, sink: impl Fn(&mut C, ActorError) + Send + Sync + 'static) {
        self.error_sink = Some(Arc::new(sink));
    }

    /// Invoked when `fire` exhausts the parent chain without a match.
    pub fn set_unhandled_sink(&mut self, sink: impl Fn(&mut C, T) + Send + Sync + 'static) {
        self.unhandled_sink = Some(Arc::new(sink));
    }

    /// Registers a state-changed observer; returns its removal id.
    /// Observers registered while a change is being dispatched do not see
    /// that change.
    pub fn observe(
        &mut self,
        observer: impl Fn(&mut C, &StateChanged<S, T>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&mut self, id: u64) {
        self.observers.retain(|(observer_id, _)| *observer_id != id);
    }

    /// Fires a trigger: walks from the current state up its parent chain and
    /// takes the first unguarded transition declared for `trigger`. The
    /// matched transition leaves from the *current* state, not the ancestor
    /// that declared it. After the transition, guards are re-evaluated to a
    /// fixpoint. Firing while a transition is in progress is an error.
    pub fn fire(&mut self, trigger: T, context: &mut C) {
        if self.transitioning {
            self.report(
                context,
                ActorError::MidTransition(format!("{trigger:?}")),
            );
            return;
        }
        self.begin_transitioning();
        let origin = self.current;
        match self.find_trigger_transition(origin, trigger) {
            Some(transition) => {
                self.execute_transition(origin, &transition, context);
                self.drain_guards(context);
            }
            None => {
                warn!(?trigger, state = ?origin, "unhandled trigger");
                if let Some(sink) = self.unhandled_sink.clone() {
                    sink(context, trigger);
                }
            }
        }
        self.end_transitioning();
    }

    /// Re-evaluates condition-driven transitions at the current state until
    /// none applies. Scans only the current state's own transition list, in
    /// declaration order. No-op while a transition is already in progress.
    pub fn update(&mut self, context: &mut C) {
        if self.transitioning {
            return;
        }
        self.begin_transitioning();
        self.drain_guards(context);
        self.end_transitioning();
    }

    fn begin_transitioning(&mut self) {
        self.transitioning = true;
        self.mirror.set_transitioning(true);
    }

    fn end_transitioning(&mut self) {
        self.transitioning = false;
        self.mirror.set_transitioning(false);
    }

    fn find_trigger_transition(&self, from: S, trigger: T) -> Option<Transition<S, T, C>> {
        let mut probe = Some(from);
        while let Some(state) = probe {
            let info = self.states.get(&state)?;
            if let Some(transition) = info
                .transitions
                .iter()
                .find(|transition| transition.guard.is_none() && transition.trigger == Some(trigger))
            {
                return Some(transition.clone());
            }
            probe = info.parent;
        }
        None
    }

    fn find_guard_transition(&self, from: S, context: &mut C) -> Option<Transition<S, T, C>> {
        let info = self.states.get(&from)?;
        for transition in &info.transitions {
            let Some(guard) = transition.guard.clone() else {
                continue;
            };
            match guard(context) {
                Ok(true) => return Some(transition.clone()),
                Ok(false) => {}
                Err(error) => self.report(context, error),
            }
        }
        None
    }

    fn drain_guards(&mut self, context: &mut C) {
        loop {
            let origin = self.current;
            let Some(transition) = self.find_guard_transition(origin, context) else {
                break;
            };
            self.execute_transition(origin, &transition, context);
        }
    }

    fn execute_transition(&mut self, old: S, transition: &Transition<S, T, C>, context: &mut C) {
        let new = transition.target;
        let old_path = self.lineage_of(old);
        let new_path = self.lineage_of(new);
        // First ancestor of the target that also lies on the old chain.
        // Everything below it on either side is exited or entered; with no
        // common ancestor both chains unwind completely.
        let lca = new_path
            .iter()
            .find(|state| old_path.contains(state))
            .copied();
        debug!(from = ?old, to = ?new, trigger = ?transition.trigger, "transition");
        for state in &old_path {
            if Some(*state) == lca {
                break;
            }
            if let Some(hook) = self.states.get(state).and_then(|info| info.exit.clone()) {
                if let Err(error) = hook(context, old, transition) {
                    self.report(context, error);
                }
            }
        }
        if let Some(setup) = transition.setup.clone() {
            if let Err(error) = setup(context, new) {
                self.report(context, error);
            }
        }
        self.set_cursor(new);
        let entered: Vec<S> = new_path
            .iter()
            .take_while(|state| Some(**state) != lca)
            .copied()
            .collect();
        for state in entered.iter().rev() {
            if let Some(hook) = self.states.get(state).and_then(|info| info.enter.clone()) {
                if let Err(error) = hook(context, old, transition) {
                    self.report(context, error);
                }
            }
        }
        let change = StateChanged {
            old,
            new,
            trigger: transition.trigger,
            lineage: self.lineage_of(new),
        };
        let observers: Vec<ChangeObserver<S, T, C>> = self
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(context, &change);
        }
    }

    fn set_cursor(&mut self, state: S) {
        self.current = state;
        let lineage = self.lineage_of(state);
        self.mirror.set_cursor(state, lineage);
    }

    fn lineage_of(&self, from: S) -> Vec<S> {
        lineage_in(&self.states, from)
    }

    fn report(&self, context: &mut C, error: ActorError) {
        match self.error_sink.clone() {
            Some(sink) => sink(context, error),
            None => warn!(%error, "state machine error with no sink attached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Cell {
        A,
        Aa,
        Ab,
        B,
        Ba,
        C,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Go {
        AaToAb,
        AbToBa,
        X,
        Loop,
    }

    #[derive(Default)]
    struct Rig {
        log: Vec<String>,
        advance: bool,
        errors: Vec<ActorError>,
        unhandled: Vec<Go>,
    }

    fn log_hook(label: &'static str) -> impl Fn(&mut Rig, Cell, &Transition<Cell, Go, Rig>) {
        move |rig, _old, _transition| rig.log.push(label.to_string())
    }

    /// The S1 hierarchy: A { AA, AB }, B { BA }.
    fn hierarchy() -> StateMachine<Cell, Go, Rig> {
        MachineBuilder::new(Cell::Aa)
            .state(StateInfo::new(Cell::A).exit(log_hook("exit A")).enter(log_hook("enter A")))
            .state(
                StateInfo::new(Cell::Aa)
                    .parent(Cell::A)
                    .transition(
                        Transition::on(Go::AaToAb, Cell::Ab)
                            .setup(|rig: &mut Rig, _target| rig.log.push("setup".to_string())),
                    )
                    .exit(log_hook("exit AA"))
                    .enter(log_hook("enter AA")),
            )
            .state(
                StateInfo::new(Cell::Ab)
                    .parent(Cell::A)
                    .transition(
                        Transition::on(Go::AbToBa, Cell::Ba)
                            .setup(|rig: &mut Rig, _target| rig.log.push("setup".to_string())),
                    )
                    .exit(log_hook("exit AB"))
                    .enter(log_hook("enter AB")),
            )
            .state(StateInfo::new(Cell::B).exit(log_hook("exit B")).enter(log_hook("enter B")))
            .state(
                StateInfo::new(Cell::Ba)
                    .parent(Cell::B)
                    .exit(log_hook("exit BA"))
                    .enter(log_hook("enter BA")),
            )
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart")
    }

    #[test]
    fn test_build_rejects_unknown_parent() {
        let err = MachineBuilder::<Cell, Go, Rig>::new(Cell::Aa)
            .state(StateInfo::new(Cell::Aa).parent(Cell::A))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_unknown_target() {
        let err = MachineBuilder::<Cell, Go, Rig>::new(Cell::Aa)
            .state(StateInfo::new(Cell::Aa).transition(Transition::on(Go::X, Cell::C)))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_unknown_initial() {
        let err = MachineBuilder::<Cell, Go, Rig>::new(Cell::C)
            .state(StateInfo::new(Cell::Aa))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_duplicate_state() {
        let err = MachineBuilder::<Cell, Go, Rig>::new(Cell::Aa)
            .state(StateInfo::new(Cell::Aa))
            .state(StateInfo::new(Cell::Aa))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_parent_cycle() {
        let err = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(StateInfo::new(Cell::A).parent(Cell::B))
            .state(StateInfo::new(Cell::B).parent(Cell::A))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));
    }

    #[test]
    fn test_in_state_walks_ancestors() {
        let machine = hierarchy();
        assert_eq!(machine.current(), Cell::Aa);
        assert!(machine.in_state(Cell::Aa));
        assert!(machine.in_state(Cell::A));
        assert!(!machine.in_state(Cell::Ab));
        assert!(!machine.in_state(Cell::B));
    }

    #[test]
    fn test_sibling_transition_hook_order() {
        // S1 first half: AA -> AB inside A. A itself is never exited.
        let mut machine = hierarchy();
        let mut rig = Rig::default();
        machine.observe(|rig: &mut Rig, change| {
            rig.log.push(format!("changed {:?}->{:?}", change.old, change.new));
        });
        machine.fire(Go::AaToAb, &mut rig);
        assert_eq!(machine.current(), Cell::Ab);
        assert_eq!(
            rig.log,
            vec!["exit AA", "setup", "enter AB", "changed Aa->Ab"]
        );
    }

    #[test]
    fn test_cross_hierarchy_transition_hook_order() {
        // S1 second half: AB -> BA crosses from A's subtree into B's.
        let mut machine = hierarchy();
        let mut rig = Rig::default();
        machine.fire(Go::AaToAb, &mut rig);
        rig.log.clear();
        machine.fire(Go::AbToBa, &mut rig);
        assert_eq!(machine.current(), Cell::Ba);
        assert_eq!(
            rig.log,
            vec!["exit AB", "exit A", "setup", "enter B", "enter BA"]
        );
        assert!(machine.in_state(Cell::B));
        assert!(!machine.in_state(Cell::A));
    }

    #[test]
    fn test_trigger_matches_on_ancestor() {
        // S2: AA has no X transition, parent A does; old state is still AA.
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::Aa)
            .state(StateInfo::new(Cell::A).transition(Transition::on(Go::X, Cell::C)))
            .state(StateInfo::new(Cell::Aa).parent(Cell::A))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        machine.observe(|rig: &mut Rig, change| {
            rig.log.push(format!("old {:?}", change.old));
        });
        let mut rig = Rig::default();
        machine.fire(Go::X, &mut rig);
        assert_eq!(machine.current(), Cell::C);
        assert_eq!(rig.log, vec!["old Aa"]);
    }

    #[test]
    fn test_unhandled_trigger_reaches_sink() {
        let mut machine = hierarchy();
        machine.set_unhandled_sink(|rig: &mut Rig, trigger| rig.unhandled.push(trigger));
        let mut rig = Rig::default();
        machine.fire(Go::X, &mut rig);
        assert_eq!(machine.current(), Cell::Aa);
        assert_eq!(rig.unhandled, vec![Go::X]);
        assert!(rig.log.is_empty());
    }

    #[test]
    fn test_update_drains_guards_to_fixpoint() {
        // S3: guard chain A -> B -> C, one state_changed per hop.
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(StateInfo::new(Cell::A).transition(Transition::when(Cell::B, |rig: &Rig| rig.advance)))
            .state(StateInfo::new(Cell::B).transition(Transition::when(Cell::C, |rig: &Rig| rig.advance)))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        machine.observe(|rig: &mut Rig, change| {
            rig.log.push(format!("{:?}->{:?}", change.old, change.new));
        });
        let mut rig = Rig::default();
        machine.update(&mut rig);
        assert_eq!(machine.current(), Cell::A);
        rig.advance = true;
        machine.update(&mut rig);
        assert_eq!(machine.current(), Cell::C);
        assert_eq!(rig.log, vec!["A->B", "B->C"]);
    }

    #[test]
    fn test_guards_are_scanned_in_declaration_order() {
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(
                StateInfo::new(Cell::A)
                    .transition(Transition::when(Cell::B, |_: &Rig| true))
                    .transition(Transition::when(Cell::C, |_: &Rig| true)),
            )
            .state(StateInfo::new(Cell::B))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        let mut rig = Rig::default();
        machine.update(&mut rig);
        assert_eq!(machine.current(), Cell::B);
    }

    #[test]
    fn test_guard_error_reads_as_false() {
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(
                StateInfo::new(Cell::A)
                    .transition(Transition::try_when(Cell::B, |_: &Rig| {
                        Err(ActorError::Error("sensor offline".to_string()))
                    }))
                    .transition(Transition::when(Cell::C, |_: &Rig| true)),
            )
            .state(StateInfo::new(Cell::B))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        machine.set_error_sink(|rig: &mut Rig, error| rig.errors.push(error));
        let mut rig = Rig::default();
        machine.update(&mut rig);
        // The failing guard is skipped; the next applicable one still fires.
        assert_eq!(machine.current(), Cell::C);
        assert_eq!(rig.errors.len(), 1);
        assert!(rig.errors[0].to_string().contains("sensor offline"));
    }

    #[test]
    fn test_hook_error_does_not_abort_transition() {
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(
                StateInfo::new(Cell::A)
                    .transition(Transition::on(Go::X, Cell::B))
                    .try_exit(|_rig, _old, _transition| {
                        Err(ActorError::Fault("exit valve stuck".to_string()))
                    }),
            )
            .state(StateInfo::new(Cell::B).enter(|rig: &mut Rig, _, _| {
                rig.log.push("entered B".to_string())
            }))
            .build()
            .expect("valid chart");
        machine.set_error_sink(|rig: &mut Rig, error| rig.errors.push(error));
        let mut rig = Rig::default();
        machine.fire(Go::X, &mut rig);
        assert_eq!(machine.current(), Cell::B);
        assert_eq!(rig.log, vec!["entered B"]);
        assert_eq!(rig.errors.len(), 1);
        assert!(rig.errors[0].is_fault());
    }

    #[test]
    fn test_trigger_transition_runs_guard_fixpoint_afterwards() {
        // A trigger-driven hop into B auto-chains into C through B's guard.
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(StateInfo::new(Cell::A).transition(Transition::on(Go::X, Cell::B)))
            .state(StateInfo::new(Cell::B).transition(Transition::when(Cell::C, |_: &Rig| true)))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        let mut rig = Rig::default();
        machine.fire(Go::X, &mut rig);
        assert_eq!(machine.current(), Cell::C);
    }

    #[test]
    fn test_self_transition_runs_setup_but_no_hooks() {
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(
                StateInfo::new(Cell::A)
                    .transition(
                        Transition::on(Go::Loop, Cell::A)
                            .setup(|rig: &mut Rig, _| rig.log.push("setup".to_string())),
                    )
                    .enter(log_hook("enter A"))
                    .exit(log_hook("exit A")),
            )
            .build()
            .expect("valid chart");
        machine.observe(|rig: &mut Rig, _| rig.log.push("changed".to_string()));
        let mut rig = Rig::default();
        machine.fire(Go::Loop, &mut rig);
        assert_eq!(machine.current(), Cell::A);
        assert_eq!(rig.log, vec!["setup", "changed"]);
    }

    #[test]
    fn test_fire_prefers_unguarded_transitions_only() {
        // A guarded edge on the same trigger is invisible to `fire`.
        let mut machine = MachineBuilder::<Cell, Go, Rig>::new(Cell::A)
            .state(
                StateInfo::new(Cell::A)
                    .transition(Transition::when(Cell::B, |_: &Rig| false))
                    .transition(Transition::on(Go::X, Cell::C)),
            )
            .state(StateInfo::new(Cell::B))
            .state(StateInfo::new(Cell::C))
            .build()
            .expect("valid chart");
        let mut rig = Rig::default();
        machine.fire(Go::X, &mut rig);
        assert_eq!(machine.current(), Cell::C);
    }

    #[test]
    fn test_mirror_tracks_cursor() {
        let mut machine = hierarchy();
        let mirror = machine.mirror();
        assert_eq!(mirror.current(), Cell::Aa);
        assert!(mirror.in_state(Cell::A));
        let mut rig = Rig::default();
        machine.fire(Go::AaToAb, &mut rig);
        machine.fire(Go::AbToBa, &mut rig);
        assert_eq!(mirror.current(), Cell::Ba);
        assert!(mirror.in_state(Cell::B));
        assert!(!mirror.in_state(Cell::A));
        assert!(!mirror.transitioning());
    }

    #[test]
    fn test_mirror_wait_for_times_out() {
        let machine = hierarchy();
        let mirror = machine.mirror();
        assert!(!mirror.wait_for(Cell::C, Duration::from_millis(30)));
        assert!(mirror.wait_for(Cell::A, Duration::from_millis(30)));
    }

    #[test]
    fn test_observer_removal() {
        let mut machine = hierarchy();
        let id = machine.observe(|rig: &mut Rig, _| rig.log.push("seen".to_string()));
        machine.unobserve(id);
        let mut rig = Rig::default();
        machine.fire(Go::AaToAb, &mut rig);
        assert!(rig.log.iter().all(|entry| entry != "seen"));
    }
}
