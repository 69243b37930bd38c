//! End-to-end tests driving stateful actors through their facades: ordering
//! of lifecycle hooks across hierarchy boundaries, command gating,
//! lifecycle-scoped timers, and cross-actor watches.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use machina_core::{
    ActorBody, ActorError, ActorOptions, ActorRegistry, Automaton, Command, ErrorKind,
    MachineBuilder, MachineLayout, StateInfo, StatefulHandle, StatefulLink, Transition,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConveyorState {
    Idle,
    Auto,
    Feeding,
    Draining,
    Manual,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConveyorTrigger {
    Start,
    Drain,
    Switch,
    Halt,
}

#[derive(Default)]
struct Conveyor {
    log: Vec<String>,
    ticks: u64,
    items: u64,
}

impl Conveyor {
    fn mark(&mut self, entry: &str) {
        self.log.push(entry.to_string());
    }
}

impl Automaton for Conveyor {
    type State = ConveyorState;
    type Trigger = ConveyorTrigger;

    fn states(&self) -> MachineLayout<Self> {
        MachineBuilder::new(ConveyorState::Idle)
            .state(
                StateInfo::new(ConveyorState::Idle)
                    .transition(Transition::on(ConveyorTrigger::Start, ConveyorState::Feeding)),
            )
            .state(
                StateInfo::new(ConveyorState::Auto)
                    .enter(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("+auto"))
                    .exit(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("-auto"))
                    .transition(Transition::on(ConveyorTrigger::Halt, ConveyorState::Halted)),
            )
            .state(
                StateInfo::new(ConveyorState::Feeding)
                    .parent(ConveyorState::Auto)
                    .enter(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("+feeding"))
                    .exit(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("-feeding"))
                    .transition(Transition::on(ConveyorTrigger::Drain, ConveyorState::Draining)),
            )
            .state(
                StateInfo::new(ConveyorState::Draining)
                    .parent(ConveyorState::Auto)
                    .enter(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("+draining"))
                    .exit(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("-draining"))
                    .transition(Transition::on(ConveyorTrigger::Switch, ConveyorState::Manual)),
            )
            .state(
                StateInfo::new(ConveyorState::Manual)
                    .enter(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("+manual")),
            )
            .state(
                StateInfo::new(ConveyorState::Halted)
                    .enter(|body: &mut ActorBody<Conveyor>, _, _| body.data_mut().mark("+halted")),
            )
    }

    fn commands(&self) -> Vec<Command<ConveyorState, ConveyorTrigger>> {
        vec![
            Command::new("start")
                .valid_in([ConveyorState::Idle])
                .fires(ConveyorTrigger::Start),
            // Valid anywhere inside the Auto subtree.
            Command::new("advance").valid_in([ConveyorState::Auto]),
        ]
    }
}

fn spawn_conveyor(name: &str) -> StatefulHandle<Conveyor> {
    StatefulHandle::spawn(
        Conveyor::default(),
        ActorOptions::named(name).with_idle_timeout(Duration::from_millis(200)),
    )
    .expect("valid conveyor chart")
}

#[test]
fn test_hook_order_across_hierarchy_boundaries() {
    let conveyor = spawn_conveyor("order");
    conveyor.fire(ConveyorTrigger::Start);
    conveyor.fire(ConveyorTrigger::Drain);
    conveyor.fire(ConveyorTrigger::Switch);
    conveyor.wait().expect("drain");
    assert_eq!(conveyor.state(), ConveyorState::Manual);
    let log = conveyor
        .call("log", |actor| Ok(actor.data().log.clone()))
        .expect("call");
    assert_eq!(
        log,
        vec![
            // Idle -> Feeding: no common ancestor, the Auto chain is entered
            // outside-in.
            "+auto", "+feeding",
            // Feeding -> Draining: siblings under Auto; Auto stays entered.
            "-feeding", "+draining",
            // Draining -> Manual: unwinds the Auto chain inside-out.
            "-draining", "-auto", "+manual",
        ]
    );
}

#[test]
fn test_trigger_handled_by_ancestor_state() {
    let conveyor = spawn_conveyor("ancestor");
    conveyor.fire(ConveyorTrigger::Start);
    // Feeding has no Halt edge; Auto, its parent, does.
    conveyor.fire(ConveyorTrigger::Halt);
    assert!(conveyor.wait_for_state(ConveyorState::Halted, Duration::from_secs(1)));
    let log = conveyor
        .call("log", |actor| Ok(actor.data().log.clone()))
        .expect("call");
    assert_eq!(
        log,
        vec!["+auto", "+feeding", "-feeding", "-auto", "+halted"]
    );
}

#[test]
fn test_command_validity_is_hierarchical() {
    let conveyor = spawn_conveyor("gate");
    // "advance" is declared valid in Auto; Idle is outside that subtree.
    let rejected = conveyor.call("advance", |actor| {
        actor.data_mut().items += 1;
        Ok(actor.data().items)
    });
    assert!(matches!(
        rejected,
        Err(ActorError::InvalidCommand { method: "advance", .. })
    ));
    conveyor.post("start", |_| Ok(()));
    assert!(conveyor.wait_for_state(ConveyorState::Feeding, Duration::from_secs(1)));
    // Feeding is inside Auto, so the command now passes the gate.
    let items = conveyor
        .call("advance", |actor| {
            actor.data_mut().items += 1;
            Ok(actor.data().items)
        })
        .expect("valid inside Auto");
    assert_eq!(items, 1);
}

#[test]
fn test_posted_calls_from_many_threads_all_apply() {
    let conveyor = spawn_conveyor("load");
    conveyor.fire(ConveyorTrigger::Start);
    conveyor.wait().expect("drain");
    let mut producers = Vec::new();
    for _ in 0..4 {
        let conveyor = conveyor.clone();
        producers.push(thread::spawn(move || {
            for _ in 0..50 {
                conveyor.post("advance", |actor| {
                    actor.data_mut().items += 1;
                    Ok(())
                });
            }
        }));
    }
    for producer in producers {
        producer.join().expect("producer");
    }
    conveyor.wait().expect("drain");
    let items = conveyor
        .call("advance", |actor| Ok(actor.data().items))
        .expect("call");
    assert_eq!(items, 200);
}

#[test]
fn test_repeat_timer_never_ticks_after_leaving_scope() {
    let conveyor = spawn_conveyor("timer");
    conveyor.fire(ConveyorTrigger::Start);
    conveyor.act(|actor| {
        actor.body().repeat_while_in_state(
            Duration::from_millis(10),
            None,
            |actor, elapsed| {
                assert!(elapsed > Duration::ZERO);
                actor.data_mut().ticks += 1;
                Ok(())
            },
        );
        Ok(())
    });
    thread::sleep(Duration::from_millis(100));
    conveyor.fire(ConveyorTrigger::Drain);
    conveyor.wait().expect("drain");
    let ticks_at_exit = conveyor
        .call("ticks", |actor| Ok(actor.data().ticks))
        .expect("call");
    assert!(ticks_at_exit >= 1, "timer never ticked");
    thread::sleep(Duration::from_millis(150));
    conveyor.wait().expect("drain");
    let ticks_later = conveyor
        .call("ticks", |actor| Ok(actor.data().ticks))
        .expect("call");
    assert_eq!(ticks_later, ticks_at_exit, "tick arrived after state exit");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GateState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateTrigger {
    OpenCmd,
}

#[derive(Default)]
struct Gate;

impl Automaton for Gate {
    type State = GateState;
    type Trigger = GateTrigger;

    fn states(&self) -> MachineLayout<Self> {
        MachineBuilder::new(GateState::Closed)
            .state(
                StateInfo::new(GateState::Closed)
                    .transition(Transition::on(GateTrigger::OpenCmd, GateState::Open)),
            )
            .state(StateInfo::new(GateState::Open))
    }
}

#[test]
fn test_watch_other_reacts_to_state_changes() {
    let conveyor = spawn_conveyor("watched");
    let gate = StatefulHandle::spawn(
        Gate,
        ActorOptions::named("gate").with_idle_timeout(Duration::from_millis(200)),
    )
    .expect("valid gate chart");
    let conveyor_for_watch = conveyor.clone();
    gate.act(move |actor| {
        actor.body().watch_other_while_in_state(
            &conveyor_for_watch,
            |state, _change| state == ConveyorState::Feeding,
            |actor| {
                actor.fire(GateTrigger::OpenCmd);
                Ok(())
            },
            GateState::Closed,
        );
        Ok(())
    });
    gate.wait().expect("drain");
    assert_eq!(gate.state(), GateState::Closed);
    conveyor.fire(ConveyorTrigger::Start);
    assert!(gate.wait_for_state(GateState::Open, Duration::from_secs(1)));
}

#[test]
fn test_watch_other_evaluates_condition_immediately() {
    let conveyor = spawn_conveyor("already-running");
    conveyor.fire(ConveyorTrigger::Start);
    conveyor.wait().expect("drain");
    let gate = StatefulHandle::spawn(
        Gate,
        ActorOptions::named("late-gate").with_idle_timeout(Duration::from_millis(200)),
    )
    .expect("valid gate chart");
    let conveyor_for_watch = conveyor.clone();
    gate.act(move |actor| {
        actor.body().watch_other_while_in_state(
            &conveyor_for_watch,
            |state, _change| state == ConveyorState::Feeding,
            |actor| {
                actor.fire(GateTrigger::OpenCmd);
                Ok(())
            },
            GateState::Closed,
        );
        Ok(())
    });
    // No further conveyor activity: the immediate evaluation alone must
    // open the gate.
    assert!(gate.wait_for_state(GateState::Open, Duration::from_secs(1)));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SupervisorState {
    Watching,
    Alarmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorTrigger {
    Alarm,
}

#[derive(Default)]
struct Supervisor {
    watched_faults: usize,
}

impl Automaton for Supervisor {
    type State = SupervisorState;
    type Trigger = SupervisorTrigger;

    fn states(&self) -> MachineLayout<Self> {
        MachineBuilder::new(SupervisorState::Watching)
            .state(
                StateInfo::new(SupervisorState::Watching)
                    .transition(Transition::on(SupervisorTrigger::Alarm, SupervisorState::Alarmed)),
            )
            .state(StateInfo::new(SupervisorState::Alarmed))
    }

    fn on_fault(&mut self, link: &StatefulLink<Self>, error: &ActorError) {
        if error.kind() == ErrorKind::WatchedState {
            self.watched_faults += 1;
            link.fire(SupervisorTrigger::Alarm);
        }
    }
}

#[test]
fn test_watched_error_state_raises_fault() {
    let conveyor = spawn_conveyor("faulty");
    let supervisor = StatefulHandle::spawn(
        Supervisor::default(),
        ActorOptions::named("supervisor").with_idle_timeout(Duration::from_millis(200)),
    )
    .expect("valid supervisor chart");
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let errors_cb = Arc::clone(&errors);
    let _sub = supervisor.observe_errors(move |error| {
        errors_cb.lock().push(error.to_string());
    });
    let conveyor_for_watch = conveyor.clone();
    supervisor.act(move |actor| {
        actor
            .body()
            .watch_other_and_update_or_fault(&conveyor_for_watch, ConveyorState::Halted);
        Ok(())
    });
    supervisor.wait().expect("drain");
    conveyor.fire(ConveyorTrigger::Start);
    conveyor.fire(ConveyorTrigger::Halt);
    assert!(supervisor.wait_for_state(SupervisorState::Alarmed, Duration::from_secs(1)));
    let watched_faults = supervisor
        .call("watched_faults", |actor| Ok(actor.data().watched_faults))
        .expect("call");
    assert_eq!(watched_faults, 1);
    let seen = errors.lock();
    assert!(seen.iter().any(|message| message.contains("faulty")));
}

#[test]
fn test_wait_for_state_blocks_until_transition() {
    let conveyor = spawn_conveyor("waiter");
    let for_firing = conveyor.clone();
    let firing = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        for_firing.fire(ConveyorTrigger::Start);
    });
    assert!(conveyor.wait_for_state(ConveyorState::Auto, Duration::from_secs(2)));
    firing.join().expect("firing thread");
    assert!(!conveyor.wait_for_state(ConveyorState::Halted, Duration::from_millis(50)));
}

#[test]
fn test_registry_round_trip() {
    let registry = ActorRegistry::new();
    let conveyor = spawn_conveyor("registered");
    registry.register(conveyor.clone());
    let found: StatefulHandle<Conveyor> = registry.get("registered").expect("registered");
    found.fire(ConveyorTrigger::Start);
    assert!(conveyor.wait_for_state(ConveyorState::Feeding, Duration::from_secs(1)));
    assert_eq!(registry.names(), vec!["registered".to_string()]);
}
