//! Drives one conveyor segment through its lifecycle: spawn, start it via a
//! gated command, let its state-scoped timer move items, then drain it and
//! dump the transition history.
//!
//! Run with `RUST_LOG=debug cargo run --example conveyor` to watch the
//! runtime's tracing output.

use std::time::Duration;

use anyhow::Result;
use machina_core::{
    ActorOptions, Automaton, Command, MachineBuilder, MachineLayout, StateInfo, StatefulHandle,
    StatefulLink, Transition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SegmentState {
    Idle,
    Running,
    Draining,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentTrigger {
    Start,
    Drain,
    Errored,
}

#[derive(Default)]
struct Segment {
    moved: u64,
}

impl Automaton for Segment {
    type State = SegmentState;
    type Trigger = SegmentTrigger;

    fn states(&self) -> MachineLayout<Self> {
        MachineBuilder::new(SegmentState::Idle)
            .state(
                StateInfo::new(SegmentState::Idle)
                    .transition(Transition::on(SegmentTrigger::Start, SegmentState::Running)),
            )
            .state(
                StateInfo::new(SegmentState::Running)
                    .enter(|body, _, _| {
                        // Move one item every 10ms for as long as we stay
                        // in Running.
                        body.repeat_while_in_state(Duration::from_millis(10), None, |actor, _| {
                            actor.data_mut().moved += 1;
                            Ok(())
                        });
                    })
                    .transition(Transition::on(SegmentTrigger::Drain, SegmentState::Draining))
                    .transition(Transition::on(SegmentTrigger::Errored, SegmentState::Faulted)),
            )
            .state(StateInfo::new(SegmentState::Draining))
            .state(StateInfo::new(SegmentState::Faulted))
    }

    fn commands(&self) -> Vec<Command<SegmentState, SegmentTrigger>> {
        vec![
            Command::new("start")
                .valid_in([SegmentState::Idle])
                .fires(SegmentTrigger::Start),
            Command::new("throughput").valid_in([SegmentState::Running]),
        ]
    }

    fn on_fault(&mut self, link: &StatefulLink<Self>, _error: &machina_core::ActorError) {
        link.fire(SegmentTrigger::Errored);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let segment = StatefulHandle::spawn(Segment::default(), ActorOptions::named("segment-1"))?;
    println!("segment starts in {:?}", segment.state());

    segment.post("start", |_| Ok(()));
    segment.wait_for_state(SegmentState::Running, Duration::from_secs(1));
    println!("segment is {:?}", segment.state());

    std::thread::sleep(Duration::from_millis(120));
    let moved = segment.call("throughput", |actor| Ok(actor.data().moved))?;
    println!("moved {moved} items while running");

    segment.fire(SegmentTrigger::Drain);
    segment.wait_for_state(SegmentState::Draining, Duration::from_secs(1));
    println!("segment drained; transition history:");
    let history = segment.call("history", |actor| Ok(actor.history()))?;
    for record in history {
        println!(
            "  {} {:?} -> {:?} (trigger {:?})",
            record.at.format("%H:%M:%S%.3f"),
            record.from,
            record.to,
            record.trigger
        );
    }
    Ok(())
}
