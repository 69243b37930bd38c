// Machina: actor and hierarchical state machine runtime for machine
// automation and robotics control planes. Every component is a serialized
// island of state behind a message facade; stateful actors progress through
// a hierarchical state chart that also gates which commands they accept.

pub mod actor;
pub mod errors;
pub mod mailbox;
pub mod observers;
pub mod options;
pub mod registry;
pub mod state_machine;
pub mod stateful;
mod timer;

// Re-export commonly used types
pub use errors::{ActorError, ActorResult, ErrorKind};

pub use mailbox::{Mailbox, MailboxError, WeakMailbox, WorkItem};

pub use observers::{ObserverList, Subscription};

pub use options::ActorOptions;

pub use state_machine::{
    MachineBuilder, StateChanged, StateInfo, StateKey, StateMachine, StateMirror, Transition,
    TriggerKey,
};

pub use actor::{Actor, ActorHandle, ActorIdentity, ActorLink, Behavior};

pub use stateful::{
    ActorBody, Automaton, Command, MachineLayout, StatefulActor, StatefulHandle, StatefulLink,
    TransitionRecord,
};

pub use registry::{ActorRegistry, RegisteredActor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
