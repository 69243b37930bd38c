/// Error types for the machina actor runtime.
use thiserror::Error;

use crate::mailbox::MailboxError;

/// Classification of an [`ActorError`], used when routing a failure to the
/// behavior hooks and when hosts match on error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Any unexpected failure.
    Generic,
    /// Domain-level failure the actor is expected to recover from via a
    /// state transition.
    Fault,
    /// An elapsed deadline. Treated as a fault by default.
    Timeout,
    /// A watched actor entered a state declared as an error condition.
    WatchedState,
    /// A facade call arrived that the command table rejects in the current
    /// state.
    InvalidCommand,
    /// The state chart refers to an unknown or inconsistent state id.
    Configuration,
    /// A trigger was fired while a transition was already in progress.
    MidTransition,
    /// An asynchronous task was canceled before it produced a result.
    Canceled,
    /// The underlying work queue refused or discarded the call.
    Mailbox,
}

/// Core error type for actor operations.
#[derive(Error, Debug, Clone)]
pub enum ActorError {
    #[error("{0}")]
    Error(String),

    #[error("fault: {0}")]
    Fault(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("watched actor '{actor}' entered state {state}")]
    WatchedState { actor: String, state: String },

    #[error("command '{method}' is not valid in state {state}")]
    InvalidCommand { method: &'static str, state: String },

    #[error("invalid state chart: {0}")]
    Configuration(String),

    #[error("trigger fired while a transition is in progress: {0}")]
    MidTransition(String),

    #[error("task was canceled before completion")]
    Canceled,

    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
}

impl ActorError {
    /// The category this error is routed under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActorError::Error(_) => ErrorKind::Generic,
            ActorError::Fault(_) => ErrorKind::Fault,
            ActorError::Timeout(_) => ErrorKind::Timeout,
            ActorError::WatchedState { .. } => ErrorKind::WatchedState,
            ActorError::InvalidCommand { .. } => ErrorKind::InvalidCommand,
            ActorError::Configuration(_) => ErrorKind::Configuration,
            ActorError::MidTransition(_) => ErrorKind::MidTransition,
            ActorError::Canceled => ErrorKind::Canceled,
            ActorError::Mailbox(_) => ErrorKind::Mailbox,
        }
    }

    /// Whether the error is dispatched to the fault hooks. Timeouts and
    /// watched-state errors are faults with extra context.
    pub fn is_fault(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Fault | ErrorKind::Timeout | ErrorKind::WatchedState
        )
    }
}

/// Result type for actor operations.
pub type ActorResult<T> = Result<T, ActorError>;
