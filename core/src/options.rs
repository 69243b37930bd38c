//! Runtime options for actors and their mailboxes.
//!
//! Options are plain serde structs so hosts can embed them in their own
//! configuration files; [`ActorOptions::from_toml_str`] covers the common
//! case of a TOML fragment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ActorError;

/// How long an idle worker lingers before releasing its thread, in
/// milliseconds. A later enqueue respawns the worker transparently.
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 20_000;

/// Options shared by an actor and its mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorOptions {
    /// Name used for the worker thread, tracing spans, and registry entries.
    #[serde(default = "default_name")]
    pub name: String,

    /// Idle time after which the worker thread exits (milliseconds).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_name() -> String {
    "actor".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl ActorOptions {
    /// Default options with the given actor name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Parses options from a TOML fragment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ActorError> {
        toml::from_str(raw)
            .map_err(|err| ActorError::Configuration(format!("invalid actor options: {err}")))
    }
}
