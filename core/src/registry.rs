//! Process-wide actor registry.
//!
//! Maps names to actor facades so wiring code can look up collaborators
//! (e.g. for cross-actor state watches) without threading handles through
//! every constructor. Handles are stored type-erased; lookup downcasts back
//! to the concrete facade type.

use std::any::Any;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::actor::ActorIdentity;

struct Entry {
    id: Uuid,
    registered_at: DateTime<Utc>,
    handle: Box<dyn Any + Send + Sync>,
}

/// Metadata for one registered actor.
#[derive(Debug, Clone)]
pub struct RegisteredActor {
    pub name: String,
    pub id: Uuid,
    pub registered_at: DateTime<Utc>,
}

/// Concurrent name → facade map.
#[derive(Default)]
pub struct ActorRegistry {
    actors: DashMap<String, Entry>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a facade under its own name. An existing entry under the
    /// same name is replaced.
    pub fn register<H>(&self, handle: H)
    where
        H: ActorIdentity + Any + Send + Sync,
    {
        let name = handle.name().to_string();
        debug!(actor = %name, id = %handle.id(), "registered actor");
        self.actors.insert(
            name,
            Entry {
                id: handle.id(),
                registered_at: Utc::now(),
                handle: Box::new(handle),
            },
        );
    }

    /// Looks up a facade by name, downcasting to the requested handle type.
    /// Returns `None` when the name is unknown or holds a different actor
    /// type.
    pub fn get<H>(&self, name: &str) -> Option<H>
    where
        H: Any + Send + Sync + Clone,
    {
        self.actors
            .get(name)
            .and_then(|entry| entry.handle.downcast_ref::<H>().cloned())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.actors.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.actors.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Metadata for every registered actor.
    pub fn entries(&self) -> Vec<RegisteredActor> {
        self.actors
            .iter()
            .map(|entry| RegisteredActor {
                name: entry.key().clone(),
                id: entry.value().id,
                registered_at: entry.value().registered_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}
