//! Listener registry: which sessions care about which names.
//!
//! One instance indexes store subscriptions (keyed by store key), another
//! indexes event listeners (keyed by event name). The registry only records
//! who listens; delivery policy belongs to the session owning each guid.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct EventBus {
    listeners: HashMap<String, HashSet<String>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `guid` under `name`. Returns false if it was already there.
    pub fn add_listener(&mut self, name: &str, guid: &str) -> bool {
        self.listeners
            .entry(name.to_string())
            .or_default()
            .insert(guid.to_string())
    }

    /// Drop `guid` from `name`. Returns false if it was not registered.
    pub fn remove_listener(&mut self, name: &str, guid: &str) -> bool {
        let Some(guids) = self.listeners.get_mut(name) else {
            return false;
        };
        let removed = guids.remove(guid);
        if guids.is_empty() {
            self.listeners.remove(name);
        }
        removed
    }

    /// Guids currently registered under `name`.
    pub fn listeners(&self, name: &str) -> Vec<String> {
        self.listeners
            .get(name)
            .map(|guids| guids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, HashSet::len)
    }
}
