//! Session-scoped registry of connection managers.
//!
//! An explicit, constructor-injected object rather than process-global mutable
//! state: whoever owns the sessions owns the registry, and removing a session
//! tears its connection down with it.

use dashmap::DashMap;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;

/// Maps a logical connection identifier (room/session id) to its manager.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: DashMap<String, ConnectionManager>,
}

impl ManagerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            managers: DashMap::new(),
        }
    }

    /// Get the manager for `id`, creating it from `config` if absent.
    /// The config is only consulted on creation.
    #[must_use]
    pub fn get_or_create(&self, id: &str, config: ConnectionConfig) -> ConnectionManager {
        self.managers
            .entry(id.to_owned())
            .or_insert_with(|| ConnectionManager::new(config))
            .clone()
    }

    /// Look up an existing manager without creating one.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ConnectionManager> {
        self.managers.get(id).map(|entry| entry.clone())
    }

    /// Disconnect and forget the manager for `id`.
    pub fn remove(&self, id: &str) {
        if let Some((_, manager)) = self.managers.remove(id) {
            manager.disconnect();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
