//! Client Registry
//!
//! Tracks connected subscribers and their liveness flags. The registry is
//! plain data; the relay guards it with its state lock and hands out
//! snapshots so fan-out never iterates the live map.

use std::collections::HashMap;

use crate::application::ports::{ClientHandle, ClientId};

#[derive(Debug)]
struct ClientEntry {
    handle: ClientHandle,
    is_alive: bool,
}

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Clients that missed the previous probe. Already removed.
    pub dead: Vec<ClientHandle>,
    /// Clients to ping. Their flags are now cleared.
    pub probe: Vec<ClientHandle>,
}

/// Set of active subscriber connections.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientEntry>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, marked alive.
    pub fn insert(&mut self, handle: ClientHandle) {
        self.clients.insert(
            handle.id(),
            ClientEntry {
                handle,
                is_alive: true,
            },
        );
    }

    /// Deregister a connection. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    /// Set a client's liveness flag after a pong.
    pub fn mark_alive(&mut self, id: ClientId) -> bool {
        self.clients.get_mut(&id).is_some_and(|entry| {
            entry.is_alive = true;
            true
        })
    }

    /// Copy of every registered handle.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Remove clients that missed the last probe; clear the flag on the rest.
    pub fn sweep(&mut self) -> Sweep {
        let mut sweep = Sweep::default();

        self.clients.retain(|_, entry| {
            if entry.is_alive {
                entry.is_alive = false;
                sweep.probe.push(entry.handle.clone());
                true
            } else {
                sweep.dead.push(entry.handle.clone());
                false
            }
        });

        sweep
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
