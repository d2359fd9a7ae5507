//! Connection registry — live peer connections and their negotiated names.
//!
//! Owned by the room session and mutated only from its event loop. Writes
//! never block: each connection has an outbox drained by its own writer task.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::identity::{ConnId, PeerKey};

/// Lifecycle of one connection: `Connecting → Open → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closed,
}

/// Outcome of recording a name assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameChange {
    /// First name seen on this connection.
    Named,
    /// The peer asserted a different name than before.
    Renamed { previous: String },
    /// Same name as before.
    Unchanged,
    /// The connection is not (or no longer) registered.
    UnknownConnection,
}

struct Entry {
    remote_key: PeerKey,
    name: Option<String>,
    state: ConnState,
    outbox: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: HashMap<ConnId, Entry>,
    /// One live connection per remote identity.
    by_key: HashMap<PeerKey, ConnId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in `Connecting` state. Returns `false` (and changes
    /// nothing) if `id` is already registered, or if another live connection
    /// already reaches the same remote key.
    pub fn register(
        &mut self,
        id: ConnId,
        remote_key: PeerKey,
        outbox: mpsc::UnboundedSender<String>,
    ) -> bool {
        if self.conns.contains_key(&id) {
            debug!(%id, "Connection already registered");
            return false;
        }
        if let Some(existing) = self.by_key.get(&remote_key) {
            debug!(%id, %existing, peer = %remote_key.fingerprint(), "Peer already connected");
            return false;
        }
        self.by_key.insert(remote_key, id);
        self.conns.insert(
            id,
            Entry {
                remote_key,
                name: None,
                state: ConnState::Connecting,
                outbox,
            },
        );
        true
    }

    /// The transport is ready: start including this connection in broadcasts.
    pub fn mark_open(&mut self, id: ConnId) {
        if let Some(entry) = self.conns.get_mut(&id) {
            entry.state = ConnState::Open;
        }
    }

    pub fn state(&self, id: ConnId) -> ConnState {
        self.conns
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(ConnState::Closed)
    }

    /// Record the name the remote side asserted. Later assertions overwrite.
    pub fn set_name(&mut self, id: ConnId, name: &str) -> NameChange {
        let Some(entry) = self.conns.get_mut(&id) else {
            return NameChange::UnknownConnection;
        };
        match entry.name.replace(name.to_string()) {
            None => NameChange::Named,
            Some(previous) if previous == name => NameChange::Unchanged,
            Some(previous) => NameChange::Renamed { previous },
        }
    }

    pub fn name(&self, id: ConnId) -> Option<&str> {
        self.conns.get(&id).and_then(|e| e.name.as_deref())
    }

    /// Truncated remote key used when no name is known.
    pub fn fingerprint(&self, id: ConnId) -> Option<String> {
        self.conns.get(&id).map(|e| e.remote_key.fingerprint())
    }

    /// Best-known label: negotiated name, else fingerprint.
    pub fn label(&self, id: ConnId) -> String {
        match self.conns.get(&id) {
            Some(Entry { name: Some(name), .. }) => name.clone(),
            Some(entry) => entry.remote_key.fingerprint(),
            None => id.to_string(),
        }
    }

    /// Directed write to one open connection.
    pub fn send(&self, id: ConnId, line: String) -> bool {
        match self.conns.get(&id) {
            Some(entry) if entry.state == ConnState::Open => entry.outbox.send(line).is_ok(),
            _ => false,
        }
    }

    /// Write `line` to every open connection; returns how many were written to.
    pub fn broadcast(&self, line: &str) -> usize {
        let targets: Vec<_> = self
            .conns
            .iter()
            .filter(|(_, e)| e.state == ConnState::Open)
            .map(|(id, e)| (*id, e.outbox.clone()))
            .collect();

        let mut sent = 0;
        for (id, outbox) in targets {
            if outbox.send(line.to_string()).is_ok() {
                sent += 1;
            } else {
                trace!(%id, "Outbox closed, skipping");
            }
        }
        sent
    }

    /// Evict a connection. Dropping the outbox ends its writer task.
    /// Returns the remote key the first time, `None` afterwards.
    pub fn remove(&mut self, id: ConnId) -> Option<PeerKey> {
        let entry = self.conns.remove(&id)?;
        self.by_key.remove(&entry.remote_key);
        Some(entry.remote_key)
    }

    pub fn close_all(&mut self) {
        self.conns.clear();
        self.by_key.clear();
    }
}
