//! Vertices of the topology graph.
//!
//! A [`Peer`] is shared by everything that knows about it (registry, routes,
//! connections, gossip). Its connection map and version are written only by
//! whoever is authoritative for it: the local peer actor for our own peer,
//! the registry's gossip merge for everyone else.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use trellis_core::wire::{self, PeerSummary};
use trellis_core::{PeerName, PeerUid, WireError};

use crate::connection::Connection;
use crate::routes::NextHop;

pub struct Peer {
    pub name: PeerName,
    pub nick_name: String,
    pub uid: PeerUid,
    state: RwLock<PeerState>,
    /// Pins taken by local subsystems. A pinned peer survives GC even when
    /// unreachable.
    local_refs: AtomicUsize,
}

#[derive(Default)]
struct PeerState {
    version: u64,
    connections: HashMap<PeerName, Connection>,
}

/// Result of a breadth-first search: every reached peer, mapped to the
/// first hop taken from the start peer. The start peer maps to
/// [`NextHop::Ourself`].
pub type Reached = HashMap<PeerName, NextHop>;

impl Peer {
    pub fn new(name: PeerName, nick_name: impl Into<String>, uid: PeerUid, version: u64) -> Self {
        Self {
            name,
            nick_name: nick_name.into(),
            uid,
            state: RwLock::new(PeerState {
                version,
                connections: HashMap::new(),
            }),
            local_refs: AtomicUsize::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.state.read().connections.values().cloned().collect()
    }

    pub fn connection_to(&self, name: PeerName) -> Option<Connection> {
        self.state.read().connections.get(&name).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Does this peer hold an established connection to `name`?
    pub fn has_established_connection_to(&self, name: PeerName) -> bool {
        self.state
            .read()
            .connections
            .get(&name)
            .is_some_and(Connection::established)
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Replace a remote peer's view wholesale from gossip.
    pub(crate) fn set_version_and_connections(
        &self,
        version: u64,
        connections: HashMap<PeerName, Connection>,
    ) {
        let mut state = self.state.write();
        state.version = version;
        state.connections = connections;
    }

    /// Record a new local connection. Callers hold the actor.
    pub(crate) fn add_connection(&self, name: PeerName, conn: Connection) {
        let mut state = self.state.write();
        state.connections.insert(name, conn);
        state.version += 1;
    }

    pub(crate) fn delete_connection(&self, name: PeerName) {
        let mut state = self.state.write();
        state.connections.remove(&name);
        state.version += 1;
    }

    /// A connection became established; only the version changes here, the
    /// flag itself lives on the connection.
    pub(crate) fn connection_established(&self) {
        self.state.write().version += 1;
    }

    // ── Local pins ───────────────────────────────────────────────────────────

    pub fn increment_local_ref_count(&self) {
        self.local_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one pin. Saturates at zero.
    pub fn decrement_local_ref_count(&self) {
        let _ = self
            .local_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_locally_referenced(&self) -> bool {
        self.local_refs.load(Ordering::Acquire) > 0
    }

    // ── Graph traversal ──────────────────────────────────────────────────────

    /// Breadth-first search from this peer.
    ///
    /// Each level is visited in ascending name order. Broadcast routing
    /// depends on this: with a fixed order the reached sets of any two
    /// searches from the same peer are nested, which is what makes the
    /// per-origin broadcast trees deliver exactly once. Changing the order
    /// breaks that.
    ///
    /// With `established_and_symmetric` only links that are established and
    /// have an established link back are followed. If `stop_at` is dequeued
    /// the search ends early and returns `true` with everything reached so
    /// far.
    pub fn routes(
        self: &Arc<Self>,
        stop_at: Option<&Arc<Peer>>,
        established_and_symmetric: bool,
    ) -> (bool, Reached) {
        let mut reached = Reached::new();
        reached.insert(self.name, NextHop::Ourself);
        let mut next_level = vec![self.clone()];

        while !next_level.is_empty() {
            let mut level = std::mem::take(&mut next_level);
            level.sort_by_key(|p| p.name);
            for current in &level {
                if stop_at.is_some_and(|stop| Arc::ptr_eq(stop, current)) {
                    return (true, reached);
                }
                for remote in current.connected_peers(established_and_symmetric, &reached) {
                    // Neighbours of the start peer are their own first hop;
                    // everything further out inherits its parent's.
                    let hop = match reached.get(&current.name) {
                        Some(NextHop::Peer(first)) => NextHop::Peer(*first),
                        _ => NextHop::Peer(remote.name),
                    };
                    reached.insert(remote.name, hop);
                    next_level.push(remote);
                }
            }
        }
        (false, reached)
    }

    /// Neighbours not yet in `exclude`, filtered by link quality.
    fn connected_peers(&self, established_and_symmetric: bool, exclude: &Reached) -> Vec<Arc<Peer>> {
        let connections = self.connections();
        connections
            .into_iter()
            .filter(|conn| !established_and_symmetric || conn.established())
            .filter_map(|conn| conn.remote())
            .filter(|remote| !exclude.contains_key(&remote.name))
            .filter(|remote| {
                !established_and_symmetric || remote.has_established_connection_to(self.name)
            })
            .collect()
    }

    // ── Gossip ───────────────────────────────────────────────────────────────

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let (summary, connections) = {
            let state = self.state.read();
            let summary = PeerSummary {
                name: self.name,
                nick_name: self.nick_name.clone(),
                uid: self.uid,
                version: state.version,
            };
            let connections: Vec<_> = state
                .connections
                .values()
                .filter_map(Connection::summary)
                .collect();
            (summary, connections)
        };
        wire::encode_peer(buf, &summary, &connections)
    }

    /// One-line description including version and uid.
    pub fn info(&self) -> String {
        format!("{} (v{}) (UID {})", self, self.version(), self.uid)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.nick_name)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("nick_name", &self.nick_name)
            .field("uid", &self.uid)
            .field("version", &self.version())
            .finish()
    }
}
