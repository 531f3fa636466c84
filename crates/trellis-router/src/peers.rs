//! Peer registry: every peer we know about, local and remote.
//!
//! Peers enter the table as ourself, through an authenticated local
//! connection ([`Peers::fetch_with_default`]), or through gossip
//! ([`Peers::apply_update`]). They leave only through garbage collection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use trellis_core::wire::{self, PeerUpdate};
use trellis_core::{PeerName, PeerNameSet};

use crate::connection::{Connection, RemoteConnection};
use crate::error::TopologyError;
use crate::peer::Peer;

/// Called for every peer removed by garbage collection.
pub type GcHook = Box<dyn Fn(&Arc<Peer>) + Send + Sync>;

type PeerTable = HashMap<PeerName, Arc<Peer>>;

pub struct Peers {
    ourself: Arc<Peer>,
    table: RwLock<PeerTable>,
    on_gc: Option<GcHook>,
}

impl Peers {
    pub fn new(ourself: Arc<Peer>) -> Self {
        let mut table = HashMap::new();
        table.insert(ourself.name, ourself.clone());
        Self {
            ourself,
            table: RwLock::new(table),
            on_gc: None,
        }
    }

    /// Register `hook` to run for each garbage-collected peer. Hooks run
    /// after the table lock is released.
    pub fn with_gc_hook(mut self, hook: impl Fn(&Arc<Peer>) + Send + Sync + 'static) -> Self {
        self.on_gc = Some(Box::new(hook));
        self
    }

    pub fn ourself(&self) -> &Arc<Peer> {
        &self.ourself
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Canonical instance for `candidate`'s name, pinned for the caller.
    ///
    /// An existing entry with the same UID is reused. An entry with a
    /// different UID is a stale identity (the peer restarted) and is
    /// replaced by the candidate.
    pub fn fetch_with_default(&self, candidate: Arc<Peer>) -> Arc<Peer> {
        if let Some(existing) = Self::fetch_alias(&self.table.read(), &candidate) {
            return existing;
        }

        let mut table = self.table.write();
        if let Some(existing) = Self::fetch_alias(&table, &candidate) {
            return existing;
        }
        if let Some(stale) = table.get(&candidate.name) {
            tracing::info!(
                peer = %candidate,
                old_uid = stale.uid,
                new_uid = candidate.uid,
                "peer identity replaced"
            );
        }
        candidate.increment_local_ref_count();
        table.insert(candidate.name, candidate.clone());
        candidate
    }

    fn fetch_alias(table: &PeerTable, candidate: &Peer) -> Option<Arc<Peer>> {
        let existing = table.get(&candidate.name)?;
        if existing.uid != candidate.uid {
            return None;
        }
        existing.increment_local_ref_count();
        Some(existing.clone())
    }

    /// Release a pin taken by [`Peers::fetch_with_default`].
    pub fn dereference(&self, peer: &Peer) {
        peer.decrement_local_ref_count();
    }

    pub fn fetch(&self, name: PeerName) -> Option<Arc<Peer>> {
        self.table.read().get(&name).cloned()
    }

    pub fn names(&self) -> PeerNameSet {
        self.table.read().keys().copied().collect()
    }

    /// Snapshot of every known peer.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.table.read().values().cloned().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Peer>)) {
        for peer in self.table.read().values() {
            f(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    // ── Gossip merge ─────────────────────────────────────────────────────────

    /// Merge a gossip update into our view.
    ///
    /// Returns the names mentioned in the update and the names that were
    /// added or changed and survived garbage collection. Only the latter
    /// should be passed on. On error nothing is changed.
    pub fn apply_update(&self, update: &[u8]) -> Result<(PeerNameSet, PeerNameSet), TopologyError> {
        let mut table = self.table.write();

        let records = wire::decode_update(update)?;
        let new_peers = Self::validate(&table, &records)?;

        for (name, peer) in &new_peers {
            table.insert(*name, peer.clone());
        }

        let mut improved = PeerNameSet::new();
        let mut applied = PeerNameSet::new();
        for record in &records {
            let summary = &record.peer;
            let Some(peer) = table.get(&summary.name).cloned() else {
                continue;
            };
            // The first record of a new peer always lands; any repeat of it
            // in the same update is held to the version check.
            let first_of_new =
                new_peers.contains_key(&summary.name) && applied.insert(summary.name);
            // Nobody but us updates us, and stale versions are ignored.
            if !first_of_new
                && (Arc::ptr_eq(&peer, &self.ourself) || peer.version() >= summary.version)
            {
                continue;
            }
            let connections = record
                .connections
                .iter()
                .filter_map(|conn| {
                    let remote = table.get(&conn.remote)?;
                    let edge = RemoteConnection::new(
                        &peer,
                        remote,
                        conn.remote_tcp_addr.clone(),
                        conn.outbound,
                        conn.established,
                    );
                    Some((conn.remote, Connection::Remote(Arc::new(edge))))
                })
                .collect();
            peer.set_version_and_connections(summary.version, connections);
            improved.insert(summary.name);
        }

        // Collect before anything is re-gossiped, so we never advertise a
        // peer we are about to forget.
        let removed = Self::garbage_collect_locked(&self.ourself, &mut table);
        drop(table);
        for peer in &removed {
            improved.remove(&peer.name);
        }
        self.notify_removed(&removed);

        let received: PeerNameSet = records.iter().map(|r| r.peer.name).collect();
        tracing::debug!(
            received = received.len(),
            improved = improved.len(),
            "applied topology update"
        );
        Ok((received, improved))
    }

    /// Check an update against the table. Returns the peers it introduces.
    fn validate(
        table: &PeerTable,
        records: &[PeerUpdate],
    ) -> Result<HashMap<PeerName, Arc<Peer>>, TopologyError> {
        let mut new_peers = HashMap::new();
        for record in records {
            let summary = &record.peer;
            match table.get(&summary.name) {
                Some(existing) if existing.uid != summary.uid => {
                    return Err(TopologyError::NameCollision(summary.name));
                }
                Some(_) => {}
                None => {
                    new_peers.entry(summary.name).or_insert_with(|| {
                        Arc::new(Peer::new(
                            summary.name,
                            summary.nick_name.clone(),
                            summary.uid,
                            summary.version,
                        ))
                    });
                }
            }
        }

        for conn in records.iter().flat_map(|r| &r.connections) {
            if !new_peers.contains_key(&conn.remote) && !table.contains_key(&conn.remote) {
                return Err(TopologyError::UnknownPeer(conn.remote));
            }
        }
        Ok(new_peers)
    }

    // ── Garbage collection ───────────────────────────────────────────────────

    /// Forget every peer that is neither reachable from us nor pinned.
    pub fn garbage_collect(&self) -> Vec<Arc<Peer>> {
        let removed = Self::garbage_collect_locked(&self.ourself, &mut self.table.write());
        self.notify_removed(&removed);
        removed
    }

    fn garbage_collect_locked(ourself: &Arc<Peer>, table: &mut PeerTable) -> Vec<Arc<Peer>> {
        let (_, reached) = ourself.routes(None, false);
        let mut removed = Vec::new();
        table.retain(|name, peer| {
            let keep = reached.contains_key(name) || peer.is_locally_referenced();
            if !keep {
                removed.push(peer.clone());
            }
            keep
        });
        removed
    }

    /// Runs with the table unlocked, so hooks may call back into `Peers`.
    fn notify_removed(&self, removed: &[Arc<Peer>]) {
        for peer in removed {
            tracing::debug!(peer = %peer, "garbage collected unreachable peer");
            if let Some(hook) = &self.on_gc {
                hook(peer);
            }
        }
    }

    // ── Encoding ─────────────────────────────────────────────────────────────

    /// Encode the named peers for gossip. Unknown names are skipped.
    pub fn encode_peers(&self, names: &PeerNameSet) -> Bytes {
        let peers: Vec<Arc<Peer>> = {
            let table = self.table.read();
            names.iter().filter_map(|name| table.get(name).cloned()).collect()
        };
        Self::encode_list(&peers)
    }

    /// Encode every known peer.
    pub fn encode_all(&self) -> Bytes {
        Self::encode_list(&self.all())
    }

    fn encode_list(peers: &[Arc<Peer>]) -> Bytes {
        let mut buf = BytesMut::new();
        for peer in peers {
            if let Err(e) = peer.encode(&mut buf) {
                tracing::error!(peer = %peer, error = %e, "failed to encode peer, skipping");
            }
        }
        buf.freeze()
    }
}

impl fmt::Display for Peers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut peers = self.all();
        peers.sort_by_key(|p| p.name);
        for peer in peers {
            writeln!(f, "{}", peer.info())?;
            let mut connections = peer.connections();
            connections.sort_by_key(|c| c.remote().map(|r| r.name));
            for conn in connections {
                let established = if conn.established() { "" } else { " (unestablished)" };
                match conn.remote() {
                    Some(remote) => writeln!(
                        f,
                        "   -> {} [{}{}]",
                        remote,
                        conn.remote_tcp_addr(),
                        established
                    )?,
                    None => continue,
                }
            }
        }
        Ok(())
    }
}
