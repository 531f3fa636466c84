//! Routing tables derived from the topology graph.
//!
//! Tables are recomputed wholesale by a [`RouteCalculator`] task and swapped
//! in atomically; lookups always see one consistent snapshot. Requests to
//! recompute are coalesced, so a burst of topology changes costs at most one
//! extra calculation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use trellis_core::{PeerName, PeerNameSet};

use crate::peer::Peer;
use crate::peers::Peers;

/// First hop towards a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextHop {
    /// The destination is us.
    Ourself,
    Peer(PeerName),
}

impl NextHop {
    pub fn peer(self) -> Option<PeerName> {
        match self {
            NextHop::Ourself => None,
            NextHop::Peer(name) => Some(name),
        }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::Ourself => f.write_str("ourself"),
            NextHop::Peer(name) => write!(f, "{name}"),
        }
    }
}

/// One consistent set of routing tables.
///
/// The `*_all` variants consider every known link; the others only links
/// that are established in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTables {
    pub unicast: HashMap<PeerName, NextHop>,
    pub unicast_all: HashMap<PeerName, NextHop>,
    pub broadcast: HashMap<PeerName, Vec<PeerName>>,
    pub broadcast_all: HashMap<PeerName, Vec<PeerName>>,
}

impl RouteTables {
    /// Tables knowing only ourself.
    fn initial(ourself: PeerName) -> Self {
        let mut tables = Self::default();
        tables.unicast.insert(ourself, NextHop::Ourself);
        tables.unicast_all.insert(ourself, NextHop::Ourself);
        tables.broadcast.insert(ourself, Vec::new());
        tables.broadcast_all.insert(ourself, Vec::new());
        tables
    }
}

struct RouteState {
    ourself: Arc<Peer>,
    peers: Arc<Peers>,
    tables: RwLock<RouteTables>,
}

/// Handle to the routing tables. Cheap to clone.
///
/// The [`RouteCalculator`] returned alongside must be spawned for
/// [`Routes::recalculate`] to have any effect. It stops once every handle
/// has been dropped.
#[derive(Clone)]
pub struct Routes {
    state: Arc<RouteState>,
    recalculate_tx: mpsc::Sender<()>,
    wait_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl Routes {
    pub fn new(ourself: Arc<Peer>, peers: Arc<Peers>) -> (Self, RouteCalculator) {
        let (recalculate_tx, recalculate_rx) = mpsc::channel(1);
        let (wait_tx, wait_rx) = mpsc::channel(8);
        let state = Arc::new(RouteState {
            tables: RwLock::new(RouteTables::initial(ourself.name)),
            ourself,
            peers,
        });
        let calculator = RouteCalculator {
            state: state.clone(),
            recalculate_rx,
            wait_rx,
        };
        let routes = Self {
            state,
            recalculate_tx,
            wait_tx,
        };
        (routes, calculator)
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub fn unicast(&self, name: PeerName) -> Option<NextHop> {
        self.state.tables.read().unicast.get(&name).copied()
    }

    pub fn unicast_all(&self, name: PeerName) -> Option<NextHop> {
        self.state.tables.read().unicast_all.get(&name).copied()
    }

    /// Neighbours to pass a broadcast from `origin` on to. Empty if we have
    /// no route for `origin`.
    pub fn broadcast(&self, origin: PeerName) -> Vec<PeerName> {
        self.state
            .tables
            .read()
            .broadcast
            .get(&origin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn broadcast_all(&self, origin: PeerName) -> Vec<PeerName> {
        self.state
            .tables
            .read()
            .broadcast_all
            .get(&origin)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick about log2(peers) distinct neighbours for gossip, never `except`.
    ///
    /// Sampling is over destinations rather than neighbours, so a neighbour
    /// that is the first hop to many peers is more likely to be chosen.
    /// With fewer neighbours than the target count, all are returned.
    pub fn random_neighbours(&self, except: PeerName) -> PeerNameSet {
        let (count, mut hops) = {
            let tables = self.state.tables.read();
            let count = tables.unicast_all.len().checked_ilog2().unwrap_or(0) as usize;
            let hops: Vec<PeerName> = tables
                .unicast_all
                .values()
                .filter_map(|hop| hop.peer())
                .filter(|&hop| hop != except)
                .collect();
            (count, hops)
        };
        hops.shuffle(&mut rand::thread_rng());

        let mut chosen = PeerNameSet::new();
        for hop in hops {
            chosen.insert(hop);
            if chosen.len() >= count {
                break;
            }
        }
        chosen
    }

    pub fn peer_names(&self) -> PeerNameSet {
        self.state.peers.names()
    }

    pub fn snapshot(&self) -> RouteTables {
        self.state.tables.read().clone()
    }

    // ── Recalculation ────────────────────────────────────────────────────────

    /// Ask for the tables to be recomputed. Never blocks; requests made
    /// while one is pending are merged into it.
    pub fn recalculate(&self) {
        let _ = self.recalculate_tx.try_send(());
    }

    /// Wait until every recalculation requested before this call is done.
    pub async fn ensure_recalculated(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.wait_tx.send(done_tx).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Recompute the tables on the calling thread.
    pub fn calculate(&self) {
        self.state.calculate();
    }
}

impl RouteState {
    fn calculate(&self) {
        let tables = RouteTables {
            unicast: self.calculate_unicast(true),
            unicast_all: self.calculate_unicast(false),
            broadcast: self.calculate_broadcast(true),
            broadcast_all: self.calculate_broadcast(false),
        };
        tracing::debug!(
            reachable = tables.unicast.len(),
            known = tables.unicast_all.len(),
            "routes recalculated"
        );
        *self.tables.write() = tables;
    }

    /// If we want to send to X, which neighbour do we hand it to?
    fn calculate_unicast(&self, established_and_symmetric: bool) -> HashMap<PeerName, NextHop> {
        let (_, reached) = self.ourself.routes(None, established_and_symmetric);
        reached
    }

    /// If we receive a broadcast that originated at X, which neighbours do
    /// we pass it on to?
    ///
    /// Our neighbours that X's search reaches before it reaches us get the
    /// frame from someone else; we cover the rest. Because every peer runs
    /// the same name-ordered search, these sets partition the network and a
    /// stable topology sees each broadcast delivered exactly once.
    fn calculate_broadcast(&self, established_and_symmetric: bool) -> HashMap<PeerName, Vec<PeerName>> {
        let ourself = &self.ourself;
        let our_connections = ourself.connections();
        let mut broadcast = HashMap::new();

        for origin in self.peers.all() {
            let mut hops = Vec::new();
            let (found, reached) = origin.routes(Some(ourself), established_and_symmetric);
            if found {
                for conn in &our_connections {
                    if established_and_symmetric && !conn.established() {
                        continue;
                    }
                    let Some(remote) = conn.remote() else {
                        continue;
                    };
                    if reached.contains_key(&remote.name) {
                        continue;
                    }
                    if !established_and_symmetric
                        || remote.has_established_connection_to(ourself.name)
                    {
                        hops.push(remote.name);
                    }
                }
                hops.sort();
            }
            broadcast.insert(origin.name, hops);
        }
        broadcast
    }
}

impl fmt::Display for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.snapshot();
        writeln!(f, "unicast:")?;
        let mut unicast: Vec<_> = tables.unicast.iter().collect();
        unicast.sort_by_key(|(name, _)| **name);
        for (name, hop) in unicast {
            writeln!(f, "{name} -> {hop}")?;
        }
        writeln!(f, "broadcast:")?;
        let mut broadcast: Vec<_> = tables.broadcast.iter().collect();
        broadcast.sort_by_key(|(name, _)| **name);
        for (name, hops) in broadcast {
            let hops: Vec<String> = hops.iter().map(ToString::to_string).collect();
            writeln!(f, "{name} -> [{}]", hops.join(", "))?;
        }
        Ok(())
    }
}

// ── Calculator task ───────────────────────────────────────────────────────────

/// Background worker that recomputes routes on request.
pub struct RouteCalculator {
    state: Arc<RouteState>,
    recalculate_rx: mpsc::Receiver<()>,
    wait_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl RouteCalculator {
    pub async fn run(mut self) {
        tracing::debug!(peer = %self.state.ourself, "route calculator started");
        loop {
            tokio::select! {
                trigger = self.recalculate_rx.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    self.state.calculate();
                }
                waiter = self.wait_rx.recv() => {
                    let Some(done) = waiter else {
                        break;
                    };
                    // Serve a pending request first so the waiter sees it.
                    if self.recalculate_rx.try_recv().is_ok() {
                        self.state.calculate();
                    }
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(peer = %self.state.ourself, "route calculator stopped");
    }
}
