//! Trellis integration test harness.
//!
//! Runs several routers in one process. Connections are in-memory mocks and
//! gossip is carried by a fabric that delivers each node's outgoing
//! updates to its direct neighbours, which relay whatever improved their
//! view. No sockets, no namespaces.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=trellis_router=debug to watch the routers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use trellis_core::{PeerName, PeerNameSet, RouterConfig};
use trellis_router::testing::MockConnection;
use trellis_router::{
    ConnectionError, FrameContext, GossipSender, LocalConnection, NextHop, Peer, Router,
    TieBackoff, TopologyError, TopologyGossipData,
};

mod broadcast;
mod convergence;

// ── Gossip fabric ─────────────────────────────────────────────────────────────

enum Outgoing {
    Broadcast(TopologyGossipData),
    Down(PeerName, TopologyGossipData),
}

/// Per-node outbox. The harness drains it and delivers by hand.
#[derive(Default)]
pub struct Outbox {
    queue: Mutex<Vec<Outgoing>>,
}

impl GossipSender for Outbox {
    fn broadcast(&self, data: TopologyGossipData) {
        self.queue.lock().push(Outgoing::Broadcast(data));
    }

    fn send_down(&self, conn: &Arc<dyn LocalConnection>, data: TopologyGossipData) {
        if let Some(remote) = conn.remote() {
            self.queue.lock().push(Outgoing::Down(remote.name, data));
        }
    }
}

pub struct Node {
    pub router: Router,
    outbox: Arc<Outbox>,
}

impl Node {
    pub fn name(&self) -> PeerName {
        self.router.ourself().name
    }

    /// Names of the peers we hold a local connection to.
    pub fn neighbours(&self) -> Vec<PeerName> {
        self.router
            .ourself()
            .connections()
            .into_iter()
            .filter(|c| c.as_local().is_some())
            .filter_map(|c| c.remote().map(|r| r.name))
            .collect()
    }

    /// This node's instance of peer `name`.
    pub fn view_of(&self, name: PeerName) -> Result<Arc<Peer>> {
        self.router
            .peers()
            .fetch(name)
            .with_context(|| format!("{} does not know {}", self.name(), name))
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

const SETTLE_ROUNDS: usize = 200;
const MAX_REDIALS: u32 = 8;

pub struct Net {
    pub nodes: Vec<Node>,
    /// Connection held by `.0` towards `.1`.
    links: HashMap<(PeerName, PeerName), Arc<MockConnection>>,
    next_conn_uid: u64,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn names(values: &[u64]) -> PeerNameSet {
    values.iter().map(|&v| PeerName(v)).collect()
}

impl Net {
    /// `n` started routers named 1..=n, not connected to each other.
    pub fn new(n: u64) -> Self {
        init_tracing();
        let nodes = (1..=n)
            .map(|name| {
                let outbox = Arc::new(Outbox::default());
                let mut config = RouterConfig::default();
                config.router.nick_name = format!("node-{name}");
                let router = Router::with_identity(
                    config,
                    PeerName(name),
                    name * 1000 + 7,
                    outbox.clone(),
                );
                router.start();
                Node { router, outbox }
            })
            .collect();
        Self {
            nodes,
            links: HashMap::new(),
            next_conn_uid: 1,
        }
    }

    pub fn node(&self, name: u64) -> &Node {
        &self.nodes[(name - 1) as usize]
    }

    fn index(&self, name: PeerName) -> Result<usize> {
        let i = name.0.checked_sub(1).context("peer name 0")? as usize;
        if i >= self.nodes.len() {
            bail!("no node named {name}");
        }
        Ok(i)
    }

    pub fn all_names(&self) -> PeerNameSet {
        self.nodes.iter().map(Node::name).collect()
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Register one end of a connection at `from`, the way a transport
    /// would after its handshake: pin the remote, then hand it to the actor.
    pub async fn half_connect(&mut self, from: u64, to: u64, uid: u64) -> Result<Arc<MockConnection>> {
        let remote_identity = {
            let to = self.node(to).router.ourself();
            Arc::new(Peer::new(to.name, to.nick_name.clone(), to.uid, 0))
        };
        let node = self.node(from);
        let remote = node.router.peers().fetch_with_default(remote_identity);
        let conn = MockConnection::new(node.router.ourself(), &remote, uid);
        if let Err(e) = node.router.local_peer().add_connection(conn.clone()).await {
            node.router.peers().dereference(&remote);
            return Err(e).with_context(|| format!("{from} refused connection to {to}"));
        }
        self.links.insert((PeerName(from), PeerName(to)), conn.clone());
        Ok(conn)
    }

    fn fresh_uid(&mut self) -> u64 {
        let uid = self.next_conn_uid;
        self.next_conn_uid += 1;
        uid
    }

    /// Connect `a` and `b`, establish both ends, and let gossip settle.
    pub async fn connect(&mut self, a: u64, b: u64) -> Result<()> {
        let uid = self.fresh_uid();
        self.dial(a, b, uid).await
    }

    /// Both ends of one dial carrying `uid`, then establish and settle.
    async fn dial(&mut self, a: u64, b: u64, uid: u64) -> Result<()> {
        let ab = self.half_connect(a, b, uid).await?;
        let ba = match self.half_connect(b, a, uid).await {
            Ok(conn) => conn,
            Err(e) => {
                // The far end refused; hang up ours.
                if let Some(reason) = e.downcast_ref::<ConnectionError>() {
                    ab.shutdown(reason);
                }
                return Err(e);
            }
        };
        for (node, conn) in [(a, ab), (b, ba)] {
            conn.set_established();
            let local = self.node(node).router.local_peer();
            local.connection_established(conn.clone()).await;
            // Re-adding is a no-op that returns once the notification above
            // has been handled.
            local.add_connection(conn).await?;
        }
        self.settle().await
    }

    /// Dial `a` to `b` the way a transport redials: when either end
    /// refuses with `Duplicate`, close what is left of the pair, wait out
    /// `backoff` and dial again with a fresh uid. Returns how many dials
    /// were refused.
    pub async fn dial_with_backoff(
        &mut self,
        a: u64,
        b: u64,
        first_uid: u64,
        backoff: &mut TieBackoff,
    ) -> Result<u32> {
        let mut uid = first_uid;
        let mut refused = 0;
        while refused < MAX_REDIALS {
            match self.dial(a, b, uid).await {
                Ok(()) => {
                    backoff.reset();
                    return Ok(refused);
                }
                Err(e)
                    if matches!(
                        e.downcast_ref::<ConnectionError>(),
                        Some(ConnectionError::Duplicate { .. })
                    ) =>
                {
                    refused += 1;
                    self.close_shut_down_links().await?;
                    let delay = backoff.next_delay();
                    tracing::debug!(a, b, attempt = backoff.attempt(), ?delay, "duplicate connection, redialling");
                    tokio::time::sleep(delay).await;
                    uid = self.fresh_uid();
                }
                Err(e) => return Err(e),
            }
        }
        bail!("{a} and {b} still refused after {MAX_REDIALS} dials")
    }

    /// Close every pair with a shut-down end at both nodes, as a transport
    /// does when one side hangs up.
    async fn close_shut_down_links(&mut self) -> Result<()> {
        let dead: Vec<_> = self
            .links
            .iter()
            .filter(|(_, conn)| conn.is_shut_down())
            .map(|(&key, _)| key)
            .collect();
        for (from, to) in dead {
            for key in [(from, to), (to, from)] {
                let Some(conn) = self.links.remove(&key) else {
                    continue;
                };
                let node = &self.nodes[self.index(key.0)?];
                if let Some(remote) = conn.remote() {
                    node.router.peers().dereference(&remote);
                }
                node.router.local_peer().delete_connection(conn).await?;
            }
        }
        Ok(())
    }

    pub async fn disconnect(&mut self, a: u64, b: u64) -> Result<()> {
        for (from, to) in [(a, b), (b, a)] {
            let conn = self
                .links
                .remove(&(PeerName(from), PeerName(to)))
                .with_context(|| format!("{from} has no connection to {to}"))?;
            let node = self.node(from);
            if let Some(remote) = conn.remote() {
                node.router.peers().dereference(&remote);
            }
            node.router.local_peer().delete_connection(conn).await?;
        }
        self.settle().await
    }

    pub fn link(&self, from: PeerName, to: PeerName) -> Option<&Arc<MockConnection>> {
        self.links.get(&(from, to))
    }

    // ── Gossip delivery ──────────────────────────────────────────────────────

    /// Deliver everything queued right now. Returns the number of updates
    /// delivered.
    fn pump(&self) -> Result<usize> {
        let mut delivered = 0;
        for node in &self.nodes {
            let outgoing = std::mem::take(&mut *node.outbox.queue.lock());
            for item in outgoing {
                let (targets, data) = match item {
                    Outgoing::Broadcast(data) => (node.neighbours(), data),
                    Outgoing::Down(remote, data) => (vec![remote], data),
                };
                let bytes = data.encode();
                for target in targets {
                    let receiver = &self.nodes[self.index(target)?];
                    delivered += 1;
                    match receiver.router.on_gossip(&bytes) {
                        Ok(Some(onward)) => receiver.outbox.broadcast(onward),
                        Ok(None) => {}
                        Err(e @ TopologyError::UnknownPeer(_)) => {
                            // Reply with everything the sender knows so the
                            // receiver can resolve the missing peer.
                            tracing::debug!(from = %node.name(), to = %target, error = %e, "repairing");
                            node.outbox.queue.lock().push(Outgoing::Down(
                                target,
                                TopologyGossipData::all(node.router.peers().clone()),
                            ));
                        }
                        Err(e) => {
                            tracing::debug!(from = %node.name(), to = %target, error = %e, "update rejected");
                        }
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Pump gossip until nothing is left in flight and every router has
    /// caught up on route recalculation.
    pub async fn settle(&self) -> Result<()> {
        for _ in 0..SETTLE_ROUNDS {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if self.pump()? > 0 {
                continue;
            }
            for node in &self.nodes {
                node.router.routes().ensure_recalculated().await;
            }
            if self.nodes.iter().all(|n| n.outbox.queue.lock().is_empty()) {
                return Ok(());
            }
        }
        bail!("gossip did not settle after {SETTLE_ROUNDS} rounds")
    }

    // ── Checks ───────────────────────────────────────────────────────────────

    /// Follow unicast next hops from `from` to `to`. Returns the hops taken.
    pub fn unicast_path(&self, from: PeerName, to: PeerName) -> Result<Vec<PeerName>> {
        let mut current = from;
        let mut path = Vec::new();
        for _ in 0..=self.nodes.len() {
            let node = &self.nodes[self.index(current)?];
            match node.router.routes().unicast(to) {
                Some(NextHop::Ourself) if current == to => return Ok(path),
                Some(NextHop::Ourself) => bail!("{current} thinks it is {to}"),
                Some(NextHop::Peer(hop)) => {
                    path.push(hop);
                    current = hop;
                }
                None => bail!("{current} has no route to {to}"),
            }
        }
        bail!("routing loop from {from} to {to}: {path:?}")
    }

    /// Every node knows exactly `members` and routes to each of them.
    pub fn assert_converged(&self, members: &[u64]) -> Result<()> {
        let expected = names(members);
        for &m in members {
            let node = self.node(m);
            let known = node.router.peers().names();
            if known != expected {
                bail!("{} knows {:?}, expected {:?}", node.name(), known, expected);
            }
            for &other in members {
                self.unicast_path(PeerName(m), PeerName(other))?;
            }
        }
        Ok(())
    }

    // ── Data plane ───────────────────────────────────────────────────────────

    /// Broadcast a frame from `origin` and carry it through the network.
    /// Returns how many copies each node received.
    pub fn flood(&self, origin: u64, payload: &'static [u8]) -> Result<HashMap<PeerName, usize>> {
        let ctx = FrameContext::default();
        self.node(origin)
            .router
            .local_peer()
            .broadcast(false, Bytes::from_static(payload), &ctx);

        let mut received: HashMap<PeerName, usize> = HashMap::new();
        for _ in 0..self.nodes.len() * self.nodes.len() {
            let in_flight = self.take_frames();
            if in_flight.is_empty() {
                return Ok(received);
            }
            for (to, frame) in in_flight {
                *received.entry(to).or_default() += 1;
                let node = &self.nodes[self.index(to)?];
                let src = node.view_of(frame.src_peer.name)?;
                node.router
                    .local_peer()
                    .relay_broadcast(&src, false, frame.frame, &ctx);
            }
        }
        bail!("broadcast from {origin} is still circulating")
    }

    /// Send a frame from `from` to `to` hop by hop. Returns the nodes it
    /// passed through, ending with `to`.
    pub fn send(&self, from: u64, to: u64, payload: &'static [u8]) -> Result<Vec<PeerName>> {
        let ctx = FrameContext::default();
        let origin = self.node(from);
        let dst = origin.view_of(PeerName(to))?;
        origin
            .router
            .local_peer()
            .forward(&dst, false, Bytes::from_static(payload), &ctx)?;

        let mut visited = Vec::new();
        for _ in 0..=self.nodes.len() {
            let mut in_flight = self.take_frames();
            let Some((at, frame)) = in_flight.pop() else {
                bail!("frame from {from} to {to} was dropped after {visited:?}");
            };
            if !in_flight.is_empty() {
                bail!("unicast frame was duplicated");
            }
            visited.push(at);
            if at == PeerName(to) {
                return Ok(visited);
            }
            let node = &self.nodes[self.index(at)?];
            let src = node.view_of(frame.src_peer.name)?;
            let dst = node.view_of(frame.dst_peer.name)?;
            node.router
                .local_peer()
                .relay(&src, &dst, false, frame.frame, &ctx)?;
        }
        bail!("frame from {from} to {to} is looping: {visited:?}")
    }

    /// Drain every connection, returning (receiver, frame) pairs.
    fn take_frames(&self) -> Vec<(PeerName, trellis_router::ForwardedFrame)> {
        let mut frames = Vec::new();
        for ((_, to), conn) in &self.links {
            for (_, frame) in conn.take_forwarded() {
                frames.push((*to, frame));
            }
        }
        frames
    }
}

// ── Topologies ────────────────────────────────────────────────────────────────

pub async fn line(n: u64) -> Result<Net> {
    let mut net = Net::new(n);
    for a in 1..n {
        net.connect(a, a + 1).await?;
    }
    Ok(net)
}

pub async fn ring(n: u64) -> Result<Net> {
    let mut net = line(n).await?;
    net.connect(n, 1).await?;
    Ok(net)
}

/// A connected graph: a random spanning tree plus `extra` random edges.
pub async fn random_graph(n: u64, extra: usize, seed: u64) -> Result<Net> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut net = Net::new(n);
    let mut edges = std::collections::HashSet::new();
    for b in 2..=n {
        let a = rng.gen_range(1..b);
        edges.insert((a, b));
    }
    for _ in 0..extra {
        let a = rng.gen_range(1..=n);
        let b = rng.gen_range(1..=n);
        if a != b {
            edges.insert((a.min(b), a.max(b)));
        }
    }
    let mut edges: Vec<_> = edges.into_iter().collect();
    edges.sort();
    for (a, b) in edges {
        net.connect(a, b).await?;
    }
    Ok(net)
}
