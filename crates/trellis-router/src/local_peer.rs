//! Our own peer, the only vertex whose connections change locally.
//!
//! All changes to our connection set go through a single actor task so
//! they are totally ordered. Frame forwarding reads the routing tables and
//! our connection map directly and never waits on the actor.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use trellis_core::{PeerName, PeerNameSet, RouterConfig};

use crate::connection::{Connection, ForwardedFrame, FrameContext, LocalConnection, TieBreak};
use crate::error::{ConnectionError, ForwardError};
use crate::gossip::{GossipSender, TopologyGossipData};
use crate::peer::Peer;
use crate::peers::Peers;
use crate::routes::{NextHop, Routes};

enum Command {
    AddConnection {
        conn: Arc<dyn LocalConnection>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    ConnectionEstablished {
        conn: Arc<dyn LocalConnection>,
    },
    DeleteConnection {
        conn: Arc<dyn LocalConnection>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to our own peer. Cheap to clone.
#[derive(Clone)]
pub struct LocalPeer {
    ourself: Arc<Peer>,
    peers: Arc<Peers>,
    routes: Routes,
    commands: mpsc::Sender<Command>,
}

impl LocalPeer {
    /// Create the handle and its actor. The actor must be spawned with
    /// [`LocalPeerActor::run`] before any connection changes complete.
    pub fn new(
        peers: Arc<Peers>,
        routes: Routes,
        gossip: Arc<dyn GossipSender>,
        config: &RouterConfig,
    ) -> (Self, LocalPeerActor) {
        let (tx, rx) = mpsc::channel(config.router.command_channel_size.max(1));
        let ourself = peers.ourself().clone();
        let actor = LocalPeerActor {
            ourself: ourself.clone(),
            peers: peers.clone(),
            routes: routes.clone(),
            gossip,
            conn_limit: config.router.conn_limit,
            gossip_interval: config.gossip_interval(),
            rx,
        };
        let handle = Self {
            ourself,
            peers,
            routes,
            commands: tx,
        };
        (handle, actor)
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.ourself
    }

    pub fn name(&self) -> PeerName {
        self.ourself.name
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub fn connection_count(&self) -> usize {
        self.ourself.connection_count()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.ourself.connections()
    }

    // ── Actor client API ─────────────────────────────────────────────────────

    /// Register an authenticated connection. Waits for the actor's verdict.
    pub async fn add_connection(&self, conn: Arc<dyn LocalConnection>) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddConnection { conn, reply })
            .await
            .map_err(|_| ConnectionError::ActorStopped)?;
        rx.await.map_err(|_| ConnectionError::ActorStopped)?
    }

    /// Report that a registered connection is now established. Does not
    /// wait for the actor to act on it.
    pub async fn connection_established(&self, conn: Arc<dyn LocalConnection>) {
        if self
            .commands
            .send(Command::ConnectionEstablished { conn })
            .await
            .is_err()
        {
            tracing::debug!(peer = %self.ourself, "actor stopped, dropping established notification");
        }
    }

    /// Remove a connection. Completes once the removal has been gossiped.
    pub async fn delete_connection(&self, conn: Arc<dyn LocalConnection>) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::DeleteConnection { conn, reply })
            .await
            .map_err(|_| ConnectionError::ActorStopped)?;
        rx.await.map_err(|_| ConnectionError::ActorStopped)
    }

    // ── Data plane ───────────────────────────────────────────────────────────

    /// Send a frame that originated here towards `dst`.
    pub fn forward(
        &self,
        dst: &Arc<Peer>,
        df: bool,
        frame: Bytes,
        ctx: &FrameContext,
    ) -> Result<(), ForwardError> {
        self.relay(&self.ourself, dst, df, frame, ctx)
    }

    pub fn broadcast(&self, df: bool, frame: Bytes, ctx: &FrameContext) {
        self.relay_broadcast(&self.ourself, df, frame, ctx);
    }

    /// Pass a frame from `src` one hop closer to `dst`.
    ///
    /// A missing route or relay connection is not an error: the topology
    /// may have changed while the frame was in flight.
    pub fn relay(
        &self,
        src: &Arc<Peer>,
        dst: &Arc<Peer>,
        df: bool,
        frame: Bytes,
        ctx: &FrameContext,
    ) -> Result<(), ForwardError> {
        let relay_name = match self.routes.unicast(dst.name) {
            Some(NextHop::Peer(name)) => name,
            Some(NextHop::Ourself) | None => {
                tracing::debug!(dst = %dst, "no route for frame destination, dropping");
                return Ok(());
            }
        };
        let Some(conn) = self.local_connection_to(relay_name) else {
            tracing::debug!(relay = %relay_name, "no connection to relay peer, dropping");
            return Ok(());
        };
        conn.forward(
            df,
            ForwardedFrame {
                src_peer: src.clone(),
                dst_peer: dst.clone(),
                frame,
            },
            ctx,
        )
    }

    /// Pass a broadcast frame from `src` on to our share of its broadcast
    /// tree.
    pub fn relay_broadcast(&self, src: &Arc<Peer>, df: bool, frame: Bytes, ctx: &FrameContext) {
        let next_hops = self.routes.broadcast(src.name);
        if next_hops.is_empty() {
            return;
        }
        for conn in self.connections_to(&next_hops) {
            let Some(remote) = conn.remote() else {
                continue;
            };
            let forwarded = ForwardedFrame {
                src_peer: src.clone(),
                dst_peer: remote.clone(),
                frame: frame.clone(),
            };
            match conn.forward(df, forwarded, ctx) {
                Ok(()) => {}
                Err(ForwardError::FrameTooBig { epmtu }) => {
                    tracing::info!(
                        src = ?ctx.src,
                        dst = ?ctx.dst,
                        epmtu,
                        "dropping too big DF broadcast frame"
                    );
                }
                Err(e) => {
                    tracing::warn!(peer = %remote, error = %e, "broadcast forward failed");
                }
            }
        }
    }

    /// Our local connections to `names`, skipping any we no longer have.
    pub fn connections_to(&self, names: &[PeerName]) -> Vec<Arc<dyn LocalConnection>> {
        names
            .iter()
            .filter_map(|&name| self.local_connection_to(name))
            .collect()
    }

    fn local_connection_to(&self, name: PeerName) -> Option<Arc<dyn LocalConnection>> {
        self.ourself
            .connection_to(name)
            .and_then(|conn| conn.as_local().cloned())
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

pub struct LocalPeerActor {
    ourself: Arc<Peer>,
    peers: Arc<Peers>,
    routes: Routes,
    gossip: Arc<dyn GossipSender>,
    conn_limit: usize,
    gossip_interval: Duration,
    rx: mpsc::Receiver<Command>,
}

impl LocalPeerActor {
    /// Process commands until every [`LocalPeer`] handle is gone. Also sends
    /// the full topology every gossip interval.
    pub async fn run(mut self) {
        tracing::info!(
            peer = %self.ourself,
            conn_limit = self.conn_limit,
            gossip_interval_secs = self.gossip_interval.as_secs(),
            "local peer started"
        );
        let mut gossip_timer = tokio::time::interval(self.gossip_interval);
        // The first tick fires immediately.
        gossip_timer.tick().await;

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.handle(cmd);
                }
                _ = gossip_timer.tick() => {
                    self.gossip.broadcast(TopologyGossipData::all(self.peers.clone()));
                }
            }
        }
        tracing::info!(peer = %self.ourself, "local peer stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddConnection { conn, reply } => {
                let result = self.handle_add_connection(conn);
                let _ = reply.send(result);
            }
            Command::ConnectionEstablished { conn } => {
                self.handle_connection_established(conn);
            }
            Command::DeleteConnection { conn, reply } => {
                self.handle_delete_connection(&conn);
                let _ = reply.send(());
            }
        }
    }

    fn handle_add_connection(&self, conn: Arc<dyn LocalConnection>) -> Result<(), ConnectionError> {
        let remote = self.checked_remote(conn.as_ref(), "add connection");
        let dup_err = ConnectionError::Duplicate {
            remote: remote.name,
            ourself: self.ourself.name,
        };

        // Asymmetric: the incoming connection is compared against the one we
        // already hold.
        if let Some(existing) = self.ourself.connection_to(remote.name) {
            if existing.is(&conn) {
                return Ok(());
            }
            let Some(existing) = existing.as_local().cloned() else {
                fatal(&self.ourself, "our own peer holds a gossiped connection");
            };
            let outcome = conn.break_tie(existing.as_ref());
            tracing::info!(peer = %remote, outcome = ?outcome, "duplicate connection");
            match outcome {
                TieBreak::Won => {
                    existing.shutdown(&dup_err);
                    self.handle_delete_connection(&existing);
                }
                TieBreak::Lost => return Err(dup_err),
                TieBreak::Tied => {
                    existing.shutdown(&dup_err);
                    self.handle_delete_connection(&existing);
                    return Err(dup_err);
                }
            }
        }

        if self.conn_limit != 0 && self.ourself.connection_count() >= self.conn_limit {
            tracing::warn!(peer = %remote, limit = self.conn_limit, "connection limit reached");
            return Err(ConnectionError::LimitReached(self.conn_limit));
        }

        let known = self.routes.unicast(remote.name).is_some();
        self.ourself
            .add_connection(remote.name, Connection::Local(conn.clone()));
        if known {
            tracing::info!(peer = %remote, addr = %conn.remote_tcp_addr(), "connection added");
        } else {
            tracing::info!(
                peer = %remote,
                addr = %conn.remote_tcp_addr(),
                "connection added (new peer)"
            );
            self.gossip
                .send_down(&conn, TopologyGossipData::all(self.peers.clone()));
        }
        self.broadcast_peer_update(&[remote.name]);
        Ok(())
    }

    fn handle_connection_established(&self, conn: Arc<dyn LocalConnection>) {
        let remote = self.checked_remote(conn.as_ref(), "mark connection established");
        let on_record = self
            .ourself
            .connection_to(remote.name)
            .is_some_and(|existing| existing.is(&conn));
        if !on_record {
            tracing::debug!(peer = %remote, "established notification for unknown connection");
            conn.shutdown(&ConnectionError::UnknownConnection);
            return;
        }
        self.ourself.connection_established();
        tracing::info!(peer = %remote, "connection fully established");
        self.broadcast_peer_update(&[]);
    }

    fn handle_delete_connection(&self, conn: &Arc<dyn LocalConnection>) {
        let remote = self.checked_remote(conn.as_ref(), "delete connection");
        let on_record = self
            .ourself
            .connection_to(remote.name)
            .is_some_and(|existing| existing.is(conn));
        if !on_record {
            return;
        }
        self.ourself.delete_connection(remote.name);
        tracing::info!(peer = %remote, "connection deleted");
        // Collect first so the update never names a peer we are dropping.
        self.peers.garbage_collect();
        self.broadcast_peer_update(&[]);
    }

    /// Recalculate routes and gossip ourself plus `names`.
    fn broadcast_peer_update(&self, names: &[PeerName]) {
        self.routes.recalculate();
        let mut update: PeerNameSet = names.iter().copied().collect();
        update.insert(self.ourself.name);
        self.gossip
            .broadcast(TopologyGossipData::new(self.peers.clone(), update));
    }

    /// The connection's remote end. A connection that is not ours or has no
    /// remote yet is a transport bug.
    fn checked_remote(&self, conn: &dyn LocalConnection, action: &str) -> Arc<Peer> {
        if !Arc::ptr_eq(&conn.local(), &self.ourself) {
            fatal(&self.ourself, &format!("{action}: we are not the source of the connection"));
        }
        match conn.remote() {
            Some(remote) => remote,
            None => fatal(&self.ourself, &format!("{action}: remote peer is unknown")),
        }
    }
}

fn fatal(ourself: &Peer, msg: &str) -> ! {
    tracing::error!(peer = %ourself, "{msg}");
    panic!("local peer {ourself}: {msg}");
}
