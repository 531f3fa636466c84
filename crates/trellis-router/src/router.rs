//! Top-level wiring: one registry, one set of routes and one local peer
//! per process, plus the inbound gossip path.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use trellis_core::{PeerName, PeerNameSet, PeerUid, RouterConfig};

use crate::connection::LocalConnection;
use crate::error::TopologyError;
use crate::gossip::{GossipSender, TopologyGossipData};
use crate::local_peer::{LocalPeer, LocalPeerActor};
use crate::peer::Peer;
use crate::peers::Peers;
use crate::routes::{RouteCalculator, Routes};

pub struct Router {
    config: RouterConfig,
    peers: Arc<Peers>,
    routes: Routes,
    local: LocalPeer,
    gossip: Arc<dyn GossipSender>,
    workers: Mutex<Option<(RouteCalculator, LocalPeerActor)>>,
}

impl Router {
    /// Create a router for `name` with a fresh random UID.
    pub fn new(config: RouterConfig, name: PeerName, gossip: Arc<dyn GossipSender>) -> Self {
        Self::with_identity(config, name, rand::random(), gossip)
    }

    pub fn with_identity(
        config: RouterConfig,
        name: PeerName,
        uid: PeerUid,
        gossip: Arc<dyn GossipSender>,
    ) -> Self {
        let ourself = Arc::new(Peer::new(name, config.router.nick_name.clone(), uid, 0));
        let peers = Arc::new(Peers::new(ourself.clone()));
        let (routes, calculator) = Routes::new(ourself, peers.clone());
        let (local, actor) = LocalPeer::new(peers.clone(), routes.clone(), gossip.clone(), &config);
        Self {
            config,
            peers,
            routes,
            local,
            gossip,
            workers: Mutex::new(Some((calculator, actor))),
        }
    }

    /// Spawn the route calculator and the local peer actor. Returns no
    /// handles if already started.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let Some((calculator, actor)) = self.workers.lock().take() else {
            tracing::warn!(peer = %self.ourself(), "router already started");
            return Vec::new();
        };
        tracing::info!(peer = %self.ourself(), uid = self.ourself().uid, "router starting");
        vec![tokio::spawn(calculator.run()), tokio::spawn(actor.run())]
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn ourself(&self) -> &Arc<Peer> {
        self.peers.ourself()
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local
    }

    // ── Inbound gossip ───────────────────────────────────────────────────────

    /// Merge an update received point-to-point. Returns what should be
    /// passed on: the peers that actually changed.
    pub fn on_gossip(&self, update: &[u8]) -> Result<Option<TopologyGossipData>, TopologyError> {
        let (_, improved) = self.apply_topology_update(update)?;
        if improved.is_empty() {
            return Ok(None);
        }
        Ok(Some(TopologyGossipData::new(self.peers.clone(), improved)))
    }

    /// Merge an update received by broadcast. Broadcasts are relayed as
    /// received, so this returns every peer the update mentioned.
    pub fn on_gossip_broadcast(
        &self,
        update: &[u8],
    ) -> Result<Option<TopologyGossipData>, TopologyError> {
        let (received, _) = self.apply_topology_update(update)?;
        if received.is_empty() {
            return Ok(None);
        }
        Ok(Some(TopologyGossipData::new(self.peers.clone(), received)))
    }

    fn apply_topology_update(
        &self,
        update: &[u8],
    ) -> Result<(PeerNameSet, PeerNameSet), TopologyError> {
        match self.peers.apply_update(update) {
            Ok((received, improved)) => {
                if !improved.is_empty() {
                    self.routes.recalculate();
                }
                Ok((received, improved))
            }
            Err(e @ TopologyError::UnknownPeer(_)) => {
                // The sender is missing part of the picture; give it ours.
                tracing::debug!(error = %e, "update names an unknown peer, sending full topology");
                self.send_all_gossip();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejected topology update");
                Err(e)
            }
        }
    }

    // ── Outbound gossip ──────────────────────────────────────────────────────

    pub fn send_all_gossip(&self) {
        self.gossip
            .broadcast(TopologyGossipData::all(self.peers.clone()));
    }

    pub fn send_all_gossip_down(&self, conn: &Arc<dyn LocalConnection>) {
        self.gossip
            .send_down(conn, TopologyGossipData::all(self.peers.clone()));
    }
}
