//! Topology gossip payloads and the outbound gossip seam.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use trellis_core::PeerNameSet;

use crate::connection::LocalConnection;
use crate::peers::Peers;

/// Outbound side of the gossip layer, provided by the embedder.
///
/// Implementations must not block: they are called from the local peer
/// actor and the gossip receive path.
pub trait GossipSender: Send + Sync {
    /// Spread `data` to the rest of the network.
    fn broadcast(&self, data: TopologyGossipData);

    /// Send `data` down a single connection only.
    fn send_down(&self, conn: &Arc<dyn LocalConnection>, data: TopologyGossipData);
}

/// A set of peers whose current state should be gossiped.
///
/// Only names are kept; the peers are encoded when the payload is actually
/// sent, so a payload that waits in a queue goes out with the latest
/// versions.
#[derive(Clone)]
pub struct TopologyGossipData {
    peers: Arc<Peers>,
    names: PeerNameSet,
}

impl TopologyGossipData {
    pub fn new(peers: Arc<Peers>, names: PeerNameSet) -> Self {
        Self { peers, names }
    }

    /// Every peer currently known.
    pub fn all(peers: Arc<Peers>) -> Self {
        let names = peers.names();
        Self { peers, names }
    }

    pub fn names(&self) -> &PeerNameSet {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        self.peers.encode_peers(&self.names)
    }

    /// Fold another pending payload into this one.
    pub fn merge(&mut self, other: &TopologyGossipData) {
        self.names.extend(other.names.iter().copied());
    }
}

impl fmt::Debug for TopologyGossipData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names.iter().collect();
        names.sort();
        f.debug_struct("TopologyGossipData").field("names", &names).finish()
    }
}
