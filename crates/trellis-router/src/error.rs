//! Error types surfaced by the registry, the local peer actor and the
//! forwarding path.

use trellis_core::{PeerName, WireError};

/// A gossip update that cannot be merged. The update is rejected wholesale.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A connection in the update points at a peer we cannot resolve.
    #[error("update refers to unknown peer {0}")]
    UnknownPeer(PeerName),

    /// Two identities (different UIDs) claim the same name.
    #[error("peer name collision on {0}")]
    NameCollision(PeerName),

    #[error("malformed update: {0}")]
    Decode(#[from] WireError),
}

/// Why a local connection was refused or torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("multiple connections to {remote} added to {ourself}")]
    Duplicate { remote: PeerName, ourself: PeerName },

    #[error("connection limit reached ({0})")]
    LimitReached(usize),

    #[error("cannot set unknown connection active")]
    UnknownConnection,

    #[error("local peer actor has stopped")]
    ActorStopped,
}

/// Failure to push a frame onto a local connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    /// DF frame exceeds the path MTU. Dropped, not a connectivity failure.
    #[error("frame too big, effective PMTU is {epmtu}")]
    FrameTooBig { epmtu: usize },

    #[error("forwarding failed: {0}")]
    Failed(String),
}
