//! trellis-router: the topology core of the overlay. Holds the peer graph
//! and its gossip merge, route computation, and the local peer actor.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod gossip;
pub mod local_peer;
pub mod peer;
pub mod peers;
pub mod router;
pub mod routes;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backoff::TieBackoff;
pub use connection::{
    Connection, ForwardedFrame, FrameContext, LocalConnection, RemoteConnection, TieBreak,
};
pub use error::{ConnectionError, ForwardError, TopologyError};
pub use gossip::{GossipSender, TopologyGossipData};
pub use local_peer::{LocalPeer, LocalPeerActor};
pub use peer::Peer;
pub use peers::Peers;
pub use router::Router;
pub use routes::{NextHop, RouteCalculator, RouteTables, Routes};
