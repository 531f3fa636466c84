//! Edges of the topology graph.
//!
//! A [`Connection`] is either backed by a live transport owned by this
//! process ([`LocalConnection`], implemented by the transport layer) or is a
//! link between two other peers that we only know about through gossip
//! ([`RemoteConnection`]).

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use trellis_core::ConnectionSummary;

use crate::error::{ConnectionError, ForwardError};
use crate::peer::Peer;

// ── Transport-backed connections ──────────────────────────────────────────────

/// Outcome of comparing two duplicate connections between the same pair of
/// peers. Both ends reach the same decision for the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    Won,
    Lost,
    Tied,
}

/// A frame on its way to `dst_peer`, originally sent by `src_peer`.
#[derive(Debug, Clone)]
pub struct ForwardedFrame {
    pub src_peer: Arc<Peer>,
    pub dst_peer: Arc<Peer>,
    pub frame: Bytes,
}

/// What the frame layer extracted from a frame. Only used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameContext {
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
}

/// A connection backed by a live transport.
pub trait LocalConnection: Send + Sync {
    /// The peer that owns this connection. Always our own peer.
    fn local(&self) -> Arc<Peer>;

    /// The authenticated remote peer, or `None` before the handshake is done.
    fn remote(&self) -> Option<Arc<Peer>>;

    fn remote_tcp_addr(&self) -> String;

    fn outbound(&self) -> bool;

    fn established(&self) -> bool;

    /// Identifier both ends agreed on during the handshake.
    fn uid(&self) -> u64;

    fn forward(
        &self,
        df: bool,
        frame: ForwardedFrame,
        ctx: &FrameContext,
    ) -> Result<(), ForwardError>;

    /// Tear the connection down. Must not block.
    fn shutdown(&self, reason: &ConnectionError);

    /// Decide which of two duplicate connections survives. The lower uid
    /// wins; since both ends see the same pair of uids, both agree.
    fn break_tie(&self, other: &dyn LocalConnection) -> TieBreak {
        match self.uid().cmp(&other.uid()) {
            Ordering::Less => TieBreak::Won,
            Ordering::Greater => TieBreak::Lost,
            Ordering::Equal => TieBreak::Tied,
        }
    }
}

/// Identity comparison for trait objects (data pointer only).
pub fn same_connection(a: &Arc<dyn LocalConnection>, b: &Arc<dyn LocalConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ── Gossiped connections ──────────────────────────────────────────────────────

/// A link between two peers asserted by gossip. Carries no transport.
///
/// Holds weak references to both ends; the registry owns peers, and strong
/// edges would keep collected peers alive through cycles.
pub struct RemoteConnection {
    local: Weak<Peer>,
    remote: Weak<Peer>,
    remote_tcp_addr: String,
    outbound: bool,
    established: bool,
}

impl RemoteConnection {
    pub fn new(
        local: &Arc<Peer>,
        remote: &Arc<Peer>,
        remote_tcp_addr: String,
        outbound: bool,
        established: bool,
    ) -> Self {
        Self {
            local: Arc::downgrade(local),
            remote: Arc::downgrade(remote),
            remote_tcp_addr,
            outbound,
            established,
        }
    }

    pub fn local(&self) -> Option<Arc<Peer>> {
        self.local.upgrade()
    }

    pub fn remote(&self) -> Option<Arc<Peer>> {
        self.remote.upgrade()
    }
}

// ── Either kind ───────────────────────────────────────────────────────────────

/// An entry in a peer's connection map.
#[derive(Clone)]
pub enum Connection {
    Local(Arc<dyn LocalConnection>),
    Remote(Arc<RemoteConnection>),
}

impl Connection {
    pub fn remote(&self) -> Option<Arc<Peer>> {
        match self {
            Connection::Local(c) => c.remote(),
            Connection::Remote(c) => c.remote(),
        }
    }

    pub fn remote_tcp_addr(&self) -> String {
        match self {
            Connection::Local(c) => c.remote_tcp_addr(),
            Connection::Remote(c) => c.remote_tcp_addr.clone(),
        }
    }

    pub fn outbound(&self) -> bool {
        match self {
            Connection::Local(c) => c.outbound(),
            Connection::Remote(c) => c.outbound,
        }
    }

    pub fn established(&self) -> bool {
        match self {
            Connection::Local(c) => c.established(),
            Connection::Remote(c) => c.established,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<dyn LocalConnection>> {
        match self {
            Connection::Local(c) => Some(c),
            Connection::Remote(_) => None,
        }
    }

    /// Is this entry exactly `conn` (same object, not just same remote)?
    pub fn is(&self, conn: &Arc<dyn LocalConnection>) -> bool {
        self.as_local().is_some_and(|c| same_connection(c, conn))
    }

    /// Gossip form of this link. `None` if the remote end is gone.
    pub(crate) fn summary(&self) -> Option<ConnectionSummary> {
        let remote = self.remote()?;
        Some(ConnectionSummary {
            remote: remote.name,
            remote_tcp_addr: self.remote_tcp_addr(),
            outbound: self.outbound(),
            established: self.established(),
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Connection::Local(_) => "local",
            Connection::Remote(_) => "remote",
        };
        match self.remote() {
            Some(remote) => write!(f, "{kind} -> {} [{}]", remote, self.remote_tcp_addr()),
            None => write!(f, "{kind} -> ? [{}]", self.remote_tcp_addr()),
        }
    }
}
