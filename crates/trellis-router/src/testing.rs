//! Fixtures for exercising the router without a transport.
//!
//! Available to this crate's unit tests and, with the `test-utils`
//! feature, to downstream test harnesses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use trellis_core::{PeerName, PeerNameSet};

use crate::connection::{
    Connection, ForwardedFrame, FrameContext, LocalConnection, RemoteConnection,
};
use crate::error::{ConnectionError, ForwardError};
use crate::gossip::{GossipSender, TopologyGossipData};
use crate::peer::Peer;

/// A peer named `n` with uid `n` and nick `n{n}`.
pub fn peer(n: u64) -> Arc<Peer> {
    Arc::new(Peer::new(PeerName(n), format!("n{n}"), n, 0))
}

/// A gossiped edge from `from` to `to`.
pub fn remote_conn(from: &Arc<Peer>, to: &Arc<Peer>, established: bool) -> Connection {
    Connection::Remote(Arc::new(RemoteConnection::new(
        from,
        to,
        format!("10.0.0.{}:6783", to.name.0),
        true,
        established,
    )))
}

/// One-way edge. Bumps `from`'s version.
pub fn half_link(from: &Arc<Peer>, to: &Arc<Peer>, established: bool) {
    from.add_connection(to.name, remote_conn(from, to, established));
}

/// Edges in both directions.
pub fn link(a: &Arc<Peer>, b: &Arc<Peer>, established: bool) {
    half_link(a, b, established);
    half_link(b, a, established);
}

// ── Mock transport ────────────────────────────────────────────────────────────

/// In-memory [`LocalConnection`] that records what is done to it.
pub struct MockConnection {
    local: Arc<Peer>,
    remote: Arc<Peer>,
    addr: String,
    outbound: bool,
    uid: u64,
    established: AtomicBool,
    mtu: Option<usize>,
    shutdowns: Mutex<Vec<ConnectionError>>,
    forwarded: Mutex<Vec<(bool, ForwardedFrame)>>,
}

impl MockConnection {
    pub fn new(local: &Arc<Peer>, remote: &Arc<Peer>, uid: u64) -> Arc<Self> {
        Self::build(local, remote, uid, None)
    }

    /// Refuses DF frames longer than `mtu`.
    pub fn with_mtu(local: &Arc<Peer>, remote: &Arc<Peer>, uid: u64, mtu: usize) -> Arc<Self> {
        Self::build(local, remote, uid, Some(mtu))
    }

    fn build(local: &Arc<Peer>, remote: &Arc<Peer>, uid: u64, mtu: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            local: local.clone(),
            remote: remote.clone(),
            addr: format!("10.0.0.{}:6783", remote.name.0),
            outbound: local.name < remote.name,
            uid,
            established: AtomicBool::new(false),
            mtu,
            shutdowns: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
        })
    }

    pub fn set_established(&self) {
        self.established.store(true, Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> Vec<ConnectionError> {
        self.shutdowns.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        !self.shutdowns.lock().is_empty()
    }

    /// Frames forwarded so far, with their DF flag.
    pub fn forwarded(&self) -> Vec<(bool, ForwardedFrame)> {
        self.forwarded.lock().clone()
    }

    /// Drain the forwarded frames.
    pub fn take_forwarded(&self) -> Vec<(bool, ForwardedFrame)> {
        std::mem::take(&mut *self.forwarded.lock())
    }

    pub fn forwarded_payloads(&self) -> Vec<Bytes> {
        self.forwarded.lock().iter().map(|(_, f)| f.frame.clone()).collect()
    }
}

impl LocalConnection for MockConnection {
    fn local(&self) -> Arc<Peer> {
        self.local.clone()
    }

    fn remote(&self) -> Option<Arc<Peer>> {
        Some(self.remote.clone())
    }

    fn remote_tcp_addr(&self) -> String {
        self.addr.clone()
    }

    fn outbound(&self) -> bool {
        self.outbound
    }

    fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn uid(&self) -> u64 {
        self.uid
    }

    fn forward(
        &self,
        df: bool,
        frame: ForwardedFrame,
        _ctx: &FrameContext,
    ) -> Result<(), ForwardError> {
        if let Some(mtu) = self.mtu {
            if df && frame.frame.len() > mtu {
                return Err(ForwardError::FrameTooBig { epmtu: mtu });
            }
        }
        self.forwarded.lock().push((df, frame));
        Ok(())
    }

    fn shutdown(&self, reason: &ConnectionError) {
        self.shutdowns.lock().push(reason.clone());
    }
}

// ── Recording gossip ──────────────────────────────────────────────────────────

/// [`GossipSender`] that keeps everything it is asked to send.
#[derive(Default)]
pub struct RecordingGossip {
    broadcasts: Mutex<Vec<TopologyGossipData>>,
    sent_down: Mutex<HashMap<PeerName, Vec<TopologyGossipData>>>,
}

impl RecordingGossip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broadcasts(&self) -> Vec<TopologyGossipData> {
        self.broadcasts.lock().clone()
    }

    /// Peer names carried by each broadcast, in order.
    pub fn broadcast_names(&self) -> Vec<PeerNameSet> {
        self.broadcasts
            .lock()
            .iter()
            .map(|data| data.names().clone())
            .collect()
    }

    /// Payloads sent down the connection to `remote`.
    pub fn sent_down_to(&self, remote: PeerName) -> Vec<TopologyGossipData> {
        self.sent_down.lock().get(&remote).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.broadcasts.lock().clear();
        self.sent_down.lock().clear();
    }
}

impl GossipSender for RecordingGossip {
    fn broadcast(&self, data: TopologyGossipData) {
        self.broadcasts.lock().push(data);
    }

    fn send_down(&self, conn: &Arc<dyn LocalConnection>, data: TopologyGossipData) {
        let Some(remote) = conn.remote() else {
            return;
        };
        self.sent_down.lock().entry(remote.name).or_default().push(data);
    }
}

/// Names of the peer records in an encoded update. Empty if malformed.
pub fn names_in(data: &[u8]) -> PeerNameSet {
    trellis_core::wire::decode_update(data)
        .map(|records| records.into_iter().map(|r| r.peer.name).collect())
        .unwrap_or_default()
}
