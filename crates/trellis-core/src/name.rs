//! Peer identity: stable names and per-process UIDs.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Width of the canonical binary form of a [`PeerName`].
pub const PEER_NAME_LEN: usize = 8;

/// Stable identifier of a peer. Survives reconnects and restarts.
///
/// Names are usually derived from a MAC address, so the common case only
/// uses the low 48 bits and is displayed MAC style.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerName(pub u64);

/// Random value picked once per process. Distinguishes a restarted peer
/// from its previous incarnation under the same name.
pub type PeerUid = u64;

/// A set of peer names, as exchanged between the registry and gossip.
pub type PeerNameSet = HashSet<PeerName>;

impl PeerName {
    /// Canonical fixed-width wire form (big-endian).
    pub fn to_bytes(self) -> [u8; PEER_NAME_LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; PEER_NAME_LEN]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for PeerName {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        // Names that fit in 48 bits print like a MAC address.
        let start = if self.0 >> 48 == 0 { 2 } else { 0 };
        for (i, byte) in bytes[start..].iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({})", self)
    }
}

/// Error parsing a [`PeerName`] from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer name: {0:?}")]
pub struct ParsePeerNameError(pub String);

impl FromStr for PeerName {
    type Err = ParsePeerNameError;

    /// Accepts 6 or 8 colon-separated hex octets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeerNameError(s.to_string());
        let octets: Vec<&str> = s.split(':').collect();
        if octets.len() != 6 && octets.len() != PEER_NAME_LEN {
            return Err(err());
        }
        let mut value = 0u64;
        for octet in octets {
            if octet.len() != 2 {
                return Err(err());
            }
            let byte = u8::from_str_radix(octet, 16).map_err(|_| err())?;
            value = (value << 8) | u64::from(byte);
        }
        Ok(Self(value))
    }
}
