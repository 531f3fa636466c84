//! trellis-core: peer identifiers, the topology gossip wire format, and
//! router configuration. All other trellis crates depend on this one.

pub mod config;
pub mod name;
pub mod wire;

pub use config::RouterConfig;
pub use name::{PeerName, PeerNameSet, PeerUid};
pub use wire::{ConnectionSummary, PeerSummary, PeerUpdate, WireError};
