//! Topology gossip wire format.
//!
//! An update is a plain concatenation of peer records and is decoded until
//! the input runs out, so a receiver never needs to know the record count up
//! front. Each record is a fixed [`PeerHeader`], the peer's nickname, then
//! `conn_count` connection records, each a fixed [`ConnectionHeader`]
//! followed by the remote transport address.
//!
//! The fixed headers use zerocopy derives with big-endian integer types.
//! Every field is byte-aligned, so the layout has no padding and the sizes
//! below are exact. Changing anything here is a protocol change: bump
//! [`FORMAT_VERSION`].

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::name::{PeerName, PeerUid, PEER_NAME_LEN};

// ── Headers ───────────────────────────────────────────────────────────────────

/// Fixed part of a peer record.
///
/// Wire size: 29 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PeerHeader {
    /// Record format. Currently [`FORMAT_VERSION`].
    /// A receiver seeing an unknown format rejects the whole update.
    pub format: u8,

    /// Canonical binary [`PeerName`].
    pub name: [u8; PEER_NAME_LEN],

    pub uid: U64<BigEndian>,

    /// The peer's own topology version.
    pub version: U64<BigEndian>,

    /// Length of the UTF-8 nickname that follows this header.
    pub nick_len: U16<BigEndian>,

    /// Number of connection records that follow the nickname.
    pub conn_count: U16<BigEndian>,
}

assert_eq_size!(PeerHeader, [u8; 29]);

/// Fixed part of a connection record.
///
/// Wire size: 11 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ConnectionHeader {
    /// Canonical binary name of the remote end.
    pub remote: [u8; PEER_NAME_LEN],

    /// Bit flags:
    ///   bit 0: outbound (we dialled)
    ///   bit 1: established
    ///   bits 2-7: reserved, must be zero
    pub flags: u8,

    /// Length of the UTF-8 transport address that follows this header.
    pub addr_len: U16<BigEndian>,
}

assert_eq_size!(ConnectionHeader, [u8; 11]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current peer record format.
pub const FORMAT_VERSION: u8 = 0x01;

pub const FLAG_OUTBOUND: u8 = 0x01;
pub const FLAG_ESTABLISHED: u8 = 0x02;
const FLAGS_RESERVED: u8 = !(FLAG_OUTBOUND | FLAG_ESTABLISHED);

// ── Decoded form ──────────────────────────────────────────────────────────────

/// Identity and version of one peer in an update.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerSummary {
    pub name: PeerName,
    pub nick_name: String,
    pub uid: PeerUid,
    pub version: u64,
}

/// One link asserted by the peer that owns the enclosing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionSummary {
    pub remote: PeerName,
    pub remote_tcp_addr: String,
    pub outbound: bool,
    pub established: bool,
}

/// A peer record: the peer plus its full outbound connection set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub peer: PeerSummary,
    pub connections: Vec<ConnectionSummary>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing gossip updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {what}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown peer record format: 0x{0:02x}")]
    UnknownFormat(u8),

    #[error("reserved connection flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("{field} length {len} exceeds maximum {}", u16::MAX)]
    FieldTooLong { field: &'static str, len: usize },
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Append one peer record to `buf`. On error nothing is appended.
pub fn encode_peer(
    buf: &mut BytesMut,
    peer: &PeerSummary,
    connections: &[ConnectionSummary],
) -> Result<(), WireError> {
    let header = PeerHeader {
        format: FORMAT_VERSION,
        name: peer.name.to_bytes(),
        uid: U64::new(peer.uid),
        version: U64::new(peer.version),
        nick_len: U16::new(field_len("nickname", peer.nick_name.len())?),
        conn_count: U16::new(field_len("connection list", connections.len())?),
    };
    let conn_headers = connections
        .iter()
        .map(|conn| {
            let mut flags = 0u8;
            if conn.outbound {
                flags |= FLAG_OUTBOUND;
            }
            if conn.established {
                flags |= FLAG_ESTABLISHED;
            }
            Ok(ConnectionHeader {
                remote: conn.remote.to_bytes(),
                flags,
                addr_len: U16::new(field_len("address", conn.remote_tcp_addr.len())?),
            })
        })
        .collect::<Result<Vec<_>, WireError>>()?;

    buf.put_slice(header.as_bytes());
    buf.put_slice(peer.nick_name.as_bytes());
    for (conn, conn_header) in connections.iter().zip(&conn_headers) {
        buf.put_slice(conn_header.as_bytes());
        buf.put_slice(conn.remote_tcp_addr.as_bytes());
    }
    Ok(())
}

fn field_len(field: &'static str, len: usize) -> Result<u16, WireError> {
    u16::try_from(len).map_err(|_| WireError::FieldTooLong { field, len })
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode a whole update. Empty input is an empty update.
pub fn decode_update(mut input: &[u8]) -> Result<Vec<PeerUpdate>, WireError> {
    let mut records = Vec::new();
    while !input.is_empty() {
        records.push(decode_peer(&mut input)?);
    }
    Ok(records)
}

/// Decode one peer record from the front of `input`, advancing it.
pub fn decode_peer(input: &mut &[u8]) -> Result<PeerUpdate, WireError> {
    let header: PeerHeader = read_header(input, "peer header")?;
    if header.format != FORMAT_VERSION {
        return Err(WireError::UnknownFormat(header.format));
    }
    let nick_name = read_str(input, usize::from(header.nick_len.get()), "nickname")?;

    let count = usize::from(header.conn_count.get());
    let mut connections = Vec::with_capacity(count);
    for _ in 0..count {
        let conn: ConnectionHeader = read_header(input, "connection header")?;
        if conn.flags & FLAGS_RESERVED != 0 {
            return Err(WireError::ReservedFlagsSet(conn.flags));
        }
        let remote_tcp_addr = read_str(input, usize::from(conn.addr_len.get()), "address")?;
        connections.push(ConnectionSummary {
            remote: PeerName::from_bytes(conn.remote),
            remote_tcp_addr,
            outbound: conn.flags & FLAG_OUTBOUND != 0,
            established: conn.flags & FLAG_ESTABLISHED != 0,
        });
    }

    Ok(PeerUpdate {
        peer: PeerSummary {
            name: PeerName::from_bytes(header.name),
            nick_name,
            uid: header.uid.get(),
            version: header.version.get(),
        },
        connections,
    })
}

fn read_header<T: FromBytes>(input: &mut &[u8], what: &'static str) -> Result<T, WireError> {
    let needed = std::mem::size_of::<T>();
    let header = T::read_from_prefix(*input).ok_or(WireError::Truncated {
        what,
        needed,
        remaining: input.len(),
    })?;
    *input = &input[needed..];
    Ok(header)
}

fn read_str(input: &mut &[u8], len: usize, what: &'static str) -> Result<String, WireError> {
    if input.len() < len {
        return Err(WireError::Truncated {
            what,
            needed: len,
            remaining: input.len(),
        });
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    String::from_utf8(head.to_vec()).map_err(|_| WireError::InvalidUtf8(what))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
