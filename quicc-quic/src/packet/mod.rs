//! Packet-level codec: headers, packet numbers, packet protection.
//!
//! The transport consumes this as a narrow interface: parse a header, open a
//! protected packet with the level's read keys, or seal frames into a packet
//! with the level's write keys.

pub mod header;
pub mod number;
pub mod protection;

pub use header::{parse_packet, Header, LongType, ParsedPacket};
pub use protection::{open_packet, seal_packet, OpenedPacket};

/// Smallest datagram a client may send while it includes an Initial packet
/// (RFC 9000 Section 14.1).
pub const MIN_INITIAL_DATAGRAM: usize = 1200;
