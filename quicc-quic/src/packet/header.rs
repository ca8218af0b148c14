//! Packet header parsing and serialization (RFC 9000 Section 17, RFC 8999).
//!
//! Headers are a closed tagged sum: long form (with a type subfield), short
//! form, plus the two special shapes the client must recognize before any
//! decryption, Version Negotiation and Retry.

use bytes::Bytes;

use crate::error::{Error, Result, TransportErrorKind};
use crate::types::{ConnectionId, EncryptionLevel, VarInt, VERSION_NEGOTIATION};

/// Retry packets end in a 16-byte integrity tag (RFC 9001 Section 5.8).
const RETRY_TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
}

#[derive(Debug, Clone)]
pub enum Header {
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Address-validation token; only ever non-empty for Initial.
        token: Bytes,
    },
    Short {
        dcid: ConnectionId,
    },
    Retry {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
    },
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        supported: Vec<u32>,
    },
}

impl Header {
    /// The epoch whose keys protect this packet, if it carries one.
    pub fn encryption_level(&self) -> Option<EncryptionLevel> {
        match self {
            Header::Long { ty: LongType::Initial, .. } => Some(EncryptionLevel::Initial),
            Header::Long { ty: LongType::ZeroRtt, .. } => Some(EncryptionLevel::ZeroRtt),
            Header::Long { ty: LongType::Handshake, .. } => Some(EncryptionLevel::Handshake),
            Header::Short { .. } => Some(EncryptionLevel::OneRtt),
            Header::Retry { .. } | Header::VersionNegotiation { .. } => None,
        }
    }

    /// Peer-chosen source connection id, absent on short headers.
    pub fn scid(&self) -> Option<&ConnectionId> {
        match self {
            Header::Long { scid, .. }
            | Header::Retry { scid, .. }
            | Header::VersionNegotiation { scid, .. } => Some(scid),
            Header::Short { .. } => None,
        }
    }
}

/// One packet located inside a (possibly coalesced) datagram.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: Header,
    /// Offset of the packet's first byte within the datagram.
    pub start: usize,
    /// Offset of the still-protected packet number field.
    pub pn_offset: usize,
    /// End of this packet; the next coalesced packet starts here.
    pub end: usize,
}

fn bad(msg: &'static str) -> Error {
    Error::transport(TransportErrorKind::Protocol, msg)
}

fn read_u8(buf: &[u8], at: &mut usize) -> Result<u8> {
    let b = *buf.get(*at).ok_or(bad("packet truncated"))?;
    *at += 1;
    Ok(b)
}

fn read_cid(buf: &[u8], at: &mut usize) -> Result<ConnectionId> {
    let len = read_u8(buf, at)? as usize;
    if len > ConnectionId::MAX_LEN {
        return Err(bad("connection id too long"));
    }
    let end = at.checked_add(len).ok_or(bad("packet truncated"))?;
    let slice = buf.get(*at..end).ok_or(bad("packet truncated"))?;
    *at = end;
    ConnectionId::from_slice(slice)
}

fn read_varint(buf: &[u8], at: &mut usize) -> Result<u64> {
    let (val, used) =
        VarInt::decode(buf.get(*at..).unwrap_or(&[])).ok_or(bad("packet truncated"))?;
    *at += used;
    Ok(val)
}

/// Parse the packet starting at `start`. Short headers need the length of
/// our own connection id, since the wire does not carry it.
pub fn parse_packet(datagram: &[u8], start: usize, short_dcid_len: usize) -> Result<ParsedPacket> {
    let mut at = start;
    let first = read_u8(datagram, &mut at)?;

    if first & 0x80 == 0 {
        // Short header: flags, dcid, protected packet number, payload to the
        // end of the datagram. Short packets are never followed by another.
        let end = start
            .checked_add(1 + short_dcid_len)
            .filter(|&pn| pn <= datagram.len())
            .ok_or(bad("short header truncated"))?;
        let dcid = ConnectionId::from_slice(&datagram[start + 1..end])?;
        return Ok(ParsedPacket {
            header: Header::Short { dcid },
            start,
            pn_offset: end,
            end: datagram.len(),
        });
    }

    let version = u32::from_be_bytes(
        datagram
            .get(at..at + 4)
            .ok_or(bad("long header truncated"))?
            .try_into()
            .unwrap(),
    );
    at += 4;

    let dcid = read_cid(datagram, &mut at)?;
    let scid = read_cid(datagram, &mut at)?;

    if version == VERSION_NEGOTIATION {
        let rest = &datagram[at..];
        if rest.is_empty() || rest.len() % 4 != 0 {
            return Err(bad("malformed version negotiation body"));
        }
        let supported = rest
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        return Ok(ParsedPacket {
            header: Header::VersionNegotiation { dcid, scid, supported },
            start,
            pn_offset: datagram.len(),
            end: datagram.len(),
        });
    }

    let ty = match (first & 0x30) >> 4 {
        0x0 => LongType::Initial,
        0x1 => LongType::ZeroRtt,
        0x2 => LongType::Handshake,
        _ => {
            // Retry: token runs to the integrity tag at the end.
            let rest = &datagram[at..];
            if rest.len() < RETRY_TAG_LEN {
                return Err(bad("retry packet too short"));
            }
            let token = Bytes::copy_from_slice(&rest[..rest.len() - RETRY_TAG_LEN]);
            return Ok(ParsedPacket {
                header: Header::Retry { version, dcid, scid, token },
                start,
                pn_offset: datagram.len(),
                end: datagram.len(),
            });
        }
    };

    let token = if ty == LongType::Initial {
        let token_len = read_varint(datagram, &mut at)? as usize;
        let end = at.checked_add(token_len).ok_or(bad("token truncated"))?;
        let token = datagram.get(at..end).ok_or(bad("token truncated"))?;
        at = end;
        Bytes::copy_from_slice(token)
    } else {
        Bytes::new()
    };

    // Length covers packet number plus payload (RFC 9000 Section 17.2).
    let length = read_varint(datagram, &mut at)? as usize;
    let end = at.checked_add(length).ok_or(bad("payload length overflow"))?;
    if end > datagram.len() {
        return Err(bad("payload length exceeds datagram"));
    }

    Ok(ParsedPacket {
        header: Header::Long { ty, version, dcid, scid, token },
        start,
        pn_offset: at,
        end,
    })
}

/// Serialize a long header up to (not including) the packet number, with the
/// length field covering `pn_len + payload_and_tag_len`.
pub fn encode_long_header(
    ty: LongType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn_len: usize,
    payload_and_tag_len: usize,
) -> Vec<u8> {
    let type_bits = match ty {
        LongType::Initial => 0x00,
        LongType::ZeroRtt => 0x10,
        LongType::Handshake => 0x20,
    };
    let mut out = Vec::with_capacity(64);
    out.push(0x80 | 0x40 | type_bits | (pn_len as u8 - 1));
    out.extend_from_slice(&version.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_bytes());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_bytes());
    if ty == LongType::Initial {
        VarInt::encode(token.len() as u64, &mut out);
        out.extend_from_slice(token);
    } else {
        debug_assert!(token.is_empty());
    }
    VarInt::encode((pn_len + payload_and_tag_len) as u64, &mut out);
    out
}

/// Serialize a short header up to (not including) the packet number.
pub fn encode_short_header(dcid: &ConnectionId, pn_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + dcid.len());
    out.push(0x40 | (pn_len as u8 - 1));
    out.extend_from_slice(dcid.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VERSION_1;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn parse_initial_long_header() {
        let mut datagram =
            encode_long_header(LongType::Initial, VERSION_1, &cid(&[1; 8]), &cid(&[2; 4]), b"tok", 2, 30);
        let pn_offset = datagram.len();
        datagram.extend_from_slice(&[0u8; 32]); // pn + payload placeholder

        let parsed = parse_packet(&datagram, 0, 8).unwrap();
        assert_eq!(parsed.pn_offset, pn_offset);
        assert_eq!(parsed.end, pn_offset + 32);
        match parsed.header {
            Header::Long { ty, version, dcid, scid, token } => {
                assert_eq!(ty, LongType::Initial);
                assert_eq!(version, VERSION_1);
                assert_eq!(dcid.as_bytes(), &[1; 8]);
                assert_eq!(scid.as_bytes(), &[2; 4]);
                assert_eq!(&token[..], b"tok");
            }
            other => panic!("expected initial header, got {other:?}"),
        }
    }

    #[test]
    fn parse_short_header() {
        let mut datagram = encode_short_header(&cid(&[7; 8]), 1);
        datagram.extend_from_slice(&[0u8; 24]);
        let parsed = parse_packet(&datagram, 0, 8).unwrap();
        assert_eq!(parsed.pn_offset, 9);
        assert_eq!(parsed.end, datagram.len());
        assert_eq!(parsed.header.encryption_level(), Some(EncryptionLevel::OneRtt));
    }

    #[test]
    fn parse_version_negotiation() {
        let mut datagram = vec![0x80, 0, 0, 0, 0];
        datagram.push(4);
        datagram.extend_from_slice(&[1; 4]);
        datagram.push(0);
        datagram.extend_from_slice(&0x6b3343cfu32.to_be_bytes());
        datagram.extend_from_slice(&2u32.to_be_bytes());

        let parsed = parse_packet(&datagram, 0, 4).unwrap();
        match &parsed.header {
            Header::VersionNegotiation { supported, .. } => {
                assert_eq!(supported, &vec![0x6b3343cf, 2]);
            }
            other => panic!("expected version negotiation, got {other:?}"),
        }
        assert!(parsed.header.encryption_level().is_none());
    }

    #[test]
    fn parse_retry_extracts_token() {
        let mut datagram = vec![0xf0];
        datagram.extend_from_slice(&VERSION_1.to_be_bytes());
        datagram.push(0); // dcid
        datagram.push(3); // scid
        datagram.extend_from_slice(&[9, 9, 9]);
        datagram.extend_from_slice(b"retry-token");
        datagram.extend_from_slice(&[0u8; 16]); // integrity tag

        let parsed = parse_packet(&datagram, 0, 8).unwrap();
        match parsed.header {
            Header::Retry { token, scid, .. } => {
                assert_eq!(&token[..], b"retry-token");
                assert_eq!(scid.as_bytes(), &[9, 9, 9]);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn length_exceeding_datagram_is_rejected() {
        let datagram =
            encode_long_header(LongType::Handshake, VERSION_1, &cid(&[1; 8]), &cid(&[2; 4]), b"", 1, 500);
        assert!(parse_packet(&datagram, 0, 8).is_err());
    }

    #[test]
    fn coalesced_packet_offsets() {
        let mut datagram =
            encode_long_header(LongType::Initial, VERSION_1, &cid(&[1; 8]), &cid(&[2; 4]), b"", 1, 20);
        datagram.extend_from_slice(&[0u8; 21]);
        let second_start = datagram.len();
        datagram.extend(encode_long_header(
            LongType::Handshake,
            VERSION_1,
            &cid(&[1; 8]),
            &cid(&[2; 4]),
            b"",
            1,
            10,
        ));
        datagram.extend_from_slice(&[0u8; 11]);

        let first = parse_packet(&datagram, 0, 8).unwrap();
        assert_eq!(first.end, second_start);
        let second = parse_packet(&datagram, first.end, 8).unwrap();
        assert_eq!(second.end, datagram.len());
        assert_eq!(
            second.header.encryption_level(),
            Some(EncryptionLevel::Handshake)
        );
    }
}
