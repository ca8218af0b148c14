//! Applying and removing packet protection (RFC 9001 Section 5.3, 5.4).
//!
//! `seal_packet` produces one finished packet from header bytes plus frames;
//! `open_packet` undoes header protection in place and decrypts the body.

use crate::crypto::backend::PacketProtection;
use crate::error::{Error, Result, TransportErrorKind};
use crate::packet::header::ParsedPacket;
use crate::packet::number;

/// The header-protection sample starts 4 bytes past the start of the packet
/// number field, regardless of the actual packet number length.
const SAMPLE_SKIP: usize = 4;

/// Seal `frames` into a packet. `header` holds everything up to the packet
/// number; the first byte must already carry the pn-length bits.
///
/// The caller pads frames so that `pn_len + frames.len() >= 4`, guaranteeing
/// enough ciphertext for the header-protection sample
/// (RFC 9001 Section 5.4.2).
pub fn seal_packet(
    mut header: Vec<u8>,
    pn: u64,
    pn_len: usize,
    frames: &[u8],
    prot: &PacketProtection,
) -> Result<Vec<u8>> {
    if pn_len + frames.len() < SAMPLE_SKIP {
        return Err(Error::InternalError("packet too short to sample"));
    }
    let pn_offset = header.len();
    number::encode_truncated(pn, pn_len, &mut header);

    let ciphertext = prot.aead.seal(pn, &header, frames)?;
    let mut packet = header;
    packet.extend_from_slice(&ciphertext);

    let sample_at = pn_offset + SAMPLE_SKIP;
    let mask = prot
        .header
        .mask(&packet[sample_at..sample_at + prot.header.sample_len()])?;

    let first_byte_mask = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
    packet[0] ^= mask[0] & first_byte_mask;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Ok(packet)
}

/// A decrypted packet body.
#[derive(Debug)]
pub struct OpenedPacket {
    pub packet_number: u64,
    pub payload: Vec<u8>,
}

/// Remove header protection in place and decrypt the packet located by
/// `parsed`. `largest_pn` is the largest packet number already received at
/// this level, used to recover the full number.
///
/// On failure the protected region may be left garbled; the caller drops the
/// datagram, it never retries with different keys.
pub fn open_packet(
    datagram: &mut [u8],
    parsed: &ParsedPacket,
    largest_pn: Option<u64>,
    prot: &PacketProtection,
) -> Result<OpenedPacket> {
    let sample_at = parsed.pn_offset + SAMPLE_SKIP;
    let sample_end = sample_at + prot.header.sample_len();
    if sample_end > parsed.end {
        return Err(Error::transport(
            TransportErrorKind::Protocol,
            "packet too short to sample",
        ));
    }
    let mask = prot.header.mask(&datagram[sample_at..sample_end])?;

    let first_byte_mask = if datagram[parsed.start] & 0x80 != 0 { 0x0f } else { 0x1f };
    datagram[parsed.start] ^= mask[0] & first_byte_mask;
    let pn_len = (datagram[parsed.start] & 0x03) as usize + 1;
    if parsed.pn_offset + pn_len > parsed.end {
        return Err(Error::transport(
            TransportErrorKind::Protocol,
            "packet number overruns payload",
        ));
    }

    let mut truncated = 0u64;
    for i in 0..pn_len {
        datagram[parsed.pn_offset + i] ^= mask[1 + i];
        truncated = (truncated << 8) | datagram[parsed.pn_offset + i] as u64;
    }
    let packet_number = number::decode(largest_pn, truncated, pn_len * 8);

    let (aad, rest) = datagram[parsed.start..parsed.end].split_at(parsed.pn_offset + pn_len - parsed.start);
    let payload = prot.aead.open(packet_number, aad, rest)?;
    Ok(OpenedPacket {
        packet_number,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rust_crypto::initial_packet_protection;
    use crate::packet::header::{encode_long_header, encode_short_header, parse_packet, LongType};
    use crate::types::{ConnectionId, KeyDirection, VERSION_1};

    fn pair() -> (PacketProtection, PacketProtection) {
        let cid = ConnectionId::from_slice(&[0xab; 8]).unwrap();
        (
            initial_packet_protection(&cid, VERSION_1, KeyDirection::Write).unwrap(),
            // The opposite end opens with the same direction's material.
            initial_packet_protection(&cid, VERSION_1, KeyDirection::Write).unwrap(),
        )
    }

    #[test]
    fn long_packet_roundtrip() {
        let (write, read) = pair();
        let dcid = ConnectionId::from_slice(&[0xab; 8]).unwrap();
        let scid = ConnectionId::from_slice(&[0xcd; 4]).unwrap();
        let frames = b"crypto frame bytes".to_vec();

        let pn_len = 2;
        let header = encode_long_header(
            LongType::Initial,
            VERSION_1,
            &dcid,
            &scid,
            b"",
            pn_len,
            frames.len() + write.aead.tag_len(),
        );
        let mut packet = seal_packet(header, 3, pn_len, &frames, &write).unwrap();

        let parsed = parse_packet(&packet, 0, 8).unwrap();
        let opened = open_packet(&mut packet, &parsed, Some(2), &read).unwrap();
        assert_eq!(opened.packet_number, 3);
        assert_eq!(opened.payload, frames);
    }

    #[test]
    fn short_packet_roundtrip() {
        let (write, read) = pair();
        let dcid = ConnectionId::from_slice(&[9; 8]).unwrap();
        let frames = b"one rtt payload".to_vec();

        let header = encode_short_header(&dcid, 1);
        let mut packet = seal_packet(header, 0, 1, &frames, &write).unwrap();
        // Header protection must have flipped pn-length bits or pn bytes with
        // overwhelming probability; just check the packet still parses.
        let parsed = parse_packet(&packet, 0, 8).unwrap();
        let opened = open_packet(&mut packet, &parsed, None, &read).unwrap();
        assert_eq!(opened.packet_number, 0);
        assert_eq!(opened.payload, frames);
    }

    #[test]
    fn wrong_keys_fail_open() {
        let (write, _) = pair();
        let other = initial_packet_protection(
            &ConnectionId::from_slice(&[0x11; 8]).unwrap(),
            VERSION_1,
            KeyDirection::Write,
        )
        .unwrap();

        let dcid = ConnectionId::from_slice(&[0xab; 8]).unwrap();
        let header = encode_short_header(&dcid, 1);
        let mut packet = seal_packet(header, 0, 1, b"payload!", &write).unwrap();
        let parsed = parse_packet(&packet, 0, 8).unwrap();
        assert!(open_packet(&mut packet, &parsed, None, &other).is_err());
    }

    #[test]
    fn undersized_payload_is_rejected_at_seal() {
        let (write, _) = pair();
        let dcid = ConnectionId::from_slice(&[9; 8]).unwrap();
        let header = encode_short_header(&dcid, 1);
        // 1-byte pn + 2 frame bytes < 4: not enough for the sample offset.
        assert!(seal_packet(header, 0, 1, b"ab", &write).is_err());
    }
}
