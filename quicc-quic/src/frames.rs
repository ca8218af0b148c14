//! The frame subset a client handshake needs (RFC 9000 Section 19).
//!
//! Stream and flow-control frames belong to the multiplexing layer and are
//! not parsed here; an unknown frame type in a handshake-epoch packet is a
//! protocol violation.

use bytes::Bytes;

use crate::error::{Error, Result, TransportErrorKind};
use crate::types::VarInt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding { len: usize },
    Ping,
    Ack {
        largest: u64,
        /// Raw ack-delay field; scaling by the exponent is the recovery
        /// collaborator's business.
        delay: u64,
        first_range: u64,
    },
    Crypto { offset: u64, data: Bytes },
    NewToken { token: Bytes },
    ConnectionClose {
        error_code: u64,
        /// `Some` for the transport variant (0x1c), `None` for the
        /// application variant (0x1d).
        frame_type: Option<u64>,
        reason: Bytes,
    },
    HandshakeDone,
}

impl Frame {
    /// Whether receipt of this frame obligates us to acknowledge the packet.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack { .. } | Frame::ConnectionClose { .. }
        )
    }
}

fn bad(msg: &'static str) -> Error {
    Error::transport(TransportErrorKind::Protocol, msg)
}

/// Sequential frame parser over one decrypted packet payload.
pub struct FrameParser<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> FrameParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn varint(&mut self) -> Result<u64> {
        let (val, used) =
            VarInt::decode(self.buf.get(self.at..).unwrap_or(&[])).ok_or(bad("frame truncated"))?;
        self.at += used;
        Ok(val)
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes> {
        let end = self.at.checked_add(len).ok_or(bad("frame truncated"))?;
        let slice = self.buf.get(self.at..end).ok_or(bad("frame truncated"))?;
        self.at = end;
        Ok(Bytes::copy_from_slice(slice))
    }

    /// Next frame, or `None` at end of payload.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.at >= self.buf.len() {
            return Ok(None);
        }
        let frame_type = self.varint()?;
        let frame = match frame_type {
            0x00 => {
                let mut len = 1;
                while self.buf.get(self.at) == Some(&0x00) {
                    self.at += 1;
                    len += 1;
                }
                Frame::Padding { len }
            }
            0x01 => Frame::Ping,
            0x02 | 0x03 => {
                let largest = self.varint()?;
                let delay = self.varint()?;
                let range_count = self.varint()?;
                let first_range = self.varint()?;
                for _ in 0..range_count {
                    self.varint()?; // gap
                    self.varint()?; // range length
                }
                if frame_type == 0x03 {
                    // ECN counts: ECT0, ECT1, CE
                    for _ in 0..3 {
                        self.varint()?;
                    }
                }
                Frame::Ack {
                    largest,
                    delay,
                    first_range,
                }
            }
            0x06 => {
                let offset = self.varint()?;
                let len = self.varint()? as usize;
                Frame::Crypto {
                    offset,
                    data: self.bytes(len)?,
                }
            }
            0x07 => {
                let len = self.varint()? as usize;
                if len == 0 {
                    return Err(bad("empty NEW_TOKEN"));
                }
                Frame::NewToken {
                    token: self.bytes(len)?,
                }
            }
            0x1c | 0x1d => {
                let error_code = self.varint()?;
                let inner_type = if frame_type == 0x1c {
                    Some(self.varint()?)
                } else {
                    None
                };
                let reason_len = self.varint()? as usize;
                Frame::ConnectionClose {
                    error_code,
                    frame_type: inner_type,
                    reason: self.bytes(reason_len)?,
                }
            }
            0x1e => Frame::HandshakeDone,
            _ => return Err(bad("unexpected frame type in handshake epoch")),
        };
        Ok(Some(frame))
    }
}

// ============================================================================
// Encoding
// ============================================================================

pub fn encode_ping(out: &mut Vec<u8>) {
    out.push(0x01);
}

pub fn encode_padding(out: &mut Vec<u8>, len: usize) {
    out.resize(out.len() + len, 0x00);
}

/// Single-range ACK acknowledging `largest` only.
pub fn encode_ack(largest: u64, delay: u64, out: &mut Vec<u8>) {
    out.push(0x02);
    VarInt::encode(largest, out);
    VarInt::encode(delay, out);
    VarInt::encode(0, out); // range count
    VarInt::encode(0, out); // first range
}

pub fn encode_crypto(offset: u64, data: &[u8], out: &mut Vec<u8>) {
    out.push(0x06);
    VarInt::encode(offset, out);
    VarInt::encode(data.len() as u64, out);
    out.extend_from_slice(data);
}

pub fn encode_connection_close(error_code: u64, reason: &[u8], out: &mut Vec<u8>) {
    out.push(0x1c);
    VarInt::encode(error_code, out);
    VarInt::encode(0, out); // offending frame type: unknown
    VarInt::encode(reason.len() as u64, out);
    out.extend_from_slice(reason);
}

/// Application-variant CONNECTION_CLOSE (0x1d).
pub fn encode_application_close(error_code: u64, reason: &[u8], out: &mut Vec<u8>) {
    out.push(0x1d);
    VarInt::encode(error_code, out);
    VarInt::encode(reason.len() as u64, out);
    out.extend_from_slice(reason);
}

/// Bytes `encode_crypto` will emit for a chunk of `data_len` at `offset`.
pub fn crypto_frame_overhead(offset: u64, data_len: usize) -> usize {
    1 + VarInt::size(offset) + VarInt::size(data_len as u64)
}
