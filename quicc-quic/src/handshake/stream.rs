//! Per-level CRYPTO stream buffers.
//!
//! The read side reassembles offset-addressed CRYPTO frames into the
//! contiguous byte stream the TLS machine consumes: gaps buffer, bytes are
//! never delivered out of order, and duplicates are dropped. The write side
//! queues TLS output and assigns it stream offsets as the packetizer drains
//! it into CRYPTO frames.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::error::{Error, Result, TransportErrorKind};

#[derive(Debug, Default)]
pub struct CryptoStream {
    // -- read side --
    chunks: BTreeMap<u64, Bytes>,
    read_offset: u64,
    buffered: usize,

    // -- write side --
    pending: VecDeque<Bytes>,
    /// Offset the next drained byte will carry on the wire.
    send_offset: u64,
}

/// Cap on buffered out-of-order bytes per level, matching the crypto buffer
/// limit a peer may rely on (RFC 9000 Section 7.5 leaves the bound to the
/// implementation).
const MAX_BUFFERED: usize = 64 * 1024;

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a received CRYPTO frame. Returns whether the bytes were new;
    /// fully-duplicate deliveries are dropped silently.
    pub fn insert(&mut self, offset: u64, mut data: Bytes) -> Result<bool> {
        let end = offset + data.len() as u64;
        if end <= self.read_offset || data.is_empty() {
            return Ok(false);
        }
        let mut offset = offset;
        if offset < self.read_offset {
            // Retransmission overlapping consumed bytes: trim the front.
            data = data.slice((self.read_offset - offset) as usize..);
            offset = self.read_offset;
        }
        if self.buffered + data.len() > MAX_BUFFERED {
            return Err(Error::transport(
                TransportErrorKind::Protocol,
                "crypto buffer exceeded",
            ));
        }
        // Keep the longer chunk on exact-offset duplicates.
        if let Some(existing) = self.chunks.get(&offset) {
            if existing.len() >= data.len() {
                return Ok(false);
            }
            self.buffered -= existing.len();
        }
        self.buffered += data.len();
        self.chunks.insert(offset, data);
        Ok(true)
    }

    /// Pop the next contiguous chunk, or `None` while a gap is in front.
    pub fn next_contiguous(&mut self) -> Option<Bytes> {
        loop {
            let (&offset, _) = self.chunks.iter().next()?;
            if offset > self.read_offset {
                return None;
            }
            let chunk = self.chunks.remove(&offset).unwrap();
            self.buffered -= chunk.len();
            let skip = (self.read_offset - offset) as usize;
            if skip >= chunk.len() {
                continue; // overlapped by an earlier delivery
            }
            let chunk = chunk.slice(skip..);
            self.read_offset += chunk.len() as u64;
            return Some(chunk);
        }
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Drop all reassembly state (used when an epoch's read keys go away).
    pub fn discard_read_state(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
    }

    // ------------------------------------------------------------------
    // write side
    // ------------------------------------------------------------------

    /// Queue TLS output for framing into CRYPTO frames.
    pub fn append_write(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.pending.push_back(data);
        }
    }

    pub fn has_pending_write(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain up to `max_len` bytes, returning the wire offset they carry.
    pub fn take_write_chunk(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        if max_len == 0 {
            return None;
        }
        let front = self.pending.front_mut()?;
        let offset = self.send_offset;
        let chunk = if front.len() <= max_len {
            self.pending.pop_front().unwrap()
        } else {
            front.split_to(max_len)
        };
        self.send_offset += chunk.len() as u64;
        Some((offset, chunk))
    }
}
