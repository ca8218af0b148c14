//! Transport parameter encoding and decoding (RFC 9000 Section 18).
//!
//! The client encodes its parameters into the TLS ClientHello extension and
//! decodes the server's from EncryptedExtensions. The subset the client
//! caches for resumption is split out as [`ServerTransportParameters`].

use bytes::Buf;

use crate::error::{Error, Result, TransportErrorKind};
use crate::types::{ConnectionId, VarInt};

/// Parameter ids at or above this value are reserved for private use by the
/// embedding application and pass through encoding untouched.
pub const CUSTOM_TRANSPORT_PARAM_THRESHOLD: u64 = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    pub max_idle_timeout: u64, // milliseconds
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64, // milliseconds
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    /// Private-use parameters, each with id >= [`CUSTOM_TRANSPORT_PARAM_THRESHOLD`].
    pub custom: Vec<(u64, Vec<u8>)>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            custom: Vec::new(),
        }
    }
}

fn write_param(out: &mut Vec<u8>, id: u64, val: &[u8]) {
    VarInt::encode(id, out);
    VarInt::encode(val.len() as u64, out);
    out.extend_from_slice(val);
}

fn write_varint_param(out: &mut Vec<u8>, id: u64, val: u64) {
    // Parameters at their protocol default are omitted.
    match id {
        0x01 if val == 0 => return,
        0x03 if val == 65527 => return,
        0x04..=0x09 if val == 0 => return,
        0x0a if val == 3 => return,
        0x0b if val == 25 => return,
        0x0e if val == 2 => return,
        _ => {}
    }
    let mut tmp = Vec::with_capacity(8);
    VarInt::encode(val, &mut tmp);
    write_param(out, id, &tmp);
}

impl TransportParameters {
    /// Serialize into the TLS extension body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(cid) = &self.original_destination_connection_id {
            write_param(&mut out, 0x00, cid.as_bytes());
        }
        write_varint_param(&mut out, 0x01, self.max_idle_timeout);
        write_varint_param(&mut out, 0x03, self.max_udp_payload_size);
        write_varint_param(&mut out, 0x04, self.initial_max_data);
        write_varint_param(&mut out, 0x05, self.initial_max_stream_data_bidi_local);
        write_varint_param(&mut out, 0x06, self.initial_max_stream_data_bidi_remote);
        write_varint_param(&mut out, 0x07, self.initial_max_stream_data_uni);
        write_varint_param(&mut out, 0x08, self.initial_max_streams_bidi);
        write_varint_param(&mut out, 0x09, self.initial_max_streams_uni);
        write_varint_param(&mut out, 0x0a, self.ack_delay_exponent);
        write_varint_param(&mut out, 0x0b, self.max_ack_delay);
        if self.disable_active_migration {
            write_param(&mut out, 0x0c, &[]);
        }
        write_varint_param(&mut out, 0x0e, self.active_connection_id_limit);
        if let Some(cid) = &self.initial_source_connection_id {
            write_param(&mut out, 0x0f, cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            write_param(&mut out, 0x10, cid.as_bytes());
        }
        for (id, val) in &self.custom {
            debug_assert!(*id >= CUSTOM_TRANSPORT_PARAM_THRESHOLD);
            write_param(&mut out, *id, val);
        }
        out
    }

    /// Parse the TLS extension body. Unknown parameter ids are skipped.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        fn read_varint(buf: &mut &[u8]) -> Result<u64> {
            let (val, used) = VarInt::decode(buf).ok_or(Error::transport(
                TransportErrorKind::Protocol,
                "truncated transport parameter varint",
            ))?;
            buf.advance(used);
            Ok(val)
        }

        fn value_varint(val: &[u8]) -> Result<u64> {
            match VarInt::decode(val) {
                Some((v, used)) if used == val.len() => Ok(v),
                _ => Err(Error::transport(
                    TransportErrorKind::Protocol,
                    "malformed transport parameter value",
                )),
            }
        }

        fn value_cid(val: &[u8]) -> Result<ConnectionId> {
            ConnectionId::from_slice(val).map_err(|_| {
                Error::transport(TransportErrorKind::Protocol, "transport parameter cid too long")
            })
        }

        let mut params = Self::default();
        while !buf.is_empty() {
            let id = read_varint(&mut buf)?;
            let len = read_varint(&mut buf)? as usize;
            if buf.len() < len {
                return Err(Error::transport(
                    TransportErrorKind::Protocol,
                    "transport parameter value truncated",
                ));
            }
            let val = &buf[..len];
            buf.advance(len);

            match id {
                0x00 => params.original_destination_connection_id = Some(value_cid(val)?),
                0x01 => params.max_idle_timeout = value_varint(val)?,
                0x03 => params.max_udp_payload_size = value_varint(val)?,
                0x04 => params.initial_max_data = value_varint(val)?,
                0x05 => params.initial_max_stream_data_bidi_local = value_varint(val)?,
                0x06 => params.initial_max_stream_data_bidi_remote = value_varint(val)?,
                0x07 => params.initial_max_stream_data_uni = value_varint(val)?,
                0x08 => params.initial_max_streams_bidi = value_varint(val)?,
                0x09 => params.initial_max_streams_uni = value_varint(val)?,
                0x0a => params.ack_delay_exponent = value_varint(val)?,
                0x0b => params.max_ack_delay = value_varint(val)?,
                0x0c => params.disable_active_migration = true,
                0x0e => params.active_connection_id_limit = value_varint(val)?,
                0x0f => params.initial_source_connection_id = Some(value_cid(val)?),
                0x10 => params.retry_source_connection_id = Some(value_cid(val)?),
                id if id >= CUSTOM_TRANSPORT_PARAM_THRESHOLD => {
                    params.custom.push((id, val.to_vec()));
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

/// The server-advertised limits the client caches alongside a PSK so a
/// resumed connection can open 0-RTT streams under last session's budget.
///
/// Written exactly once, when the handshake surfaces the server parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
}

impl From<&TransportParameters> for ServerTransportParameters {
    fn from(p: &TransportParameters) -> Self {
        Self {
            initial_max_data: p.initial_max_data,
            initial_max_stream_data_bidi_local: p.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: p.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: p.initial_max_stream_data_uni,
            initial_max_streams_bidi: p.initial_max_streams_bidi,
            initial_max_streams_uni: p.initial_max_streams_uni,
        }
    }
}
