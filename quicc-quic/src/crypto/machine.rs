//! The TLS 1.3 client state machine interface.
//!
//! The driver does not embed a specific TLS stack. It drives any
//! [`TlsMachine`] and consumes the ordered action list each cycle produces.
//! Actions are a closed tagged sum, matched exhaustively in the driver's
//! dispatch method. State mutation is internal to the machine (`&mut self`),
//! so there is no separate mutate-state action.

use bytes::Bytes;

use crate::transport::ServerTransportParameters;
use crate::types::{EncryptionLevel, KeyDirection};

/// A pre-shared key plus everything cached from the previous connection to
/// the same server: the flow-control limits needed to open 0-RTT streams and
/// any address-validation token the server handed out via NEW_TOKEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionRecord {
    /// Opaque ticket bytes presented back as the PSK identity.
    pub psk_identity: Vec<u8>,
    /// The resumption PSK derived from the session that issued the ticket.
    pub secret: Vec<u8>,
    pub cipher_suite: u16,
    pub alpn: Option<Vec<u8>>,
    pub server_params: ServerTransportParameters,
    pub token: Option<Vec<u8>>,
    /// Largest amount of 0-RTT data the ticket permits; 0 disables 0-RTT.
    pub max_early_data: u32,
    /// Obfuscation offset added to the ticket age on the wire.
    pub age_add: u32,
    /// Wall-clock issue time (unix milliseconds) for the ticket age.
    pub issued_at_unix_ms: u64,
}

/// Inputs to [`TlsMachine::start`].
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Server name for certificate validation and PSK lookup.
    pub hostname: Option<String>,
    /// Cached PSK; presence unlocks a 0-RTT attempt.
    pub cached_psk: Option<ResumptionRecord>,
    /// Encoded local transport parameters for the quic extension.
    pub transport_params: Vec<u8>,
    /// Offered application protocols, in preference order.
    pub alpn: Vec<Vec<u8>>,
}

/// One step of the TLS client machine, in emission order.
#[derive(Debug, Clone)]
pub enum TlsAction {
    /// Post-handshake application data arrived inside the TLS stream.
    DeliverAppData(Bytes),
    /// Handshake bytes to frame into CRYPTO at the given level.
    WriteToSocket {
        level: EncryptionLevel,
        data: Bytes,
    },
    /// The early secret is usable; 0-RTT writes may begin.
    ReportEarlyHandshakeSuccess,
    /// Handshake completed; 1-RTT secrets follow (or preceded) this action.
    ReportHandshakeSuccess {
        /// Whether the server accepted early data, when it was attempted.
        early_data_accepted: bool,
    },
    /// Early data could not be written; content must be replayed at 1-RTT.
    ReportEarlyWriteFailed,
    /// Fatal TLS failure. The connection is unusable afterwards.
    ReportError(String),
    /// The machine needs more input before it can make progress.
    WaitForData,
    /// The server issued a resumption ticket worth persisting.
    NewCachedPsk(ResumptionRecord),
    /// A traffic secret for (level, direction) became available.
    SecretAvailable {
        level: EncryptionLevel,
        direction: KeyDirection,
        cipher_suite: u16,
        secret: Vec<u8>,
    },
}

/// A TLS 1.3 client state machine speaking through per-level byte streams.
///
/// `start` and `process` return the full ordered action list for that cycle;
/// the driver processes one list to completion before feeding more input.
pub trait TlsMachine: Send {
    /// Begin the handshake, emitting the ClientHello flight.
    fn start(&mut self, params: &ConnectParams) -> Vec<TlsAction>;

    /// Feed handshake bytes received at `level`, in stream order.
    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Vec<TlsAction>;

    /// Negotiated application protocol, once known.
    fn application_protocol(&self) -> Option<&[u8]>;

    /// Whether the connection resumed a previous TLS session.
    fn is_resumed(&self) -> bool;

    /// The server's raw transport parameter extension, once received.
    fn peer_transport_params(&self) -> Option<Bytes>;
}

/// Embedder hook invoked by the driver for events that outlive the
/// connection, mirroring the PSK cache contract.
pub trait HandshakeCallback: Send {
    /// A new resumption record should be persisted for this hostname.
    fn on_new_cached_psk(&mut self, record: ResumptionRecord);
}

/// Callback that drops everything; useful when resumption is not wanted.
pub struct NoopHandshakeCallback;

impl HandshakeCallback for NoopHandshakeCallback {
    fn on_new_cached_psk(&mut self, _record: ResumptionRecord) {}
}
