//! Error taxonomy for the client transport.
//!
//! Every error here is terminal for the connection; there is no local retry.
//! The transport maps an error to a CONNECTION_CLOSE code via [`Error::to_wire`]
//! when a write key is available at termination time.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of a UDP-level transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket creation or bind failed.
    Bind,
    /// Sending a datagram failed with a non-transient error.
    Send,
    /// Receiving a datagram failed with a non-transient error.
    Recv,
    /// The peer sent bytes that violate the protocol (bad frame, bad header).
    Protocol,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::Bind => "bind",
            TransportErrorKind::Send => "send",
            TransportErrorKind::Recv => "recv",
            TransportErrorKind::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

/// Terminal connection errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Misuse of the setup API before `start` (missing peer address,
    /// duplicate address family, late registration).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Fatal TLS or transport-parameter failure reported by the handshake.
    #[error("handshake error: {0}")]
    HandshakeError(String),

    /// The server answered with a Version Negotiation packet that shares no
    /// version with our supported set. Carries the server's offer.
    #[error("no common version, server offered {0:x?}")]
    VersionMismatch(Vec<u32>),

    /// UDP send/recv/bind failure.
    #[error("transport error ({kind}): {msg}")]
    TransportError {
        kind: TransportErrorKind,
        msg: String,
    },

    /// The peer sent CONNECTION_CLOSE.
    #[error("peer closed connection: code {error_code:#x}, reason {reason:?}")]
    PeerClose { error_code: u64, reason: String },

    /// Propagated from the surrounding connection state.
    #[error("idle timeout")]
    IdleTimeout,

    /// An internal invariant was violated. Always a bug.
    #[error("internal error: {0}")]
    InternalError(&'static str),
}

impl Error {
    pub fn transport(kind: TransportErrorKind, msg: impl Into<String>) -> Self {
        Error::TransportError {
            kind,
            msg: msg.into(),
        }
    }

    /// Transport error code used in the CONNECTION_CLOSE we emit for this
    /// error (RFC 9000 Section 20.1).
    pub fn to_wire(&self) -> u64 {
        match self {
            Error::HandshakeError(_) => 0x0100, // CRYPTO_ERROR base
            Error::TransportError {
                kind: TransportErrorKind::Protocol,
                ..
            } => 0x0a, // PROTOCOL_VIOLATION
            Error::PeerClose { .. } => 0x00, // NO_ERROR; we are echoing a close
            Error::IdleTimeout => 0x00,
            _ => 0x01, // INTERNAL_ERROR
        }
    }

    /// Whether this error came from the remote peer rather than local state.
    pub fn is_peer_initiated(&self) -> bool {
        matches!(self, Error::PeerClose { .. } | Error::VersionMismatch(_))
    }
}
