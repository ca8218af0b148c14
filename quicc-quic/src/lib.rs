//! # quicc-quic: client-side QUIC protocol core
//!
//! Sans-I/O building blocks for a QUIC client transport:
//!
//! ```text
//! quicc-quic/
//! ├── error      - Terminal error taxonomy and wire-code mapping
//! ├── types      - Connection ids, varints, epochs, handshake phase
//! ├── packet     - Header codec, packet numbers, packet protection
//! ├── frames     - The handshake-epoch frame subset
//! ├── crypto     - Backend traits, RustCrypto default, one-shot KeyScheduler,
//! │                TLS action model
//! ├── handshake  - Client handshake driver and CRYPTO stream reassembly
//! ├── tls        - Built-in TLS 1.3 client machine (RFC 8446 over QUIC)
//! └── transport  - Transport parameter codec and the cached server subset
//! ```
//!
//! ## Design
//!
//! 1. **No I/O**: this crate never touches sockets or clocks. The `quicc`
//!    runtime owns the event loop and feeds bytes in.
//! 2. **Keys move once**: packet protection material is handed from the
//!    handshake to the packet codec through edge-triggered one-shot slots;
//!    nothing is reference-counted or shared.
//! 3. **Pluggable TLS**: the handshake drives any [`crypto::TlsMachine`] and
//!    pattern-matches its closed action set. [`tls::Tls13Machine`] is the
//!    built-in implementation; an embedder may swap in another stack behind
//!    the same trait.

#![forbid(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod packet;
pub mod tls;
pub mod transport;
pub mod types;

pub use crypto::{
    CryptoBackend, HeaderKey, KeyScheduler, PacketAead, PacketProtection, ResumptionRecord,
    RustCryptoBackend, TlsAction, TlsMachine,
};
pub use error::{Error, Result, TransportErrorKind};
pub use frames::{Frame, FrameParser};
pub use handshake::HandshakeDriver;
pub use packet::{Header, LongType, ParsedPacket, MIN_INITIAL_DATAGRAM};
pub use tls::{CertificateVerifier, NoCertificateVerification, Tls13Machine};
pub use transport::{ServerTransportParameters, TransportParameters};
pub use types::{
    ConnectionId, EncryptionLevel, HandshakePhase, KeyDirection, VERSION_1, VERSION_NEGOTIATION,
};
