//! Packet protection crypto (RFC 9001).
//!
//! The protocol core does not pick a crypto library; it consumes backends
//! through the traits in [`backend`]. A RustCrypto-based default lives in
//! [`rust_crypto`]. Key handoff between the handshake and the packet codec
//! goes through the one-shot [`keys::KeyScheduler`].

pub mod backend;
pub mod keys;
pub mod machine;
pub mod rust_crypto;

pub use backend::{CryptoBackend, HeaderKey, PacketAead, PacketProtection};
pub use keys::KeyScheduler;
pub use machine::{
    ConnectParams, HandshakeCallback, NoopHandshakeCallback, ResumptionRecord, TlsAction,
    TlsMachine,
};
pub use rust_crypto::{initial_packet_protection, RustCryptoBackend};
