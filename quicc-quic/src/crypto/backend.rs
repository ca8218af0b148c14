//! Crypto backend traits.
//!
//! A backend turns a TLS traffic secret into ready-to-use packet protection:
//! a body AEAD and a header-protection key. The handshake driver never holds
//! raw key material beyond the call into the backend.

use crate::error::Result;
use crate::types::{ConnectionId, KeyDirection};

/// Authenticated body cipher for one (level, direction).
///
/// Implementations hold the packet key and IV internally; the nonce is the
/// IV xored with the packet number (RFC 9001 Section 5.3).
pub trait PacketAead: Send {
    /// Encrypt `payload` bound to `header`, returning ciphertext plus tag.
    fn seal(&self, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` bound to `header`, returning the plaintext.
    fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    fn tag_len(&self) -> usize;
}

/// Header protection key for one (level, direction) (RFC 9001 Section 5.4).
pub trait HeaderKey: Send {
    /// Compute the 5-byte mask from a ciphertext sample.
    fn mask(&self, sample: &[u8]) -> Result<[u8; 5]>;

    fn sample_len(&self) -> usize;
}

/// A derived, install-ready protection pair for one (level, direction).
pub struct PacketProtection {
    pub aead: Box<dyn PacketAead>,
    pub header: Box<dyn HeaderKey>,
}

impl std::fmt::Debug for PacketProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketProtection").finish_non_exhaustive()
    }
}

/// Factory for packet protection material.
pub trait CryptoBackend: Send {
    /// Derive the packet key, IV and header-protection key from a TLS
    /// traffic secret and wrap them for use by the packet codec.
    fn packet_protection(&self, secret: &[u8], cipher_suite: u16) -> Result<PacketProtection>;

    /// Derive the deterministic Initial protection for one direction from
    /// the destination connection id (RFC 9001 Section 5.2).
    fn initial_protection(
        &self,
        dcid: &ConnectionId,
        version: u32,
        direction: KeyDirection,
    ) -> Result<PacketProtection>;
}
