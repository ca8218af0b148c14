//! RustCrypto-backed packet protection.
//!
//! Implements the QUIC v1 key schedule helpers (HKDF-Expand-Label with the
//! `quic key` / `quic iv` / `quic hp` labels), Initial secret derivation, an
//! AES-128-GCM body AEAD and the AES-ECB header-protection mask.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::backend::{CryptoBackend, HeaderKey, PacketAead, PacketProtection};
use crate::error::{Error, Result, TransportErrorKind};
use crate::types::{ConnectionId, KeyDirection, TLS_AES_128_GCM_SHA256, VERSION_1};

/// Initial salt for QUIC v1 (RFC 9001 Section 5.2).
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// HKDF-Expand-Label per RFC 8446 Section 7.1, SHA-256 only.
pub fn hkdf_expand_label(secret: &[u8], label: &str, context: &[u8], len: usize) -> Result<Vec<u8>> {
    let full_label_len = 6 + label.len();
    let mut info = Vec::with_capacity(4 + full_label_len + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    let hk = Hkdf::<Sha256>::from_prk(secret)
        .map_err(|_| Error::InternalError("hkdf prk shorter than hash output"))?;
    let mut out = vec![0u8; len];
    hk.expand(&info, &mut out)
        .map_err(|_| Error::InternalError("hkdf output length out of range"))?;
    Ok(out)
}

/// Per-direction Initial secrets from the destination connection id.
pub fn initial_secrets(dcid: &ConnectionId, version: u32) -> Result<(Vec<u8>, Vec<u8>)> {
    if version != VERSION_1 {
        return Err(Error::HandshakeError(format!(
            "no initial salt for version {version:#x}"
        )));
    }
    let (prk, _) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT_V1[..]), dcid.as_bytes());
    let client = hkdf_expand_label(&prk, "client in", &[], 32)?;
    let server = hkdf_expand_label(&prk, "server in", &[], 32)?;
    Ok((client, server))
}

/// Derive the client-side Initial protection for one direction.
///
/// The client writes with the `client in` secret and reads with `server in`.
/// Re-invoked with a fresh destination connection id after a Retry.
pub fn initial_packet_protection(
    dcid: &ConnectionId,
    version: u32,
    direction: KeyDirection,
) -> Result<PacketProtection> {
    let (client, server) = initial_secrets(dcid, version)?;
    let secret = match direction {
        KeyDirection::Write => client,
        KeyDirection::Read => server,
    };
    protection_from_secret(&secret)
}

fn protection_from_secret(secret: &[u8]) -> Result<PacketProtection> {
    let key = hkdf_expand_label(secret, "quic key", &[], 16)?;
    let iv = hkdf_expand_label(secret, "quic iv", &[], 12)?;
    let hp = hkdf_expand_label(secret, "quic hp", &[], 16)?;
    Ok(PacketProtection {
        aead: Box::new(Aes128GcmAead::new(&key, &iv)),
        header: Box::new(Aes128HeaderKey::new(&hp)?),
    })
}

/// The default backend. AES-128-GCM-SHA256 only; other suites are rejected
/// so a negotiation mismatch surfaces during the handshake rather than as a
/// decrypt failure later.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoBackend;

impl CryptoBackend for RustCryptoBackend {
    fn packet_protection(&self, secret: &[u8], cipher_suite: u16) -> Result<PacketProtection> {
        if cipher_suite != TLS_AES_128_GCM_SHA256 {
            return Err(Error::HandshakeError(format!(
                "unsupported cipher suite {cipher_suite:#06x}"
            )));
        }
        protection_from_secret(secret)
    }

    fn initial_protection(
        &self,
        dcid: &ConnectionId,
        version: u32,
        direction: KeyDirection,
    ) -> Result<PacketProtection> {
        initial_packet_protection(dcid, version, direction)
    }
}

// ============================================================================
// AES-128-GCM body AEAD
// ============================================================================

struct Aes128GcmAead {
    cipher: Aes128Gcm,
    iv: [u8; 12],
}

impl Aes128GcmAead {
    fn new(key: &[u8], iv: &[u8]) -> Self {
        let mut fixed_iv = [0u8; 12];
        fixed_iv.copy_from_slice(iv);
        Self {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
            iv: fixed_iv,
        }
    }

    /// Nonce is the IV xored with the packet number in the low 8 bytes
    /// (RFC 9001 Section 5.3).
    fn nonce(&self, packet_number: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        for (n, p) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }
}

impl PacketAead for Aes128GcmAead {
    fn seal(&self, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(packet_number);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: header,
                },
            )
            .map_err(|_| Error::InternalError("aead seal failed"))
    }

    fn open(&self, packet_number: u64, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(packet_number);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| Error::transport(TransportErrorKind::Protocol, "aead open failed"))
    }

    fn tag_len(&self) -> usize {
        16
    }
}

// ============================================================================
// AES-ECB header protection (RFC 9001 Section 5.4.3)
// ============================================================================

struct Aes128HeaderKey {
    cipher: Aes128,
}

impl Aes128HeaderKey {
    fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: Aes128::new_from_slice(key)
                .map_err(|_| Error::InternalError("header protection key length"))?,
        })
    }
}

impl HeaderKey for Aes128HeaderKey {
    fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() < 16 {
            return Err(Error::transport(
                TransportErrorKind::Protocol,
                "header protection sample too short",
            ));
        }
        let mut block = GenericArray::clone_from_slice(&sample[..16]);
        self.cipher.encrypt_block(&mut block);
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&block[..5]);
        Ok(mask)
    }

    fn sample_len(&self) -> usize {
        16
    }
}
