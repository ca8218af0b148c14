//! Built-in TLS 1.3 client machine (RFC 8446 over QUIC, RFC 9001).
//!
//! QUIC carries TLS handshake messages directly in CRYPTO streams; there is
//! no record layer and no TLS-level encryption, so the machine here is the
//! message codec plus the key schedule. Traffic secrets leave through
//! `SecretAvailable` actions and packet protection stays with the QUIC
//! layer.
//!
//! AES-128-GCM-SHA256 with a P-256 key share; one PSK may be offered for
//! resumption, unlocking 0-RTT when the ticket permits early data.

pub mod client13;
pub mod messages;
pub mod schedule;

pub use client13::Tls13Machine;

use crate::error::Result;

/// Server authentication hook.
///
/// The machine enforces the cryptographic handshake transcript (Finished
/// verification); judging the certificate chain and the CertificateVerify
/// proof of possession is policy and belongs to the embedder. `message` is
/// the exact signed content from RFC 8446 Section 4.4.3.
pub trait CertificateVerifier: Send + Sync {
    fn verify_server(
        &self,
        end_entity: &[u8],
        intermediates: &[Vec<u8>],
        hostname: Option<&str>,
        signature_scheme: u16,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()>;
}

/// Accepts every chain without looking at it.
///
/// Only suitable for tests and closed deployments that authenticate the
/// peer by other means; anything talking to an untrusted network must
/// supply a real verifier.
pub struct NoCertificateVerification;

impl CertificateVerifier for NoCertificateVerification {
    fn verify_server(
        &self,
        _end_entity: &[u8],
        _intermediates: &[Vec<u8>],
        _hostname: Option<&str>,
        _signature_scheme: u16,
        _message: &[u8],
        _signature: &[u8],
    ) -> Result<()> {
        Ok(())
    }
}
