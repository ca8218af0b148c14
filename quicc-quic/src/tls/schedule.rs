//! The TLS 1.3 key schedule (RFC 8446 Section 7.1), SHA-256 only.
//!
//! Staged as three types so secrets can only be derived in protocol order:
//! early -> handshake -> master. Each stage consumes the previous one.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::crypto::rust_crypto::hkdf_expand_label;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const HASH_LEN: usize = 32;

pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(data).into()
}

fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; HASH_LEN] {
    let (prk, _) = hkdf::Hkdf::<Sha256>::extract(salt, ikm);
    prk.into()
}

/// Derive-Secret(secret, label, messages) with a precomputed transcript hash.
pub fn derive_secret(secret: &[u8], label: &str, transcript_hash: &[u8]) -> Result<Vec<u8>> {
    hkdf_expand_label(secret, label, transcript_hash, HASH_LEN)
}

/// HMAC over the transcript hash with the secret's finished key
/// (RFC 8446 Section 4.4.4). Used for both Finished messages and PSK
/// binders.
pub fn finished_verify_data(traffic_secret: &[u8], transcript_hash: &[u8]) -> Result<Vec<u8>> {
    let finished_key = hkdf_expand_label(traffic_secret, "finished", &[], HASH_LEN)?;
    let mut mac = HmacSha256::new_from_slice(&finished_key)
        .map_err(|_| Error::InternalError("finished key length"))?;
    mac.update(transcript_hash);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Per-ticket resumption PSK (RFC 8446 Section 4.6.1).
pub fn resumption_psk(resumption_master: &[u8], ticket_nonce: &[u8]) -> Result<Vec<u8>> {
    hkdf_expand_label(resumption_master, "resumption", ticket_nonce, HASH_LEN)
}

/// First stage: Early Secret, from the offered PSK or zeros.
pub struct EarlySecrets {
    early_secret: [u8; HASH_LEN],
}

impl EarlySecrets {
    pub fn new(psk: Option<&[u8]>) -> Self {
        let zeros = [0u8; HASH_LEN];
        Self {
            early_secret: hkdf_extract(None, psk.unwrap_or(&zeros)),
        }
    }

    /// Key protecting the PSK binder in the ClientHello.
    pub fn binder_key(&self) -> Result<Vec<u8>> {
        derive_secret(&self.early_secret, "res binder", &sha256(&[]))
    }

    /// 0-RTT traffic secret over the ClientHello transcript.
    pub fn client_early_traffic_secret(&self, client_hello_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.early_secret, "c e traffic", client_hello_hash)
    }

    /// Mix in the ECDHE shared secret once the ServerHello arrived.
    pub fn into_handshake(self, ecdhe_shared: &[u8]) -> Result<HandshakeSecrets> {
        let derived = derive_secret(&self.early_secret, "derived", &sha256(&[]))?;
        Ok(HandshakeSecrets {
            handshake_secret: hkdf_extract(Some(&derived), ecdhe_shared),
        })
    }
}

/// Second stage: handshake traffic secrets over the hello transcript.
pub struct HandshakeSecrets {
    handshake_secret: [u8; HASH_LEN],
}

impl HandshakeSecrets {
    pub fn client_traffic_secret(&self, hello_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.handshake_secret, "c hs traffic", hello_hash)
    }

    pub fn server_traffic_secret(&self, hello_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.handshake_secret, "s hs traffic", hello_hash)
    }

    pub fn into_master(self) -> Result<MasterSecrets> {
        let derived = derive_secret(&self.handshake_secret, "derived", &sha256(&[]))?;
        let zeros = [0u8; HASH_LEN];
        Ok(MasterSecrets {
            master_secret: hkdf_extract(Some(&derived), &zeros),
        })
    }
}

/// Final stage: application and resumption secrets.
pub struct MasterSecrets {
    master_secret: [u8; HASH_LEN],
}

impl MasterSecrets {
    /// Over the transcript through the server Finished.
    pub fn client_app_traffic_secret(&self, server_finished_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.master_secret, "c ap traffic", server_finished_hash)
    }

    pub fn server_app_traffic_secret(&self, server_finished_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.master_secret, "s ap traffic", server_finished_hash)
    }

    /// Over the transcript through the client Finished.
    pub fn resumption_master_secret(&self, client_finished_hash: &[u8]) -> Result<Vec<u8>> {
        derive_secret(&self.master_secret, "res master", client_finished_hash)
    }
}
