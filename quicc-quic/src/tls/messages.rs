//! TLS 1.3 handshake message codec (RFC 8446 Section 4).
//!
//! Only the shapes a QUIC client needs: ClientHello out; ServerHello,
//! EncryptedExtensions, Certificate, CertificateVerify, Finished and
//! NewSessionTicket in. Builders for the server-side messages exist so the
//! flow can be exercised against a mirrored peer in tests.

use crate::error::{Error, Result};

// Handshake message types.
pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const NEW_SESSION_TICKET: u8 = 4;
pub const ENCRYPTED_EXTENSIONS: u8 = 8;
pub const CERTIFICATE: u8 = 11;
pub const CERTIFICATE_VERIFY: u8 = 15;
pub const FINISHED: u8 = 20;

// Extension code points.
pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_PRE_SHARED_KEY: u16 = 41;
pub const EXT_EARLY_DATA: u16 = 42;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
pub const EXT_KEY_SHARE: u16 = 51;
/// quic_transport_parameters (RFC 9001 Section 8.2).
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0x39;

/// secp256r1 named group.
pub const GROUP_SECP256R1: u16 = 0x0017;

/// TLS 1.3 on the wire.
pub const TLS13: u16 = 0x0304;
const LEGACY_VERSION: u16 = 0x0303;

/// The special ServerHello.random marking a HelloRetryRequest
/// (RFC 8446 Section 4.1.3).
pub const HELLO_RETRY_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

/// The binders list of a single-PSK offer: u16 list length, u8 binder
/// length, 32 binder bytes. Everything before it is the binder transcript.
pub const SINGLE_BINDER_LEN: usize = 2 + 1 + 32;

fn fail(msg: &'static str) -> Error {
    Error::HandshakeError(msg.into())
}

// ============================================================================
// Primitive writers and readers
// ============================================================================

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u24(out: &mut Vec<u8>, v: usize) {
    debug_assert!(v < 1 << 24);
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(len).ok_or(fail("message truncated"))?;
        let slice = self.buf.get(self.at..end).ok_or(fail("message truncated"))?;
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize> {
        let b = self.bytes(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn vec8(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    fn vec16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    fn vec24(&mut self) -> Result<&'a [u8]> {
        let len = self.u24()?;
        self.bytes(len)
    }
}

/// Wrap a message body in the handshake header.
pub fn message(ty: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.push(ty);
    put_u24(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

fn extension(out: &mut Vec<u8>, ty: u16, body: &[u8]) {
    put_u16(out, ty);
    put_u16(out, body.len() as u16);
    out.extend_from_slice(body);
}

/// Parse an extension block into (type, body) pairs.
pub fn parse_extensions(buf: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut reader = Reader::new(buf);
    let mut out = Vec::new();
    while reader.remaining() > 0 {
        let ty = reader.u16()?;
        let body = reader.vec16()?;
        out.push((ty, body.to_vec()));
    }
    Ok(out)
}

// ============================================================================
// Message stream reassembly
// ============================================================================

/// One complete handshake message.
#[derive(Debug, Clone)]
pub struct Message {
    pub ty: u8,
    pub body: Vec<u8>,
    /// Full encoding including the header, as hashed into the transcript.
    pub raw: Vec<u8>,
}

/// Accumulates CRYPTO-stream bytes and yields complete messages; handshake
/// messages may span QUIC packets.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        let total = 4 + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let raw: Vec<u8> = self.buf.drain(..total).collect();
        Ok(Some(Message {
            ty: raw[0],
            body: raw[4..].to_vec(),
            raw,
        }))
    }
}

// ============================================================================
// ClientHello
// ============================================================================

/// A PSK offer carried in the ClientHello; the binder is written as zeros
/// and patched by the caller once the truncated transcript is known.
pub struct PskOffer<'a> {
    pub identity: &'a [u8],
    pub obfuscated_ticket_age: u32,
}

pub struct ClientHelloConfig<'a> {
    pub random: [u8; 32],
    pub hostname: Option<&'a str>,
    pub alpn: &'a [Vec<u8>],
    pub key_share_public: &'a [u8],
    pub transport_params: &'a [u8],
    pub psk: Option<PskOffer<'a>>,
    pub offer_early_data: bool,
}

/// Build the full ClientHello message (header included). With a PSK offer
/// the final [`SINGLE_BINDER_LEN`] bytes are the zeroed binders list; patch
/// the last 32 bytes with the binder over everything before it.
pub fn build_client_hello(config: &ClientHelloConfig<'_>) -> Vec<u8> {
    let mut body = Vec::with_capacity(256);
    put_u16(&mut body, LEGACY_VERSION);
    body.extend_from_slice(&config.random);
    body.push(0); // legacy session id: empty (RFC 9001 Section 8.4)
    put_u16(&mut body, 2); // one cipher suite
    put_u16(&mut body, crate::types::TLS_AES_128_GCM_SHA256);
    body.push(1); // legacy compression methods
    body.push(0);

    let mut exts = Vec::with_capacity(256);
    if let Some(hostname) = config.hostname {
        let name = hostname.as_bytes();
        let mut sni = Vec::with_capacity(5 + name.len());
        put_u16(&mut sni, name.len() as u16 + 3);
        sni.push(0); // name type: host_name
        put_u16(&mut sni, name.len() as u16);
        sni.extend_from_slice(name);
        extension(&mut exts, EXT_SERVER_NAME, &sni);
    }

    let mut groups = Vec::new();
    put_u16(&mut groups, 2);
    put_u16(&mut groups, GROUP_SECP256R1);
    extension(&mut exts, EXT_SUPPORTED_GROUPS, &groups);

    let mut sig_algs = Vec::new();
    // ecdsa_secp256r1_sha256, rsa_pss_rsae_sha256/384/512
    let schemes: [u16; 4] = [0x0403, 0x0804, 0x0805, 0x0806];
    put_u16(&mut sig_algs, (schemes.len() * 2) as u16);
    for scheme in schemes {
        put_u16(&mut sig_algs, scheme);
    }
    extension(&mut exts, EXT_SIGNATURE_ALGORITHMS, &sig_algs);

    extension(&mut exts, EXT_SUPPORTED_VERSIONS, &[2, 0x03, 0x04]);

    let mut key_share = Vec::with_capacity(8 + config.key_share_public.len());
    put_u16(&mut key_share, config.key_share_public.len() as u16 + 4);
    put_u16(&mut key_share, GROUP_SECP256R1);
    put_u16(&mut key_share, config.key_share_public.len() as u16);
    key_share.extend_from_slice(config.key_share_public);
    extension(&mut exts, EXT_KEY_SHARE, &key_share);

    if !config.alpn.is_empty() {
        let mut alpn = Vec::new();
        let list_len: usize = config.alpn.iter().map(|p| 1 + p.len()).sum();
        put_u16(&mut alpn, list_len as u16);
        for protocol in config.alpn {
            alpn.push(protocol.len() as u8);
            alpn.extend_from_slice(protocol);
        }
        extension(&mut exts, EXT_ALPN, &alpn);
    }

    extension(&mut exts, EXT_QUIC_TRANSPORT_PARAMETERS, config.transport_params);

    if let Some(psk) = &config.psk {
        extension(&mut exts, EXT_PSK_KEY_EXCHANGE_MODES, &[1, 1]); // psk_dhe_ke
        if config.offer_early_data {
            extension(&mut exts, EXT_EARLY_DATA, &[]);
        }

        // pre_shared_key goes last (RFC 8446 Section 4.2.11).
        let mut psk_body = Vec::with_capacity(psk.identity.len() + 8 + SINGLE_BINDER_LEN);
        put_u16(&mut psk_body, psk.identity.len() as u16 + 6);
        put_u16(&mut psk_body, psk.identity.len() as u16);
        psk_body.extend_from_slice(psk.identity);
        put_u32(&mut psk_body, psk.obfuscated_ticket_age);
        put_u16(&mut psk_body, 33); // binders list
        psk_body.push(32);
        psk_body.extend_from_slice(&[0u8; 32]);
        extension(&mut exts, EXT_PRE_SHARED_KEY, &psk_body);
    }

    put_u16(&mut body, exts.len() as u16);
    body.extend_from_slice(&exts);
    message(CLIENT_HELLO, &body)
}

/// Parsed ClientHello, used by mirrored-peer tests.
#[derive(Debug)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ClientHello {
    pub fn extension(&self, ty: u16) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, body)| body.as_slice())
    }

    /// The key-exchange bytes offered for `group`.
    pub fn key_share(&self, group: u16) -> Option<Vec<u8>> {
        let body = self.extension(EXT_KEY_SHARE)?;
        let mut reader = Reader::new(body);
        let shares = reader.vec16().ok()?;
        let mut reader = Reader::new(shares);
        while reader.remaining() > 0 {
            let share_group = reader.u16().ok()?;
            let key = reader.vec16().ok()?;
            if share_group == group {
                return Some(key.to_vec());
            }
        }
        None
    }
}

pub fn parse_client_hello(body: &[u8]) -> Result<ClientHello> {
    let mut reader = Reader::new(body);
    if reader.u16()? != LEGACY_VERSION {
        return Err(fail("unexpected legacy version"));
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(reader.bytes(32)?);
    reader.vec8()?; // legacy session id
    let suites_raw = reader.vec16()?;
    if suites_raw.len() % 2 != 0 {
        return Err(fail("malformed cipher suite list"));
    }
    let cipher_suites = suites_raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    reader.vec8()?; // compression methods
    let extensions = parse_extensions(reader.vec16()?)?;
    Ok(ClientHello {
        random,
        cipher_suites,
        extensions,
    })
}

// ============================================================================
// ServerHello
// ============================================================================

#[derive(Debug)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub cipher_suite: u16,
    pub key_share: Option<(u16, Vec<u8>)>,
    pub selected_psk: Option<u16>,
    pub selected_version: Option<u16>,
}

impl ServerHello {
    pub fn is_hello_retry(&self) -> bool {
        self.random == HELLO_RETRY_RANDOM
    }
}

pub fn parse_server_hello(body: &[u8]) -> Result<ServerHello> {
    let mut reader = Reader::new(body);
    if reader.u16()? != LEGACY_VERSION {
        return Err(fail("unexpected legacy version"));
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(reader.bytes(32)?);
    reader.vec8()?; // echoed session id
    let cipher_suite = reader.u16()?;
    reader.u8()?; // compression method

    let mut hello = ServerHello {
        random,
        cipher_suite,
        key_share: None,
        selected_psk: None,
        selected_version: None,
    };
    for (ty, ext_body) in parse_extensions(reader.vec16()?)? {
        let mut reader = Reader::new(&ext_body);
        match ty {
            EXT_SUPPORTED_VERSIONS => hello.selected_version = Some(reader.u16()?),
            EXT_KEY_SHARE => {
                let group = reader.u16()?;
                let key = reader.vec16()?;
                hello.key_share = Some((group, key.to_vec()));
            }
            EXT_PRE_SHARED_KEY => hello.selected_psk = Some(reader.u16()?),
            _ => {}
        }
    }
    Ok(hello)
}

pub fn build_server_hello(
    random: &[u8; 32],
    cipher_suite: u16,
    key_share_public: &[u8],
    selected_psk: Option<u16>,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    put_u16(&mut body, LEGACY_VERSION);
    body.extend_from_slice(random);
    body.push(0); // echoed session id: empty
    put_u16(&mut body, cipher_suite);
    body.push(0); // compression

    let mut exts = Vec::new();
    extension(&mut exts, EXT_SUPPORTED_VERSIONS, &TLS13.to_be_bytes());
    let mut key_share = Vec::with_capacity(4 + key_share_public.len());
    put_u16(&mut key_share, GROUP_SECP256R1);
    put_u16(&mut key_share, key_share_public.len() as u16);
    key_share.extend_from_slice(key_share_public);
    extension(&mut exts, EXT_KEY_SHARE, &key_share);
    if let Some(identity) = selected_psk {
        extension(&mut exts, EXT_PRE_SHARED_KEY, &identity.to_be_bytes());
    }

    put_u16(&mut body, exts.len() as u16);
    body.extend_from_slice(&exts);
    message(SERVER_HELLO, &body)
}

// ============================================================================
// EncryptedExtensions
// ============================================================================

#[derive(Debug, Default)]
pub struct EncryptedExtensions {
    pub alpn: Option<Vec<u8>>,
    pub transport_params: Option<Vec<u8>>,
    pub early_data_accepted: bool,
}

pub fn parse_encrypted_extensions(body: &[u8]) -> Result<EncryptedExtensions> {
    let mut reader = Reader::new(body);
    let mut out = EncryptedExtensions::default();
    for (ty, ext_body) in parse_extensions(reader.vec16()?)? {
        match ty {
            EXT_ALPN => {
                let mut reader = Reader::new(&ext_body);
                let list = reader.vec16()?;
                let mut reader = Reader::new(list);
                out.alpn = Some(reader.vec8()?.to_vec());
            }
            EXT_QUIC_TRANSPORT_PARAMETERS => out.transport_params = Some(ext_body),
            EXT_EARLY_DATA => out.early_data_accepted = true,
            _ => {}
        }
    }
    Ok(out)
}

pub fn build_encrypted_extensions(
    alpn: Option<&[u8]>,
    transport_params: &[u8],
    early_data_accepted: bool,
) -> Vec<u8> {
    let mut exts = Vec::new();
    if let Some(protocol) = alpn {
        let mut alpn_body = Vec::with_capacity(3 + protocol.len());
        put_u16(&mut alpn_body, protocol.len() as u16 + 1);
        alpn_body.push(protocol.len() as u8);
        alpn_body.extend_from_slice(protocol);
        extension(&mut exts, EXT_ALPN, &alpn_body);
    }
    extension(&mut exts, EXT_QUIC_TRANSPORT_PARAMETERS, transport_params);
    if early_data_accepted {
        extension(&mut exts, EXT_EARLY_DATA, &[]);
    }

    let mut body = Vec::with_capacity(2 + exts.len());
    put_u16(&mut body, exts.len() as u16);
    body.extend_from_slice(&exts);
    message(ENCRYPTED_EXTENSIONS, &body)
}

// ============================================================================
// Certificate, CertificateVerify, Finished
// ============================================================================

#[derive(Debug)]
pub struct CertificateChain {
    pub certs: Vec<Vec<u8>>,
}

pub fn parse_certificate(body: &[u8]) -> Result<CertificateChain> {
    let mut reader = Reader::new(body);
    reader.vec8()?; // certificate_request_context
    let list = reader.vec24()?;
    let mut reader = Reader::new(list);
    let mut certs = Vec::new();
    while reader.remaining() > 0 {
        certs.push(reader.vec24()?.to_vec());
        reader.vec16()?; // per-certificate extensions
    }
    if certs.is_empty() {
        return Err(fail("empty certificate chain"));
    }
    Ok(CertificateChain { certs })
}

pub fn build_certificate(certs: &[&[u8]]) -> Vec<u8> {
    let mut list = Vec::new();
    for cert in certs {
        put_u24(&mut list, cert.len());
        list.extend_from_slice(cert);
        put_u16(&mut list, 0); // no per-certificate extensions
    }
    let mut body = Vec::with_capacity(4 + list.len());
    body.push(0); // empty certificate_request_context
    put_u24(&mut body, list.len());
    body.extend_from_slice(&list);
    message(CERTIFICATE, &body)
}

#[derive(Debug)]
pub struct CertificateVerify {
    pub scheme: u16,
    pub signature: Vec<u8>,
}

pub fn parse_certificate_verify(body: &[u8]) -> Result<CertificateVerify> {
    let mut reader = Reader::new(body);
    let scheme = reader.u16()?;
    let signature = reader.vec16()?.to_vec();
    Ok(CertificateVerify { scheme, signature })
}

pub fn build_certificate_verify(scheme: u16, signature: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + signature.len());
    put_u16(&mut body, scheme);
    put_u16(&mut body, signature.len() as u16);
    body.extend_from_slice(signature);
    message(CERTIFICATE_VERIFY, &body)
}

/// The exact content covered by the server's CertificateVerify signature
/// (RFC 8446 Section 4.4.3).
pub fn certificate_verify_content(transcript_hash: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(98);
    content.extend_from_slice(&[0x20u8; 64]);
    content.extend_from_slice(b"TLS 1.3, server CertificateVerify");
    content.push(0);
    content.extend_from_slice(transcript_hash);
    content
}

pub fn build_finished(verify_data: &[u8]) -> Vec<u8> {
    message(FINISHED, verify_data)
}

// ============================================================================
// NewSessionTicket
// ============================================================================

#[derive(Debug)]
pub struct NewSessionTicket {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub max_early_data: u32,
}

pub fn parse_new_session_ticket(body: &[u8]) -> Result<NewSessionTicket> {
    let mut reader = Reader::new(body);
    let lifetime = reader.u32()?;
    let age_add = reader.u32()?;
    let nonce = reader.vec8()?.to_vec();
    let ticket = reader.vec16()?.to_vec();
    if ticket.is_empty() {
        return Err(fail("empty session ticket"));
    }
    let mut max_early_data = 0;
    for (ty, ext_body) in parse_extensions(reader.vec16()?)? {
        if ty == EXT_EARLY_DATA {
            max_early_data = Reader::new(&ext_body).u32()?;
        }
    }
    Ok(NewSessionTicket {
        lifetime,
        age_add,
        nonce,
        ticket,
        max_early_data,
    })
}

pub fn build_new_session_ticket(
    lifetime: u32,
    age_add: u32,
    nonce: &[u8],
    ticket: &[u8],
    max_early_data: Option<u32>,
) -> Vec<u8> {
    let mut exts = Vec::new();
    if let Some(max) = max_early_data {
        extension(&mut exts, EXT_EARLY_DATA, &max.to_be_bytes());
    }
    let mut body = Vec::with_capacity(16 + nonce.len() + ticket.len() + exts.len());
    put_u32(&mut body, lifetime);
    put_u32(&mut body, age_add);
    body.push(nonce.len() as u8);
    body.extend_from_slice(nonce);
    put_u16(&mut body, ticket.len() as u16);
    body.extend_from_slice(ticket);
    put_u16(&mut body, exts.len() as u16);
    body.extend_from_slice(&exts);
    message(NEW_SESSION_TICKET, &body)
}
