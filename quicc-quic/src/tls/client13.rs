//! TLS 1.3 client state machine over QUIC CRYPTO streams.
//!
//! One message flow, driven entirely by the levels QUIC delivers at:
//! ServerHello arrives at Initial, EncryptedExtensions through Finished at
//! Handshake, NewSessionTicket at 1-RTT. Traffic secrets are announced as
//! `SecretAvailable` actions the instant they exist; packet protection is
//! the QUIC layer's business.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::crypto::machine::{ConnectParams, ResumptionRecord, TlsAction, TlsMachine};
use crate::error::{Error, Result};
use crate::tls::messages::{self, Message, MessageBuffer};
use crate::tls::schedule::{self, finished_verify_data, sha256, EarlySecrets, HandshakeSecrets};
use crate::tls::CertificateVerifier;
use crate::types::{EncryptionLevel, KeyDirection, TLS_AES_128_GCM_SHA256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitServerHello,
    AwaitEncryptedExtensions,
    AwaitCertificate,
    AwaitCertificateVerify,
    AwaitFinished,
    Connected,
    Failed,
}

/// The built-in TLS 1.3 client. AES-128-GCM-SHA256, P-256 key share, one
/// optional PSK offer with 0-RTT when the ticket permits it.
pub struct Tls13Machine {
    verifier: Arc<dyn CertificateVerifier>,
    state: State,

    hostname: Option<String>,
    offered_alpn: Vec<Vec<u8>>,
    offered_psk: Option<ResumptionRecord>,

    key_exchange: Option<EphemeralSecret>,
    transcript: Vec<u8>,
    buffers: [MessageBuffer; 4],

    early: Option<EarlySecrets>,
    handshake: Option<HandshakeSecrets>,
    client_hs_secret: Vec<u8>,
    server_hs_secret: Vec<u8>,
    resumption_master: Vec<u8>,

    resumed: bool,
    early_data_offered: bool,
    early_data_rejected: bool,
    server_cert_chain: Vec<Vec<u8>>,
    negotiated_alpn: Option<Vec<u8>>,
    peer_transport_params: Option<Bytes>,
}

impl Tls13Machine {
    pub fn new(verifier: Arc<dyn CertificateVerifier>) -> Self {
        Self {
            verifier,
            state: State::Start,
            hostname: None,
            offered_alpn: Vec::new(),
            offered_psk: None,
            key_exchange: None,
            transcript: Vec::new(),
            buffers: Default::default(),
            early: None,
            handshake: None,
            client_hs_secret: Vec::new(),
            server_hs_secret: Vec::new(),
            resumption_master: Vec::new(),
            resumed: false,
            early_data_offered: false,
            early_data_rejected: false,
            server_cert_chain: Vec::new(),
            negotiated_alpn: None,
            peer_transport_params: None,
        }
    }

    fn fail(&mut self, msg: impl Into<String>) -> Vec<TlsAction> {
        self.state = State::Failed;
        vec![TlsAction::ReportError(msg.into())]
    }

    fn secret_action(level: EncryptionLevel, direction: KeyDirection, secret: Vec<u8>) -> TlsAction {
        TlsAction::SecretAvailable {
            level,
            direction,
            cipher_suite: TLS_AES_128_GCM_SHA256,
            secret,
        }
    }

    fn transcript_hash(&self) -> [u8; 32] {
        sha256(&self.transcript)
    }

    // ------------------------------------------------------------------
    // ClientHello
    // ------------------------------------------------------------------

    fn build_hello(&mut self, params: &ConnectParams) -> Result<Vec<TlsAction>> {
        let mut actions = Vec::new();

        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKey::from(&secret).to_sec1_bytes().to_vec();
        self.key_exchange = Some(secret);

        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);

        // A cached PSK is only offerable if its suite matches ours.
        let psk = params.cached_psk.as_ref().filter(|psk| {
            if psk.cipher_suite == TLS_AES_128_GCM_SHA256 {
                true
            } else {
                warn!(
                    cipher_suite = psk.cipher_suite,
                    "cached psk has an unsupported suite, running a full handshake"
                );
                false
            }
        });
        self.early_data_offered = psk.map(|p| p.max_early_data > 0).unwrap_or(false);

        let psk_offer = psk.map(|psk| {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let age_ms = now_ms.saturating_sub(psk.issued_at_unix_ms) as u32;
            messages::PskOffer {
                identity: &psk.psk_identity,
                obfuscated_ticket_age: age_ms.wrapping_add(psk.age_add),
            }
        });

        let mut hello = messages::build_client_hello(&messages::ClientHelloConfig {
            random,
            hostname: params.hostname.as_deref(),
            alpn: &params.alpn,
            key_share_public: &public,
            transport_params: &params.transport_params,
            psk: psk_offer,
            offer_early_data: self.early_data_offered,
        });

        if let Some(psk) = psk {
            // Patch the binder: HMAC over the hello truncated before the
            // binders list (RFC 8446 Section 4.2.11.2).
            let early = EarlySecrets::new(Some(&psk.secret));
            let truncated_hash = sha256(&hello[..hello.len() - messages::SINGLE_BINDER_LEN]);
            let binder = finished_verify_data(&early.binder_key()?, &truncated_hash)?;
            let patch_at = hello.len() - 32;
            hello[patch_at..].copy_from_slice(&binder);

            self.transcript.extend_from_slice(&hello);
            if self.early_data_offered {
                let early_secret = early.client_early_traffic_secret(&self.transcript_hash())?;
                actions.push(TlsAction::ReportEarlyHandshakeSuccess);
                actions.push(Self::secret_action(
                    EncryptionLevel::ZeroRtt,
                    KeyDirection::Write,
                    early_secret,
                ));
            }
            self.early = Some(early);
            self.offered_psk = Some(psk.clone());
        } else {
            self.early = Some(EarlySecrets::new(None));
            self.transcript.extend_from_slice(&hello);
        }

        debug!(
            resumption = self.offered_psk.is_some(),
            early_data = self.early_data_offered,
            "client hello built"
        );
        actions.insert(
            0,
            TlsAction::WriteToSocket {
                level: EncryptionLevel::Initial,
                data: Bytes::from(hello),
            },
        );
        actions.push(TlsAction::WaitForData);
        self.state = State::AwaitServerHello;
        Ok(actions)
    }

    // ------------------------------------------------------------------
    // ServerHello
    // ------------------------------------------------------------------

    fn on_server_hello(&mut self, msg: &Message, actions: &mut Vec<TlsAction>) -> Result<()> {
        let hello = messages::parse_server_hello(&msg.body)?;
        if hello.is_hello_retry() {
            return Err(Error::HandshakeError(
                "server sent HelloRetryRequest, which this client does not support".into(),
            ));
        }
        if hello.selected_version != Some(messages::TLS13) {
            return Err(Error::HandshakeError("server did not select TLS 1.3".into()));
        }
        if hello.cipher_suite != TLS_AES_128_GCM_SHA256 {
            return Err(Error::HandshakeError(format!(
                "server selected unsupported cipher suite {:#06x}",
                hello.cipher_suite
            )));
        }

        let (group, server_public) = hello
            .key_share
            .ok_or(Error::HandshakeError("server sent no key share".into()))?;
        if group != messages::GROUP_SECP256R1 {
            return Err(Error::HandshakeError(format!(
                "server selected unsupported group {group:#06x}"
            )));
        }
        let server_public = PublicKey::from_sec1_bytes(&server_public)
            .map_err(|_| Error::HandshakeError("malformed server key share".into()))?;
        let key_exchange = self
            .key_exchange
            .take()
            .ok_or(Error::InternalError("key exchange consumed twice"))?;
        let shared = key_exchange.diffie_hellman(&server_public);

        // PSK acceptance decides which early secret feeds the schedule. A
        // declined PSK silently degrades to a full handshake, and any early
        // data is implicitly rejected.
        self.resumed = hello.selected_psk == Some(0) && self.offered_psk.is_some();
        let early = if self.resumed {
            self.early
                .take()
                .ok_or(Error::InternalError("early secrets missing"))?
        } else {
            EarlySecrets::new(None)
        };
        debug!(resumed = self.resumed, "server hello processed");

        self.transcript.extend_from_slice(&msg.raw);
        let hello_hash = self.transcript_hash();
        let handshake = early.into_handshake(shared.raw_secret_bytes().as_slice())?;
        self.client_hs_secret = handshake.client_traffic_secret(&hello_hash)?;
        self.server_hs_secret = handshake.server_traffic_secret(&hello_hash)?;
        self.handshake = Some(handshake);

        actions.push(Self::secret_action(
            EncryptionLevel::Handshake,
            KeyDirection::Read,
            self.server_hs_secret.clone(),
        ));
        actions.push(Self::secret_action(
            EncryptionLevel::Handshake,
            KeyDirection::Write,
            self.client_hs_secret.clone(),
        ));
        self.state = State::AwaitEncryptedExtensions;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server flight at the Handshake level
    // ------------------------------------------------------------------

    fn on_encrypted_extensions(&mut self, msg: &Message, actions: &mut Vec<TlsAction>) -> Result<()> {
        let exts = messages::parse_encrypted_extensions(&msg.body)?;

        if let Some(alpn) = &exts.alpn {
            if !self.offered_alpn.is_empty() && !self.offered_alpn.contains(alpn) {
                return Err(Error::HandshakeError(
                    "server selected an application protocol we did not offer".into(),
                ));
            }
            self.negotiated_alpn = Some(alpn.clone());
        }
        self.peer_transport_params = exts.transport_params.map(Bytes::from);

        if self.early_data_offered && !(self.resumed && exts.early_data_accepted) {
            debug!("server rejected early data");
            self.early_data_rejected = true;
            actions.push(TlsAction::ReportEarlyWriteFailed);
        }

        self.transcript.extend_from_slice(&msg.raw);
        self.state = if self.resumed {
            // PSK handshakes authenticate through the PSK; no certificate.
            State::AwaitFinished
        } else {
            State::AwaitCertificate
        };
        Ok(())
    }

    fn on_certificate(&mut self, msg: &Message) -> Result<()> {
        let chain = messages::parse_certificate(&msg.body)?;
        self.server_cert_chain = chain.certs;
        self.transcript.extend_from_slice(&msg.raw);
        self.state = State::AwaitCertificateVerify;
        Ok(())
    }

    fn on_certificate_verify(&mut self, msg: &Message) -> Result<()> {
        let verify = messages::parse_certificate_verify(&msg.body)?;
        // The signature covers the transcript up to Certificate.
        let content = messages::certificate_verify_content(&self.transcript_hash());
        let (end_entity, intermediates) = self
            .server_cert_chain
            .split_first()
            .ok_or(Error::InternalError("certificate chain missing"))?;
        self.verifier.verify_server(
            end_entity,
            intermediates,
            self.hostname.as_deref(),
            verify.scheme,
            &content,
            &verify.signature,
        )?;

        self.transcript.extend_from_slice(&msg.raw);
        self.state = State::AwaitFinished;
        Ok(())
    }

    fn on_server_finished(&mut self, msg: &Message, actions: &mut Vec<TlsAction>) -> Result<()> {
        let expected = finished_verify_data(&self.server_hs_secret, &self.transcript_hash())?;
        if expected != msg.body {
            return Err(Error::HandshakeError(
                "server finished verification failed".into(),
            ));
        }
        self.transcript.extend_from_slice(&msg.raw);
        let server_finished_hash = self.transcript_hash();

        let master = self
            .handshake
            .take()
            .ok_or(Error::InternalError("handshake secrets missing"))?
            .into_master()?;
        actions.push(Self::secret_action(
            EncryptionLevel::OneRtt,
            KeyDirection::Read,
            master.server_app_traffic_secret(&server_finished_hash)?,
        ));
        actions.push(Self::secret_action(
            EncryptionLevel::OneRtt,
            KeyDirection::Write,
            master.client_app_traffic_secret(&server_finished_hash)?,
        ));

        // Our Finished completes the flight and the resumption transcript.
        let verify_data = finished_verify_data(&self.client_hs_secret, &server_finished_hash)?;
        let finished = messages::build_finished(&verify_data);
        self.transcript.extend_from_slice(&finished);
        actions.push(TlsAction::WriteToSocket {
            level: EncryptionLevel::Handshake,
            data: Bytes::from(finished),
        });

        self.resumption_master = master.resumption_master_secret(&self.transcript_hash())?;

        let early_data_accepted =
            self.early_data_offered && self.resumed && !self.early_data_rejected;
        actions.push(TlsAction::ReportHandshakeSuccess {
            early_data_accepted,
        });
        self.state = State::Connected;
        debug!(resumed = self.resumed, "tls handshake complete");
        Ok(())
    }

    fn on_new_session_ticket(&mut self, msg: &Message, actions: &mut Vec<TlsAction>) -> Result<()> {
        let ticket = messages::parse_new_session_ticket(&msg.body)?;
        let secret = schedule::resumption_psk(&self.resumption_master, &ticket.nonce)?;
        let issued_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        debug!(
            lifetime = ticket.lifetime,
            max_early_data = ticket.max_early_data,
            "session ticket received"
        );
        actions.push(TlsAction::NewCachedPsk(ResumptionRecord {
            psk_identity: ticket.ticket,
            secret,
            cipher_suite: TLS_AES_128_GCM_SHA256,
            alpn: self.negotiated_alpn.clone(),
            server_params: Default::default(),
            token: None,
            max_early_data: ticket.max_early_data,
            age_add: ticket.age_add,
            issued_at_unix_ms,
        }));
        Ok(())
    }

    fn process_messages(&mut self, level: EncryptionLevel) -> Result<Vec<TlsAction>> {
        let mut actions = Vec::new();
        while let Some(msg) = self.buffers[level.index()].next_message()? {
            match (self.state, level, msg.ty) {
                (State::AwaitServerHello, EncryptionLevel::Initial, messages::SERVER_HELLO) => {
                    self.on_server_hello(&msg, &mut actions)?;
                }
                (
                    State::AwaitEncryptedExtensions,
                    EncryptionLevel::Handshake,
                    messages::ENCRYPTED_EXTENSIONS,
                ) => {
                    self.on_encrypted_extensions(&msg, &mut actions)?;
                }
                (State::AwaitCertificate, EncryptionLevel::Handshake, messages::CERTIFICATE) => {
                    self.on_certificate(&msg)?;
                }
                (
                    State::AwaitCertificateVerify,
                    EncryptionLevel::Handshake,
                    messages::CERTIFICATE_VERIFY,
                ) => {
                    self.on_certificate_verify(&msg)?;
                }
                (State::AwaitFinished, EncryptionLevel::Handshake, messages::FINISHED) => {
                    self.on_server_finished(&msg, &mut actions)?;
                }
                (State::Connected, EncryptionLevel::OneRtt, messages::NEW_SESSION_TICKET) => {
                    self.on_new_session_ticket(&msg, &mut actions)?;
                }
                (state, level, ty) => {
                    return Err(Error::HandshakeError(format!(
                        "unexpected handshake message {ty} at {level:?} in state {state:?}"
                    )));
                }
            }
        }
        Ok(actions)
    }
}

impl TlsMachine for Tls13Machine {
    fn start(&mut self, params: &ConnectParams) -> Vec<TlsAction> {
        if self.state != State::Start {
            return self.fail("tls client started twice");
        }
        self.hostname = params.hostname.clone();
        self.offered_alpn = params.alpn.clone();
        match self.build_hello(params) {
            Ok(actions) => actions,
            Err(err) => self.fail(err.to_string()),
        }
    }

    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Vec<TlsAction> {
        if self.state == State::Failed {
            return Vec::new();
        }
        self.buffers[level.index()].push(data);
        match self.process_messages(level) {
            Ok(mut actions) => {
                actions.push(TlsAction::WaitForData);
                actions
            }
            Err(err) => self.fail(err.to_string()),
        }
    }

    fn application_protocol(&self) -> Option<&[u8]> {
        self.negotiated_alpn.as_deref()
    }

    fn is_resumed(&self) -> bool {
        self.resumed
    }

    fn peer_transport_params(&self) -> Option<Bytes> {
        self.peer_transport_params.clone()
    }
}
