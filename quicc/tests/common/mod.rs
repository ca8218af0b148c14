//! Shared harness for the end-to-end client tests: a scripted TLS machine
//! implemented against the public `TlsMachine` trait and a minimal forging
//! server that speaks just enough of the wire format to drive a handshake.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use quicc_quic::crypto::backend::CryptoBackend;
use quicc_quic::crypto::machine::{ConnectParams, TlsAction, TlsMachine};
use quicc_quic::crypto::rust_crypto::{initial_packet_protection, RustCryptoBackend};
use quicc_quic::crypto::PacketProtection;
use quicc_quic::error::Error;
use quicc_quic::frames;
use quicc_quic::packet::header::{encode_long_header, encode_short_header, parse_packet, LongType};
use quicc_quic::packet::protection::seal_packet;
use quicc_quic::packet::Header;
use quicc_quic::transport::TransportParameters;
use quicc_quic::types::{
    ConnectionId, EncryptionLevel, KeyDirection, TLS_AES_128_GCM_SHA256, VERSION_1,
};

use quicc::events::ConnectionCallback;

pub const HS_READ_SECRET: [u8; 32] = [0x41; 32];
pub const HS_WRITE_SECRET: [u8; 32] = [0x42; 32];
pub const RTT_READ_SECRET: [u8; 32] = [0x51; 32];
pub const RTT_WRITE_SECRET: [u8; 32] = [0x52; 32];

// ============================================================================
// Scripted TLS machine
// ============================================================================

pub struct ScriptedMachine {
    on_start: Vec<TlsAction>,
    steps: Vec<(EncryptionLevel, Vec<u8>, Vec<TlsAction>)>,
}

impl ScriptedMachine {
    pub fn full_handshake() -> Self {
        Self {
            on_start: vec![
                TlsAction::WriteToSocket {
                    level: EncryptionLevel::Initial,
                    data: Bytes::from_static(b"client-hello"),
                },
                TlsAction::WaitForData,
            ],
            steps: vec![
                (
                    EncryptionLevel::Initial,
                    b"server-hello".to_vec(),
                    vec![
                        secret(EncryptionLevel::Handshake, KeyDirection::Read, &HS_READ_SECRET),
                        secret(EncryptionLevel::Handshake, KeyDirection::Write, &HS_WRITE_SECRET),
                        TlsAction::WaitForData,
                    ],
                ),
                (
                    EncryptionLevel::Handshake,
                    b"server-finished".to_vec(),
                    vec![
                        TlsAction::WriteToSocket {
                            level: EncryptionLevel::Handshake,
                            data: Bytes::from_static(b"client-finished"),
                        },
                        secret(EncryptionLevel::OneRtt, KeyDirection::Read, &RTT_READ_SECRET),
                        secret(EncryptionLevel::OneRtt, KeyDirection::Write, &RTT_WRITE_SECRET),
                        TlsAction::ReportHandshakeSuccess {
                            early_data_accepted: false,
                        },
                        TlsAction::WaitForData,
                    ],
                ),
            ],
        }
    }
}

fn secret(level: EncryptionLevel, direction: KeyDirection, bytes: &[u8; 32]) -> TlsAction {
    TlsAction::SecretAvailable {
        level,
        direction,
        cipher_suite: TLS_AES_128_GCM_SHA256,
        secret: bytes.to_vec(),
    }
}

impl TlsMachine for ScriptedMachine {
    fn start(&mut self, _params: &ConnectParams) -> Vec<TlsAction> {
        std::mem::take(&mut self.on_start)
    }

    fn process(&mut self, level: EncryptionLevel, data: &[u8]) -> Vec<TlsAction> {
        for (step_level, input, actions) in &mut self.steps {
            if *step_level == level && input == data {
                return std::mem::take(actions);
            }
        }
        vec![TlsAction::WaitForData]
    }

    fn application_protocol(&self) -> Option<&[u8]> {
        Some(b"h3")
    }

    fn is_resumed(&self) -> bool {
        false
    }

    fn peer_transport_params(&self) -> Option<Bytes> {
        Some(Bytes::from(
            TransportParameters {
                initial_max_data: 1 << 16,
                ..Default::default()
            }
            .encode(),
        ))
    }
}

// ============================================================================
// Event recorder
// ============================================================================

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

pub struct RecorderCallback(pub Recorder);

impl ConnectionCallback for RecorderCallback {
    fn on_replay_safe(&mut self) {
        self.0 .0.lock().unwrap().push("replay_safe".into());
    }

    fn on_handshake_finished(&mut self) {
        self.0 .0.lock().unwrap().push("handshake_finished".into());
    }

    fn on_early_data_rejected(&mut self) {
        self.0 .0.lock().unwrap().push("early_data_rejected".into());
    }

    fn on_connection_error(&mut self, error: &Error) {
        self.0 .0.lock().unwrap().push(format!("error:{error}"));
    }

    fn on_connection_end(&mut self) {
        self.0 .0.lock().unwrap().push("end".into());
    }
}

// ============================================================================
// Forging server
// ============================================================================

pub fn protection_for(secret_bytes: &[u8; 32]) -> PacketProtection {
    RustCryptoBackend
        .packet_protection(secret_bytes, TLS_AES_128_GCM_SHA256)
        .unwrap()
}

pub fn forge_long(
    ty: LongType,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    mut frames_buf: Vec<u8>,
    prot: &PacketProtection,
    pn: u64,
) -> Vec<u8> {
    let pn_len = 1;
    if pn_len + frames_buf.len() < 4 {
        let pad_len = 4 - pn_len - frames_buf.len();
        frames::encode_padding(&mut frames_buf, pad_len);
    }
    let header = encode_long_header(
        ty,
        VERSION_1,
        dcid,
        scid,
        &[],
        pn_len,
        frames_buf.len() + prot.aead.tag_len(),
    );
    seal_packet(header, pn, pn_len, &frames_buf, prot).unwrap()
}

pub fn forge_short(
    dcid: &ConnectionId,
    mut frames_buf: Vec<u8>,
    prot: &PacketProtection,
    pn: u64,
) -> Vec<u8> {
    let pn_len = 1;
    if pn_len + frames_buf.len() < 4 {
        let pad_len = 4 - pn_len - frames_buf.len();
        frames::encode_padding(&mut frames_buf, pad_len);
    }
    seal_packet(encode_short_header(dcid, pn_len), pn, pn_len, &frames_buf, prot).unwrap()
}

pub fn crypto_frames(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    frames::encode_crypto(0, data, &mut out);
    out
}

/// Wait for the client's Initial, then play the three server flights of a
/// full handshake back at it. Returns once HANDSHAKE_DONE went out.
pub async fn serve_full_handshake(socket: tokio::net::UdpSocket) {
    let mut buf = vec![0u8; 65535];
    let (len, from) = socket.recv_from(&mut buf).await.expect("client initial");
    let parsed = parse_packet(&buf[..len], 0, 0).expect("parse client initial");
    let (client_dcid, client_scid) = match parsed.header {
        Header::Long { dcid, scid, .. } => (dcid, scid),
        other => panic!("expected long header, got {other:?}"),
    };

    // The client reads Initials with keys derived from its own first dcid.
    let server_initial =
        initial_packet_protection(&client_dcid, VERSION_1, KeyDirection::Read).unwrap();
    let server_cid = ConnectionId::from_slice(&[0xee; 8]).unwrap();

    let flight = forge_long(
        LongType::Initial,
        &client_scid,
        &server_cid,
        crypto_frames(b"server-hello"),
        &server_initial,
        0,
    );
    socket.send_to(&flight, from).await.unwrap();

    let flight = forge_long(
        LongType::Handshake,
        &client_scid,
        &server_cid,
        crypto_frames(b"server-finished"),
        &protection_for(&HS_READ_SECRET),
        0,
    );
    socket.send_to(&flight, from).await.unwrap();

    let flight = forge_short(
        &client_scid,
        vec![0x1e], // HANDSHAKE_DONE
        &protection_for(&RTT_READ_SECRET),
        0,
    );
    socket.send_to(&flight, from).await.unwrap();
}

/// Bind a server socket on the loopback of `addr`'s family.
pub async fn bind_server(addr: &str) -> (tokio::net::UdpSocket, SocketAddr) {
    let socket = tokio::net::UdpSocket::bind(addr).await.unwrap();
    let local = socket.local_addr().unwrap();
    (socket, local)
}
