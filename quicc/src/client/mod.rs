//! The client transport: UDP event loop, packet pump, terminal paths.
//!
//! Owns the sockets, the handshake driver and the key scheduler. Everything
//! runs on one task: datagrams, the happy-eyeballs delay timer and posted
//! application commands are the only wakeups. Cross-thread callers interact
//! through [`ClientHandle`], never by touching the transport directly.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use bytes::Bytes;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use quicc_quic::crypto::{
    ConnectParams, HandshakeCallback, KeyScheduler, PacketProtection, ResumptionRecord,
    RustCryptoBackend, TlsMachine,
};
use quicc_quic::error::{Error, Result, TransportErrorKind};
use quicc_quic::frames::{self, Frame, FrameParser};
use quicc_quic::handshake::HandshakeDriver;
use quicc_quic::packet::{header, number, protection, Header, LongType, MIN_INITIAL_DATAGRAM};
use quicc_quic::tls::{CertificateVerifier, Tls13Machine};
use quicc_quic::transport::ServerTransportParameters;
use quicc_quic::types::{ConnectionId, EncryptionLevel, HandshakePhase, KeyDirection, VERSION_1};

use crate::config::TransportSettings;
use crate::events::ConnectionCallback;
use crate::happy_eyeballs::{AddressFamily, HappyEyeballs};
use crate::netio;
use crate::psk::PskCache;
use crate::recovery::{CongestionHooks, PassiveCongestion};
use crate::stats::TransportStats;

/// Produces a fresh TLS client machine. Invoked once at start and again
/// after a Retry, which discards the previous handshake entirely.
pub type TlsMachineFactory = Box<dyn FnMut() -> Box<dyn TlsMachine> + Send>;

/// Factory for the protocol core's built-in TLS 1.3 machine
/// ([`quicc_quic::tls::Tls13Machine`]). The verifier is shared across the
/// fresh machines a Retry may demand.
pub fn tls13_machine_factory(verifier: Arc<dyn CertificateVerifier>) -> TlsMachineFactory {
    Box::new(move || Box::new(Tls13Machine::new(verifier.clone())))
}

const RECV_BUF_LEN: usize = 65535;

/// Commands posted from outside the event loop.
#[derive(Debug)]
enum Command {
    Close { error_code: u64, reason: Bytes },
    IdleTimeout,
}

/// Cheap, clonable handle to a running transport. Dropping every handle does
/// not stop the transport: the spawned task owns it until a terminal event,
/// absorbing late datagrams instead of bouncing them as ICMP unreachables.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// Close the connection with an application error code.
    pub fn close(&self, error_code: u64, reason: impl Into<Bytes>) {
        let _ = self.tx.send(Command::Close {
            error_code,
            reason: reason.into(),
        });
    }

    /// Propagate an idle timeout raised by the surrounding connection state.
    pub fn idle_timeout(&self) {
        let _ = self.tx.send(Command::IdleTimeout);
    }
}

/// Persists resumption records handed out by the handshake, preserving any
/// address-validation token already cached for the hostname.
struct PskWriter {
    cache: Option<Arc<dyn PskCache>>,
    hostname: Option<String>,
}

impl HandshakeCallback for PskWriter {
    fn on_new_cached_psk(&mut self, mut record: ResumptionRecord) {
        let (Some(cache), Some(hostname)) = (&self.cache, &self.hostname) else {
            debug!("resumption ticket dropped: no psk cache configured");
            return;
        };
        if record.token.is_none() {
            record.token = cache.get(hostname).and_then(|old| old.token);
        }
        debug!(%hostname, identity_len = record.psk_identity.len(), "resumption record cached");
        cache.put(hostname, record);
    }
}

enum LoopEvent {
    Datagram {
        on_second: bool,
        len: usize,
        from: SocketAddr,
    },
    SocketError {
        on_second: bool,
        error: std::io::Error,
    },
    DelayExpired,
    Command(Option<Command>),
}

pub struct ClientTransport {
    settings: TransportSettings,
    machine_factory: TlsMachineFactory,
    callback: Box<dyn ConnectionCallback>,
    congestion: Box<dyn CongestionHooks>,
    psk_cache: Option<Arc<dyn PskCache>>,
    hostname: Option<String>,

    he: HappyEyeballs,
    socket: Option<UdpSocket>,
    peer_addr: Option<SocketAddr>,
    original_peer_addr: Option<SocketAddr>,

    driver: Option<HandshakeDriver>,
    keys: KeyScheduler,
    /// Per-level protections moved out of the scheduler (Initial derived
    /// locally). Each slot is filled at most once.
    read_keys: [Option<PacketProtection>; 4],
    write_keys: [Option<PacketProtection>; 4],

    scid: ConnectionId,
    /// Current destination cid: ours at first, pinned to the server's
    /// choice on its first Initial, replaced by a Retry.
    dcid: ConnectionId,
    server_cid: Option<ConnectionId>,
    version: u32,
    retry_token: Option<Bytes>,
    retry_received: bool,

    next_pn: [u64; 4],
    largest_acked: [Option<u64>; 4],
    largest_rx: [Option<u64>; 4],
    ack_queued: [Option<u64>; 4],
    /// Most recent Initial datagram, kept while racing so the flight can be
    /// duplicated onto the secondary once the attempt delay fires.
    last_initial_datagram: Option<Vec<u8>>,

    server_params: Option<ServerTransportParameters>,
    /// Outcome of the 0-RTT attempt once known: `Some(true)` rejected.
    zero_rtt_rejected: Option<bool>,
    replay_safe_notified: bool,
    handshake_finished_notified: bool,
    started: bool,
    started_at: Option<StdInstant>,
    closed: bool,
    failure: Option<Error>,

    stats: TransportStats,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl ClientTransport {
    pub fn new(
        settings: TransportSettings,
        machine_factory: TlsMachineFactory,
        callback: Box<dyn ConnectionCallback>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let empty_cid = ConnectionId::from_slice(&[]).expect("empty cid");
        Self {
            settings,
            machine_factory,
            callback,
            congestion: Box::new(PassiveCongestion::default()),
            psk_cache: None,
            hostname: None,
            he: HappyEyeballs::new(),
            socket: None,
            peer_addr: None,
            original_peer_addr: None,
            driver: None,
            keys: KeyScheduler::new(),
            read_keys: Default::default(),
            write_keys: Default::default(),
            scid: empty_cid,
            dcid: empty_cid,
            server_cid: None,
            version: VERSION_1,
            retry_token: None,
            retry_received: false,
            next_pn: [0; 4],
            largest_acked: [None; 4],
            largest_rx: [None; 4],
            ack_queued: [None; 4],
            last_initial_datagram: None,
            server_params: None,
            zero_rtt_rejected: None,
            replay_safe_notified: false,
            handshake_finished_notified: false,
            started: false,
            started_at: None,
            closed: false,
            failure: None,
            stats: TransportStats::default(),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        }
    }

    // ------------------------------------------------------------------
    // pre-start configuration
    // ------------------------------------------------------------------

    /// Hostname used for certificate validation and PSK cache lookups.
    /// Must be set before `start`.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    pub fn set_psk_cache(&mut self, cache: Arc<dyn PskCache>) {
        self.psk_cache = Some(cache);
    }

    pub fn set_congestion_hooks(&mut self, hooks: Box<dyn CongestionHooks>) {
        self.congestion = hooks;
    }

    /// Register a candidate peer address; at least one is required.
    pub fn add_peer_address(&mut self, addr: SocketAddr) -> Result<()> {
        self.he.add_peer_address(addr)
    }

    /// Supply the extra socket for dual-stack racing.
    pub fn add_second_socket(&mut self, socket: socket2::Socket) {
        self.he.add_second_socket(socket);
    }

    pub fn set_cached_family(&mut self, family: AddressFamily) {
        self.he.set_cached_family(family);
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    // ------------------------------------------------------------------
    // observers
    // ------------------------------------------------------------------

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    pub fn phase(&self) -> HandshakePhase {
        self.driver
            .as_ref()
            .map(HandshakeDriver::phase)
            .unwrap_or(HandshakePhase::Initial)
    }

    pub fn is_tls_resumed(&self) -> bool {
        self.driver
            .as_ref()
            .map(HandshakeDriver::is_resumed)
            .unwrap_or(false)
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn server_transport_params(&self) -> Option<ServerTransportParameters> {
        self.server_params
    }

    /// 0-RTT outcome: `None` until known (or never attempted),
    /// `Some(true)` when the server rejected early data.
    pub fn zero_rtt_rejected(&self) -> Option<bool> {
        self.zero_rtt_rejected
    }

    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    /// Bind sockets, derive Initial keys and emit the first flight.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::ConfigError("transport started twice".into()));
        }
        self.started = true;
        self.started_at = Some(StdInstant::now());

        let peer = self.he.start(&self.settings)?;
        self.stats.happy_eyeballs_raced = self.he.raced();
        if self.he.second_bind_failed() {
            self.stats.secondary_bind_failures += 1;
        }

        let raw = netio::create_socket(&peer)
            .and_then(|raw| netio::setup_socket(&raw, &peer, &self.settings).map(|()| raw))
            .and_then(netio::into_tokio)
            .map_err(|e| Error::transport(TransportErrorKind::Bind, e.to_string()))?;
        info!(peer = %peer, local = ?raw.local_addr().ok(), "client transport started");
        self.socket = Some(raw);
        self.peer_addr = Some(peer);
        self.original_peer_addr = Some(peer);

        let mut cid_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut cid_bytes);
        self.scid = ConnectionId::from_slice(&cid_bytes)?;
        rand::thread_rng().fill_bytes(&mut cid_bytes);
        self.dcid = ConnectionId::from_slice(&cid_bytes)?;

        self.version = *self
            .settings
            .supported_versions
            .first()
            .unwrap_or(&VERSION_1);

        self.rebuild_initial_keys()?;
        self.start_handshake()?;
        self.write_data()?;
        Ok(())
    }

    fn rebuild_initial_keys(&mut self) -> Result<()> {
        let backend = RustCryptoBackend;
        use quicc_quic::crypto::CryptoBackend;
        let idx = EncryptionLevel::Initial.index();
        self.write_keys[idx] =
            Some(backend.initial_protection(&self.dcid, self.version, KeyDirection::Write)?);
        self.read_keys[idx] =
            Some(backend.initial_protection(&self.dcid, self.version, KeyDirection::Read)?);
        Ok(())
    }

    fn start_handshake(&mut self) -> Result<()> {
        let cached_psk = match (&self.psk_cache, &self.hostname) {
            (Some(cache), Some(hostname)) => cache.get(hostname),
            _ => None,
        };
        // A token from last session rides in our Initial packets until a
        // Retry supplies a fresher one.
        if self.retry_token.is_none() {
            if let Some(token) = cached_psk.as_ref().and_then(|psk| psk.token.clone()) {
                self.retry_token = Some(Bytes::from(token));
            }
        }

        let mut params = self.settings.transport_params.clone();
        params.initial_source_connection_id = Some(self.scid);
        params
            .custom
            .extend(self.settings.custom_transport_parameters.iter().cloned());

        let machine = (self.machine_factory)();
        let mut driver = HandshakeDriver::new(
            machine,
            Box::new(RustCryptoBackend),
            Box::new(PskWriter {
                cache: self.psk_cache.clone(),
                hostname: self.hostname.clone(),
            }),
        );
        driver.connect(
            &mut self.keys,
            ConnectParams {
                hostname: self.hostname.clone(),
                cached_psk,
                transport_params: params.encode(),
                alpn: self.settings.alpn.clone(),
            },
        )?;
        self.driver = Some(driver);
        Ok(())
    }

    // ------------------------------------------------------------------
    // event loop
    // ------------------------------------------------------------------

    /// Drive the transport until a terminal event. Consumes the transport;
    /// use [`ClientTransport::spawn`] for the self-owning form.
    pub async fn run(mut self) -> Result<()> {
        if !self.started {
            if let Err(err) = self.start() {
                self.terminate(Some(err.clone()));
                return Err(err);
            }
        }
        let mut cmd_rx = self.cmd_rx.take().expect("command receiver");
        let mut primary_buf = vec![0u8; RECV_BUF_LEN];
        let mut second_buf = vec![0u8; RECV_BUF_LEN];

        while !self.closed {
            let event = {
                let socket = self.socket.as_ref().expect("socket after start");
                let second = self.he.second_socket();
                let deadline = self.he.delay_deadline();
                tokio::select! {
                    res = socket.recv_from(&mut primary_buf) => match res {
                        Ok((len, from)) => LoopEvent::Datagram { on_second: false, len, from },
                        Err(error) => LoopEvent::SocketError { on_second: false, error },
                    },
                    res = async { second.unwrap().recv_from(&mut second_buf).await },
                        if second.is_some() =>
                    {
                        match res {
                            Ok((len, from)) => LoopEvent::Datagram { on_second: true, len, from },
                            Err(error) => LoopEvent::SocketError { on_second: true, error },
                        }
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                        if deadline.is_some() => LoopEvent::DelayExpired,
                    cmd = cmd_rx.recv() => LoopEvent::Command(cmd),
                }
            };

            match event {
                LoopEvent::Datagram { on_second, len, from } => {
                    let buf = if on_second { &second_buf } else { &primary_buf };
                    let datagram = buf[..len].to_vec();
                    self.on_datagram(on_second, datagram, from);
                }
                LoopEvent::SocketError { on_second, error } => {
                    self.on_socket_error(on_second, error, "recv");
                }
                LoopEvent::DelayExpired => self.on_conn_attempt_delay_expired(),
                LoopEvent::Command(Some(Command::Close { error_code, reason })) => {
                    self.app_close(error_code, &reason);
                }
                LoopEvent::Command(Some(Command::IdleTimeout)) => {
                    self.terminate(Some(Error::IdleTimeout));
                }
                // Every handle dropped; keep absorbing peer datagrams until
                // the peer goes quiet or closes (self-owning behavior).
                LoopEvent::Command(None) => {}
            }
        }

        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start and detach: the spawned task owns the transport until a
    /// terminal event, surviving the application dropping its handle.
    pub fn spawn(self) -> ClientHandle {
        let handle = self.handle();
        tokio::spawn(async move {
            if let Err(err) = self.run().await {
                debug!(error = %err, "client transport ended with error");
            }
        });
        handle
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    pub(crate) fn on_conn_attempt_delay_expired(&mut self) {
        self.he.on_delay_expired();
        // The Initial flight already went out on the primary; duplicate it
        // onto the secondary now that its write gate is open.
        if self.he.write_to_second() {
            if let Some(datagram) = self.last_initial_datagram.clone() {
                if let Err(err) = self.send_datagram(&datagram) {
                    self.terminate(Some(err));
                    return;
                }
            }
        }
        if let Err(err) = self.write_data() {
            self.terminate(Some(err));
        }
    }

    pub(crate) fn on_datagram(&mut self, on_second: bool, mut datagram: Vec<u8>, from: SocketAddr) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if !self.he.finished() {
            let mut peer = self.peer_addr.expect("peer after start");
            let mut original = self.original_peer_addr.expect("peer after start");
            let socket = self.socket.as_mut().expect("socket after start");
            self.he.on_data_received(on_second, socket, &mut peer, &mut original);
            self.peer_addr = Some(peer);
            self.original_peer_addr = Some(original);
            if self.he.finished() {
                self.last_initial_datagram = None;
            }
        }

        let mut offset = 0;
        while offset < datagram.len() && !self.closed {
            let parsed = match header::parse_packet(&datagram, offset, self.scid.len()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!(%from, error = %err, "undecodable packet, dropping rest of datagram");
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            let next = parsed.end;
            match parsed.header {
                Header::VersionNegotiation { ref supported, .. } => {
                    self.on_version_negotiation(supported.clone());
                    break;
                }
                Header::Retry { scid, ref token, .. } => {
                    self.on_retry(scid, token.clone());
                    break;
                }
                _ => {
                    self.process_protected_packet(&mut datagram, &parsed);
                }
            }
            offset = next;
        }

        if !self.closed {
            self.after_input();
        }
    }

    fn process_protected_packet(&mut self, datagram: &mut [u8], parsed: &header::ParsedPacket) {
        let level = parsed
            .header
            .encryption_level()
            .expect("protected packet has a level");
        let idx = level.index();

        self.pull_new_keys();
        let Some(prot) = self.read_keys[idx].as_ref() else {
            debug!(?level, "no read keys yet, dropping packet");
            self.stats.packets_dropped += 1;
            return;
        };

        let opened = match protection::open_packet(datagram, parsed, self.largest_rx[idx], prot) {
            Ok(opened) => opened,
            Err(err) => {
                debug!(?level, error = %err, "packet failed to decrypt, dropping");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        // The server's source cid is pinned on its first Initial; any later
        // change is a violation and the packet is discarded.
        if let Header::Long { scid, .. } = &parsed.header {
            match &self.server_cid {
                None => {
                    debug!(server_cid = ?scid, "pinning server connection id");
                    self.server_cid = Some(*scid);
                    self.dcid = *scid;
                }
                Some(pinned) if pinned != scid => {
                    warn!(pinned = ?pinned, got = ?scid, "server cid changed, dropping packet");
                    self.stats.packets_dropped += 1;
                    return;
                }
                Some(_) => {}
            }
        }

        self.largest_rx[idx] = Some(match self.largest_rx[idx] {
            Some(prev) => prev.max(opened.packet_number),
            None => opened.packet_number,
        });

        let mut ack_eliciting = false;
        let mut parser = FrameParser::new(&opened.payload);
        loop {
            let frame = match parser.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    // An authenticated packet with malformed frames is a
                    // peer bug, not noise.
                    self.terminate(Some(err));
                    return;
                }
            };
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding { .. } | Frame::Ping => {}
                Frame::Ack { largest, .. } => {
                    self.largest_acked[idx] = Some(match self.largest_acked[idx] {
                        Some(prev) => prev.max(largest),
                        None => largest,
                    });
                    self.congestion.on_ack_received(largest);
                }
                Frame::Crypto { offset, data } => {
                    let driver = self.driver.as_mut().expect("driver after start");
                    let result = driver.on_crypto_frame(&mut self.keys, level, offset, data);
                    if let Err(err) = result {
                        self.terminate(Some(err));
                        return;
                    }
                }
                Frame::NewToken { token } => self.on_new_token(&token),
                Frame::ConnectionClose { error_code, reason, .. } => {
                    self.terminate(Some(Error::PeerClose {
                        error_code,
                        reason: String::from_utf8_lossy(&reason).into_owned(),
                    }));
                    return;
                }
                Frame::HandshakeDone => {
                    debug!("server confirmed handshake");
                }
            }
        }

        if ack_eliciting {
            self.ack_queued[idx] = self.largest_rx[idx];
        }

        if level == EncryptionLevel::OneRtt {
            // The peer demonstrated 1-RTT keys: implicit handshake ack.
            let driver = self.driver.as_mut().expect("driver after start");
            driver.on_one_rtt_packet_received(&mut self.keys);
        }
    }

    fn on_version_negotiation(&mut self, offered: Vec<u32>) {
        if self.server_cid.is_some() {
            debug!("version negotiation after server packet, ignoring");
            return;
        }
        if offered.contains(&self.version) {
            debug!("version negotiation offering our version, ignoring");
            return;
        }
        info!(offered = ?offered, "no common quic version");
        self.terminate(Some(Error::VersionMismatch(offered)));
    }

    fn on_retry(&mut self, new_scid: ConnectionId, token: Bytes) {
        if self.retry_received || self.server_cid.is_some() || token.is_empty() {
            debug!("unexpected retry, dropping");
            self.stats.packets_dropped += 1;
            return;
        }
        info!(new_dcid = ?new_scid, token_len = token.len(), "server retry, restarting handshake");
        self.retry_received = true;
        self.retry_token = Some(token);
        self.dcid = new_scid;

        // Initial keys come from the new destination cid; the previous
        // handshake state is discarded wholesale and a fresh ClientHello is
        // produced (never a verbatim replay). Packet numbers continue.
        self.keys = KeyScheduler::new();
        self.driver = None;
        let restart = self
            .rebuild_initial_keys()
            .and_then(|()| self.start_handshake());
        if let Err(err) = restart {
            self.terminate(Some(err));
        }
    }

    fn on_new_token(&mut self, token: &Bytes) {
        let (Some(cache), Some(hostname)) = (&self.psk_cache, &self.hostname) else {
            debug!("NEW_TOKEN without psk cache, ignoring");
            return;
        };
        match cache.get(hostname) {
            Some(mut record) => {
                record.token = Some(token.to_vec());
                cache.put(hostname, record);
                debug!(%hostname, "address validation token cached");
            }
            None => debug!(%hostname, "NEW_TOKEN before resumption record, ignoring"),
        }
    }

    fn on_socket_error(&mut self, on_second: bool, error: std::io::Error, op: &str) {
        if is_transient_socket_error(&error) {
            // Error-queue and ICMP signals are hints; with a racing
            // secondary the other family may still win.
            debug!(on_second, op, error = %error, "transient socket error");
            return;
        }
        let kind = if op == "recv" {
            TransportErrorKind::Recv
        } else {
            TransportErrorKind::Send
        };
        self.terminate(Some(Error::transport(kind, error.to_string())));
    }

    // ------------------------------------------------------------------
    // handshake edge pumping
    // ------------------------------------------------------------------

    fn after_input(&mut self) {
        if self.closed {
            return;
        }
        self.pump_handshake_edges();
        if self.closed {
            return;
        }
        if let Err(err) = self.write_data() {
            self.terminate(Some(err));
        }
    }

    fn pump_handshake_edges(&mut self) {
        self.pull_new_keys();

        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let server_params = driver.take_server_transport_params();
        let zero_rtt_rejected = driver.take_zero_rtt_rejected();
        let replay_needed = driver.take_early_data_replay_needed();
        let phase = driver.phase();

        if let Some(params) = server_params {
            self.server_params = Some(params);
            // Keep the cached record's flow-control view current for the
            // next 0-RTT attempt.
            if let (Some(cache), Some(hostname)) = (&self.psk_cache, &self.hostname) {
                if let Some(mut record) = cache.get(hostname) {
                    record.server_params = params;
                    cache.put(hostname, record);
                }
            }
        }
        if let Some(rejected) = zero_rtt_rejected {
            info!(rejected, "zero-rtt outcome");
            self.zero_rtt_rejected = Some(rejected);
        }
        if replay_needed {
            self.callback.on_early_data_rejected();
        }
        if phase >= HandshakePhase::OneRttKeysDerived && !self.handshake_finished_notified {
            self.handshake_finished_notified = true;
            self.stats.handshake_duration = self.started_at.map(|t| t.elapsed());
            info!(resumed = self.is_tls_resumed(), "handshake finished");
            self.callback.on_handshake_finished();
        }
    }

    /// Move freshly installed keys out of the scheduler. Each protection is
    /// taken exactly once; `on_replay_safe` fires with the 1-RTT write key.
    fn pull_new_keys(&mut self) {
        use EncryptionLevel::*;
        use KeyDirection::*;
        for (level, direction) in [
            (ZeroRtt, Write),
            (Handshake, Read),
            (Handshake, Write),
            (OneRtt, Read),
            (OneRtt, Write),
        ] {
            let idx = level.index();
            let table = match direction {
                Read => &mut self.read_keys,
                Write => &mut self.write_keys,
            };
            if table[idx].is_none() {
                if let Some(protection) = self.keys.take(level, direction) {
                    table[idx] = Some(protection);
                }
            }
        }

        if self.write_keys[EncryptionLevel::OneRtt.index()].is_some() && !self.replay_safe_notified
        {
            self.replay_safe_notified = true;
            debug!("replay safe");
            self.callback.on_replay_safe();
        }
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Flush pending acknowledgments and handshake output: one packet per
    /// datagram, frames coalesced at each level that has a write key,
    /// Initial datagrams padded to the 1200-byte floor.
    pub(crate) fn write_data(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.pull_new_keys();
        for level in [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::OneRtt,
        ] {
            loop {
                let idx = level.index();
                if self.write_keys[idx].is_none() {
                    break;
                }
                let has_crypto = self
                    .driver
                    .as_ref()
                    .is_some_and(|d| d.has_pending_crypto(level));
                if !has_crypto && self.ack_queued[idx].is_none() {
                    break;
                }
                if !self.send_packet_at(level)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Build and send one packet at `level`. Returns false when nothing was
    /// sent (congestion gate or no payload).
    fn send_packet_at(&mut self, level: EncryptionLevel) -> Result<bool> {
        let idx = level.index();
        if !self.congestion.can_send(self.settings.max_udp_payload) {
            debug!(?level, "congestion controller blocked send");
            return Ok(false);
        }

        let pn = self.next_pn[idx];
        let pn_len = number::encoded_len(pn, self.largest_acked[idx]);
        let tag_len = self.write_keys[idx]
            .as_ref()
            .expect("write key checked by caller")
            .aead
            .tag_len();
        let token = match (level, &self.retry_token) {
            (EncryptionLevel::Initial, Some(token)) => token.clone(),
            _ => Bytes::new(),
        };

        // Upper bound on header size; exact header is built after framing.
        let header_overhead = match level {
            EncryptionLevel::OneRtt => 1 + self.dcid.len(),
            _ => 11 + self.dcid.len() + self.scid.len() + token.len(),
        };
        let budget = self
            .settings
            .max_udp_payload
            .saturating_sub(header_overhead + pn_len + tag_len);

        let mut frames_buf = Vec::with_capacity(budget.min(2048));
        if let Some(largest) = self.ack_queued[idx].take() {
            frames::encode_ack(largest, 0, &mut frames_buf);
        }
        while frames_buf.len() + 16 < budget {
            let room = budget - frames_buf.len() - 16;
            let chunk = self
                .driver
                .as_mut()
                .and_then(|d| d.next_crypto_chunk(level, room));
            let Some((offset, data)) = chunk else { break };
            frames::encode_crypto(offset, &data, &mut frames_buf);
        }
        if frames_buf.is_empty() {
            return Ok(false);
        }
        if pn_len + frames_buf.len() < 4 {
            let pad_len = 4 - pn_len - frames_buf.len();
            frames::encode_padding(&mut frames_buf, pad_len);
        }

        let build_header = |frames_len: usize, this: &Self| match level {
            EncryptionLevel::OneRtt => header::encode_short_header(&this.dcid, pn_len),
            _ => header::encode_long_header(
                long_type_for(level),
                this.version,
                &this.dcid,
                &this.scid,
                &token,
                pn_len,
                frames_len + tag_len,
            ),
        };

        let mut header_bytes = build_header(frames_buf.len(), self);
        if level == EncryptionLevel::Initial {
            // Client Initials ride in datagrams of at least 1200 bytes; the
            // padding lives inside the protected payload.
            loop {
                let total = header_bytes.len() + pn_len + frames_buf.len() + tag_len;
                if total >= MIN_INITIAL_DATAGRAM {
                    break;
                }
                frames::encode_padding(&mut frames_buf, MIN_INITIAL_DATAGRAM - total);
                header_bytes = build_header(frames_buf.len(), self);
            }
        }

        let protection = self.write_keys[idx].as_ref().expect("write key");
        let datagram = protection::seal_packet(header_bytes, pn, pn_len, &frames_buf, protection)?;
        self.next_pn[idx] += 1;
        if level == EncryptionLevel::Initial && !self.he.finished() {
            self.last_initial_datagram = Some(datagram.clone());
        }
        self.send_datagram(&datagram)?;
        self.congestion.on_packet_sent(pn, datagram.len());
        debug!(?level, pn, len = datagram.len(), "packet sent");
        Ok(true)
    }

    /// Send one datagram on every socket whose happy-eyeballs write flag is
    /// set. Transient errors are hints; hard errors are terminal.
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        let peer = self.peer_addr.expect("peer after start");
        if self.he.write_to_first() {
            let socket = self.socket.as_ref().expect("socket after start");
            match try_send(socket, datagram, peer, self.settings.connect_udp) {
                Ok(()) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += datagram.len() as u64;
                }
                Err(error) if is_transient_socket_error(&error) => {
                    debug!(error = %error, "primary send hint");
                }
                Err(error) => {
                    return Err(Error::transport(TransportErrorKind::Send, error.to_string()))
                }
            }
        }
        if self.he.write_to_second() {
            if let (Some(socket), Some(peer)) = (self.he.second_socket(), self.he.second_peer()) {
                match try_send(socket, datagram, peer, false) {
                    Ok(()) => {
                        self.stats.packets_sent += 1;
                        self.stats.bytes_sent += datagram.len() as u64;
                    }
                    Err(error) if is_transient_socket_error(&error) => {
                        debug!(error = %error, "secondary send hint");
                    }
                    Err(error) => {
                        return Err(Error::transport(
                            TransportErrorKind::Send,
                            error.to_string(),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // terminal paths
    // ------------------------------------------------------------------

    pub(crate) fn app_close(&mut self, error_code: u64, reason: &[u8]) {
        if self.closed {
            return;
        }
        info!(error_code, "application close");
        self.send_connection_close(error_code, reason, true);
        self.callback.on_connection_end();
        self.shutdown();
    }

    /// Terminal error path: CONNECTION_CLOSE if we hold any write key, the
    /// error callback, then sockets down and self-ownership released.
    pub(crate) fn terminate(&mut self, cause: Option<Error>) {
        if self.closed {
            return;
        }
        match cause {
            Some(err) => {
                warn!(error = %err, "connection terminated");
                if !err.is_peer_initiated() {
                    self.send_connection_close(err.to_wire(), b"", false);
                }
                self.callback.on_connection_error(&err);
                self.failure = Some(err);
            }
            None => {
                self.callback.on_connection_end();
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.he.close();
        self.socket = None;
    }

    /// Emit CONNECTION_CLOSE at the highest level holding a write key.
    fn send_connection_close(&mut self, error_code: u64, reason: &[u8], application: bool) {
        let level = [
            EncryptionLevel::OneRtt,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|level| self.write_keys[level.index()].is_some());
        let Some(level) = level else {
            return;
        };
        let idx = level.index();

        let pn = self.next_pn[idx];
        let pn_len = number::encoded_len(pn, self.largest_acked[idx]);
        let mut frames_buf = Vec::new();
        if application {
            frames::encode_application_close(error_code, reason, &mut frames_buf);
        } else {
            frames::encode_connection_close(error_code, reason, &mut frames_buf);
        }
        if pn_len + frames_buf.len() < 4 {
            let pad_len = 4 - pn_len - frames_buf.len();
            frames::encode_padding(&mut frames_buf, pad_len);
        }

        let protection = self.write_keys[idx].as_ref().expect("level has write key");
        let tag_len = protection.aead.tag_len();
        let header_bytes = match level {
            EncryptionLevel::OneRtt => header::encode_short_header(&self.dcid, pn_len),
            _ => header::encode_long_header(
                long_type_for(level),
                self.version,
                &self.dcid,
                &self.scid,
                &[],
                pn_len,
                frames_buf.len() + tag_len,
            ),
        };
        match protection::seal_packet(header_bytes, pn, pn_len, &frames_buf, protection) {
            Ok(datagram) => {
                self.next_pn[idx] += 1;
                let _ = self.send_datagram(&datagram);
            }
            Err(err) => debug!(error = %err, "failed to build CONNECTION_CLOSE"),
        }
    }
}

fn long_type_for(level: EncryptionLevel) -> LongType {
    match level {
        EncryptionLevel::Initial => LongType::Initial,
        EncryptionLevel::ZeroRtt => LongType::ZeroRtt,
        _ => LongType::Handshake,
    }
}

fn try_send(
    socket: &UdpSocket,
    datagram: &[u8],
    peer: SocketAddr,
    connected: bool,
) -> std::io::Result<()> {
    let sent = if connected {
        socket.try_send(datagram)?
    } else {
        socket.try_send_to(datagram, peer)?
    };
    debug_assert_eq!(sent, datagram.len());
    Ok(())
}

/// ICMP-derived and transient errors are logged hints, everything else is a
/// permanent local failure.
fn is_transient_socket_error(error: &std::io::Error) -> bool {
    if error.kind() == std::io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(
        error.raw_os_error(),
        Some(libc::ECONNREFUSED)
            | Some(libc::EHOSTUNREACH)
            | Some(libc::ENETUNREACH)
            | Some(libc::EMSGSIZE)
            | Some(libc::EAGAIN)
            | Some(libc::EINTR)
    )
}
