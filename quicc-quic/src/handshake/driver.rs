//! The client handshake driver.
//!
//! Wraps a [`TlsMachine`], feeds it per-level handshake bytes, and turns the
//! resulting action lists into key installs, pending CRYPTO writes, phase
//! transitions and resumption signals. One action list is processed to
//! completion before any new input is accepted; re-entrant `feed` is a fatal
//! programming error.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::crypto::backend::CryptoBackend;
use crate::crypto::keys::KeyScheduler;
use crate::crypto::machine::{
    ConnectParams, HandshakeCallback, TlsAction, TlsMachine,
};
use crate::error::{Error, Result};
use crate::handshake::stream::CryptoStream;
use crate::transport::{ServerTransportParameters, TransportParameters};
use crate::types::{EncryptionLevel, HandshakePhase, KeyDirection};

pub struct HandshakeDriver {
    machine: Box<dyn TlsMachine>,
    backend: Box<dyn CryptoBackend>,
    callback: Box<dyn HandshakeCallback>,

    phase: HandshakePhase,
    streams: [CryptoStream; 4],
    app_data: BytesMut,

    /// First fatal error; latched, all later input is ignored.
    error: Option<Error>,
    /// Guards against `feed` being re-entered from a callback.
    dispatching: bool,
    wait_for_data: bool,

    psk_supplied: bool,
    early_data_attempted: bool,
    zero_rtt_rejected: Option<bool>,
    early_write_failed: bool,

    server_params: Option<ServerTransportParameters>,
}

impl HandshakeDriver {
    pub fn new(
        machine: Box<dyn TlsMachine>,
        backend: Box<dyn CryptoBackend>,
        callback: Box<dyn HandshakeCallback>,
    ) -> Self {
        Self {
            machine,
            backend,
            callback,
            phase: HandshakePhase::Initial,
            streams: Default::default(),
            app_data: BytesMut::new(),
            error: None,
            dispatching: false,
            wait_for_data: false,
            psk_supplied: false,
            early_data_attempted: false,
            zero_rtt_rejected: None,
            early_write_failed: false,
            server_params: None,
        }
    }

    /// Start the TLS client. The ClientHello flight lands in the Initial
    /// write buffer; with a cached PSK the 0-RTT write key may be installed
    /// synchronously (observable through `keys`).
    pub fn connect(&mut self, keys: &mut KeyScheduler, params: ConnectParams) -> Result<()> {
        self.psk_supplied = params.cached_psk.is_some();
        debug!(
            hostname = params.hostname.as_deref().unwrap_or("<none>"),
            resumption = self.psk_supplied,
            "starting tls client"
        );
        let actions = self.machine.start(&params);
        self.dispatch(keys, actions)
    }

    /// Feed contiguous handshake bytes received at `level`.
    ///
    /// After a latched error this is a silent no-op; the connection is
    /// already dead and the transport is tearing it down.
    pub fn feed(
        &mut self,
        keys: &mut KeyScheduler,
        level: EncryptionLevel,
        data: Bytes,
    ) -> Result<()> {
        if self.dispatching {
            let err = Error::InternalError("re-entrant handshake feed");
            self.error = Some(err.clone());
            return Err(err);
        }
        if self.error.is_some() {
            return Ok(());
        }
        self.wait_for_data = false;
        let actions = self.machine.process(level, &data);
        self.dispatch(keys, actions)
    }

    /// Reassemble an offset-addressed CRYPTO frame and feed whatever became
    /// contiguous. Out-of-order frames buffer; duplicates are dropped.
    pub fn on_crypto_frame(
        &mut self,
        keys: &mut KeyScheduler,
        level: EncryptionLevel,
        offset: u64,
        data: Bytes,
    ) -> Result<()> {
        if self.error.is_some() {
            return Ok(());
        }
        self.streams[level.index()].insert(offset, data)?;
        // Hand the machine one maximal contiguous run per delivery.
        let mut run = BytesMut::new();
        while let Some(chunk) = self.streams[level.index()].next_contiguous() {
            run.extend_from_slice(&chunk);
        }
        if run.is_empty() {
            return Ok(());
        }
        self.feed(keys, level, run.freeze())
    }

    fn dispatch(&mut self, keys: &mut KeyScheduler, actions: Vec<TlsAction>) -> Result<()> {
        self.dispatching = true;
        let result = self.dispatch_inner(keys, actions);
        self.dispatching = false;
        if let Err(err) = &result {
            self.error = Some(err.clone());
        }
        result
    }

    fn dispatch_inner(&mut self, keys: &mut KeyScheduler, actions: Vec<TlsAction>) -> Result<()> {
        for action in actions {
            match action {
                TlsAction::DeliverAppData(data) => {
                    self.app_data.extend_from_slice(&data);
                }
                TlsAction::WriteToSocket { level, data } => {
                    debug!(?level, len = data.len(), "tls emitted handshake bytes");
                    self.streams[level.index()].append_write(data);
                }
                TlsAction::ReportEarlyHandshakeSuccess => {
                    if !self.psk_supplied {
                        return Err(Error::InternalError(
                            "early handshake success without cached psk",
                        ));
                    }
                    self.early_data_attempted = true;
                }
                TlsAction::ReportHandshakeSuccess { early_data_accepted } => {
                    self.on_handshake_success(early_data_accepted)?;
                }
                TlsAction::ReportEarlyWriteFailed => {
                    self.early_write_failed = true;
                }
                TlsAction::ReportError(reason) => {
                    warn!(reason = %reason, "tls reported fatal error");
                    return Err(Error::HandshakeError(reason));
                }
                TlsAction::WaitForData => {
                    self.wait_for_data = true;
                }
                TlsAction::NewCachedPsk(record) => {
                    self.callback.on_new_cached_psk(record);
                }
                TlsAction::SecretAvailable {
                    level,
                    direction,
                    cipher_suite,
                    secret,
                } => {
                    self.install_secret(keys, level, direction, cipher_suite, &secret)?;
                }
            }
        }
        Ok(())
    }

    fn install_secret(
        &mut self,
        keys: &mut KeyScheduler,
        level: EncryptionLevel,
        direction: KeyDirection,
        cipher_suite: u16,
        secret: &[u8],
    ) -> Result<()> {
        if level == EncryptionLevel::ZeroRtt && !self.psk_supplied {
            // An early secret can only follow from a supplied PSK.
            return Err(Error::InternalError("zero-rtt secret without cached psk"));
        }
        let protection = self.backend.packet_protection(secret, cipher_suite)?;
        keys.install(level, direction, protection)?;

        if level == EncryptionLevel::Handshake
            && direction == KeyDirection::Write
            && self.phase == HandshakePhase::Initial
        {
            self.set_phase(HandshakePhase::Handshake);
        }
        Ok(())
    }

    fn on_handshake_success(&mut self, early_data_accepted: bool) -> Result<()> {
        if self.early_data_attempted {
            self.zero_rtt_rejected = Some(!early_data_accepted);
        }
        let raw = self.machine.peer_transport_params().ok_or(Error::HandshakeError(
            "server sent no transport parameters".into(),
        ))?;
        let params = TransportParameters::decode(&raw)?;
        self.server_params = Some(ServerTransportParameters::from(&params));
        self.set_phase(HandshakePhase::OneRttKeysDerived);
        Ok(())
    }

    /// The peer protected a packet with 1-RTT keys: our handshake flight is
    /// implicitly acknowledged. Advances to `Established` and drops the
    /// Handshake-epoch read state.
    pub fn on_one_rtt_packet_received(&mut self, keys: &mut KeyScheduler) {
        if self.phase != HandshakePhase::OneRttKeysDerived {
            return;
        }
        self.set_phase(HandshakePhase::Established);
        keys.discard(EncryptionLevel::Handshake, KeyDirection::Read);
        self.streams[EncryptionLevel::Handshake.index()].discard_read_state();
    }

    fn set_phase(&mut self, phase: HandshakePhase) {
        debug_assert!(phase > self.phase, "handshake phase must be monotone");
        debug!(from = ?self.phase, to = ?phase, "handshake phase advanced");
        self.phase = phase;
    }

    // ------------------------------------------------------------------
    // observers and edge-triggered getters
    // ------------------------------------------------------------------

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether the machine stopped mid-flight waiting for peer bytes.
    pub fn is_waiting_for_data(&self) -> bool {
        self.wait_for_data
    }

    pub fn is_resumed(&self) -> bool {
        self.machine.is_resumed()
    }

    pub fn application_protocol(&self) -> Option<Vec<u8>> {
        self.machine.application_protocol().map(<[u8]>::to_vec)
    }

    /// Server transport parameters, exactly once.
    pub fn take_server_transport_params(&mut self) -> Option<ServerTransportParameters> {
        self.server_params.take()
    }

    /// Edge-triggered 0-RTT outcome: `None` if never attempted (or already
    /// taken), `Some(true)` rejected, `Some(false)` accepted.
    pub fn take_zero_rtt_rejected(&mut self) -> Option<bool> {
        self.zero_rtt_rejected.take()
    }

    /// Edge-triggered: whether 0-RTT stream content must be replayed at
    /// 1-RTT. The replay itself is the stream layer's job.
    pub fn take_early_data_replay_needed(&mut self) -> bool {
        std::mem::take(&mut self.early_write_failed)
    }

    /// Post-handshake TLS application data, surfaced to the collaborator.
    pub fn take_app_data(&mut self) -> Option<Bytes> {
        if self.app_data.is_empty() {
            None
        } else {
            Some(self.app_data.split().freeze())
        }
    }

    // ------------------------------------------------------------------
    // write-side access for the packetizer
    // ------------------------------------------------------------------

    pub fn has_pending_crypto(&self, level: EncryptionLevel) -> bool {
        self.streams[level.index()].has_pending_write()
    }

    /// Drain up to `max_len` bytes of pending handshake output at `level`,
    /// with the CRYPTO stream offset they carry.
    pub fn next_crypto_chunk(
        &mut self,
        level: EncryptionLevel,
        max_len: usize,
    ) -> Option<(u64, Bytes)> {
        self.streams[level.index()].take_write_chunk(max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::machine::{NoopHandshakeCallback, ResumptionRecord};
    use crate::crypto::rust_crypto::RustCryptoBackend;
    use crate::types::TLS_AES_128_GCM_SHA256;

    /// A machine scripted per (level, input) pair.
    struct ScriptedMachine {
        on_start: Vec<TlsAction>,
        steps: Vec<(EncryptionLevel, Vec<u8>, Vec<TlsAction>)>,
        resumed: bool,
        peer_params: Option<Bytes>,
    }

    impl ScriptedMachine {
        fn new(on_start: Vec<TlsAction>) -> Self {
            Self {
                on_start,
                steps: Vec::new(),
                resumed: false,
                peer_params: None,
            }
        }

        fn step(
            mut self,
            level: EncryptionLevel,
            input: &[u8],
            actions: Vec<TlsAction>,
        ) -> Self {
            self.steps.push((level, input.to_vec(), actions));
            self
        }

        fn with_peer_params(mut self, params: &TransportParameters) -> Self {
            self.peer_params = Some(Bytes::from(params.encode()));
            self
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
            self.resumed
        }

        fn peer_transport_params(&self) -> Option<Bytes> {
            self.peer_params.clone()
        }
    }

    fn secret_action(
        level: EncryptionLevel,
        direction: KeyDirection,
        seed: u8,
    ) -> TlsAction {
        TlsAction::SecretAvailable {
            level,
            direction,
            cipher_suite: TLS_AES_128_GCM_SHA256,
            secret: vec![seed; 32],
        }
    }

    fn driver(machine: ScriptedMachine) -> HandshakeDriver {
        HandshakeDriver::new(
            Box::new(machine),
            Box::new(RustCryptoBackend),
            Box::new(NoopHandshakeCallback),
        )
    }

    fn client_hello() -> TlsAction {
        TlsAction::WriteToSocket {
            level: EncryptionLevel::Initial,
            data: Bytes::from_static(b"client-hello"),
        }
    }

    fn psk() -> ResumptionRecord {
        ResumptionRecord {
            psk_identity: b"ticket-1".to_vec(),
            secret: vec![7; 32],
            cipher_suite: TLS_AES_128_GCM_SHA256,
            alpn: Some(b"h3".to_vec()),
            server_params: Default::default(),
            token: None,
            max_early_data: 1024,
            age_add: 0,
            issued_at_unix_ms: 0,
        }
    }

    #[test]
    fn connect_queues_initial_flight() {
        let mut keys = KeyScheduler::new();
        let mut driver = driver(ScriptedMachine::new(vec![client_hello(), TlsAction::WaitForData]));
        driver.connect(&mut keys, ConnectParams::default()).unwrap();

        assert!(driver.has_pending_crypto(EncryptionLevel::Initial));
        let (offset, chunk) = driver
            .next_crypto_chunk(EncryptionLevel::Initial, 1500)
            .unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&chunk[..], b"client-hello");
        assert_eq!(driver.phase(), HandshakePhase::Initial);
    }

    #[test]
    fn full_handshake_phases_and_keys() {
        let mut keys = KeyScheduler::new();
        let machine = ScriptedMachine::new(vec![client_hello(), TlsAction::WaitForData])
            .step(
                EncryptionLevel::Initial,
                b"server-hello",
                vec![
                    secret_action(EncryptionLevel::Handshake, KeyDirection::Read, 1),
                    secret_action(EncryptionLevel::Handshake, KeyDirection::Write, 2),
                    TlsAction::WaitForData,
                ],
            )
            .step(
                EncryptionLevel::Handshake,
                b"server-finished",
                vec![
                    TlsAction::WriteToSocket {
                        level: EncryptionLevel::Handshake,
                        data: Bytes::from_static(b"client-finished"),
                    },
                    secret_action(EncryptionLevel::OneRtt, KeyDirection::Read, 3),
                    secret_action(EncryptionLevel::OneRtt, KeyDirection::Write, 4),
                    TlsAction::ReportHandshakeSuccess {
                        early_data_accepted: false,
                    },
                    TlsAction::WaitForData,
                ],
            )
            .with_peer_params(&TransportParameters {
                initial_max_data: 1 << 16,
                ..Default::default()
            });
        let mut driver = driver(machine);
        driver.connect(&mut keys, ConnectParams::default()).unwrap();

        driver
            .feed(&mut keys, EncryptionLevel::Initial, Bytes::from_static(b"server-hello"))
            .unwrap();
        assert_eq!(driver.phase(), HandshakePhase::Handshake);
        assert!(keys.has(EncryptionLevel::Handshake, KeyDirection::Read));
        assert!(keys.has(EncryptionLevel::Handshake, KeyDirection::Write));

        driver
            .feed(
                &mut keys,
                EncryptionLevel::Handshake,
                Bytes::from_static(b"server-finished"),
            )
            .unwrap();
        assert_eq!(driver.phase(), HandshakePhase::OneRttKeysDerived);
        assert!(driver.has_pending_crypto(EncryptionLevel::Handshake));

        let params = driver.take_server_transport_params().unwrap();
        assert_eq!(params.initial_max_data, 1 << 16);
        assert!(driver.take_server_transport_params().is_none());

        // Never attempted 0-RTT.
        assert_eq!(driver.take_zero_rtt_rejected(), None);

        driver.on_one_rtt_packet_received(&mut keys);
        assert_eq!(driver.phase(), HandshakePhase::Established);
        assert!(!keys.has(EncryptionLevel::Handshake, KeyDirection::Read));
    }

    #[test]
    fn zero_rtt_accepted_roundtrip() {
        let mut keys = KeyScheduler::new();
        let machine = ScriptedMachine::new(vec![
            client_hello(),
            TlsAction::ReportEarlyHandshakeSuccess,
            secret_action(EncryptionLevel::ZeroRtt, KeyDirection::Write, 9),
            TlsAction::WaitForData,
        ])
        .step(
            EncryptionLevel::Initial,
            b"server-hello",
            vec![
                secret_action(EncryptionLevel::OneRtt, KeyDirection::Read, 3),
                secret_action(EncryptionLevel::OneRtt, KeyDirection::Write, 4),
                TlsAction::ReportHandshakeSuccess {
                    early_data_accepted: true,
                },
            ],
        )
        .with_peer_params(&TransportParameters::default());

        let mut driver = driver(machine);
        driver
            .connect(
                &mut keys,
                ConnectParams {
                    cached_psk: Some(psk()),
                    ..Default::default()
                },
            )
            .unwrap();
        // 0-RTT write key present before any server byte.
        assert!(keys.has(EncryptionLevel::ZeroRtt, KeyDirection::Write));

        driver
            .feed(&mut keys, EncryptionLevel::Initial, Bytes::from_static(b"server-hello"))
            .unwrap();
        assert_eq!(driver.take_zero_rtt_rejected(), Some(false));
        assert_eq!(driver.take_zero_rtt_rejected(), None);
        assert!(!driver.take_early_data_replay_needed());
    }

    #[test]
    fn zero_rtt_rejected_sets_replay_signal() {
        let mut keys = KeyScheduler::new();
        let machine = ScriptedMachine::new(vec![
            client_hello(),
            TlsAction::ReportEarlyHandshakeSuccess,
            secret_action(EncryptionLevel::ZeroRtt, KeyDirection::Write, 9),
            TlsAction::WaitForData,
        ])
        .step(
            EncryptionLevel::Initial,
            b"server-hello",
            vec![
                TlsAction::ReportEarlyWriteFailed,
                secret_action(EncryptionLevel::OneRtt, KeyDirection::Read, 3),
                secret_action(EncryptionLevel::OneRtt, KeyDirection::Write, 4),
                TlsAction::ReportHandshakeSuccess {
                    early_data_accepted: false,
                },
            ],
        )
        .with_peer_params(&TransportParameters::default());

        let mut driver = driver(machine);
        driver
            .connect(
                &mut keys,
                ConnectParams {
                    cached_psk: Some(psk()),
                    ..Default::default()
                },
            )
            .unwrap();
        driver
            .feed(&mut keys, EncryptionLevel::Initial, Bytes::from_static(b"server-hello"))
            .unwrap();

        assert_eq!(driver.take_zero_rtt_rejected(), Some(true));
        assert!(driver.take_early_data_replay_needed());
        assert!(!driver.take_early_data_replay_needed());
        // Rejection is not fatal.
        assert!(driver.error().is_none());
    }

    #[test]
    fn zero_rtt_secret_without_psk_is_internal_error() {
        let mut keys = KeyScheduler::new();
        let mut driver = driver(ScriptedMachine::new(vec![secret_action(
            EncryptionLevel::ZeroRtt,
            KeyDirection::Write,
            1,
        )]));
        let err = driver
            .connect(&mut keys, ConnectParams::default())
            .unwrap_err();
        assert!(matches!(err, Error::InternalError(_)));
        assert!(!keys.has(EncryptionLevel::ZeroRtt, KeyDirection::Write));
    }

    #[test]
    fn error_latches_and_feeds_become_noops() {
        let mut keys = KeyScheduler::new();
        let machine = ScriptedMachine::new(vec![client_hello()]).step(
            EncryptionLevel::Initial,
            b"garbage",
            vec![TlsAction::ReportError("bad record mac".into())],
        );
        let mut driver = driver(machine);
        driver.connect(&mut keys, ConnectParams::default()).unwrap();

        let err = driver
            .feed(&mut keys, EncryptionLevel::Initial, Bytes::from_static(b"garbage"))
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeError(_)));
        let phase = driver.phase();

        // Later input is silently dropped and the phase is frozen.
        driver
            .feed(&mut keys, EncryptionLevel::Initial, Bytes::from_static(b"more"))
            .unwrap();
        assert_eq!(driver.phase(), phase);
        assert!(driver.error().is_some());
    }

    #[test]
    fn out_of_order_crypto_frames_are_reassembled() {
        let mut keys = KeyScheduler::new();
        let machine = ScriptedMachine::new(vec![client_hello()]).step(
            EncryptionLevel::Initial,
            b"server-hello",
            vec![secret_action(EncryptionLevel::Handshake, KeyDirection::Write, 2)],
        );
        let mut driver = driver(machine);
        driver.connect(&mut keys, ConnectParams::default()).unwrap();

        // Tail first: nothing must reach the machine yet.
        driver
            .on_crypto_frame(
                &mut keys,
                EncryptionLevel::Initial,
                7,
                Bytes::from_static(b"hello"),
            )
            .unwrap();
        assert_eq!(driver.phase(), HandshakePhase::Initial);

        // Head arrives; the machine sees one contiguous delivery.
        driver
            .on_crypto_frame(
                &mut keys,
                EncryptionLevel::Initial,
                0,
                Bytes::from_static(b"server-"),
            )
            .unwrap();
        assert_eq!(driver.phase(), HandshakePhase::Handshake);
    }
}
