//! Transport settings.
//!
//! Settings are an immutable value: they flow into happy-eyeballs setup and
//! the write path by reference, never through globals.

use std::time::Duration;

use quicc_quic::transport::TransportParameters;
use quicc_quic::types::VERSION_1;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Invoke `connect()` on the UDP sockets so the kernel filters
    /// off-path senders and reports ICMP errors on send.
    pub connect_udp: bool,
    /// Use probing PMTU discovery socket options instead of setting DF.
    pub turnoff_pmtud: bool,
    /// Opt into kernel error-queue reporting (ICMP hints surface as socket
    /// errors, which the loop logs rather than treats as fatal).
    pub enable_socket_err_msg_callback: bool,
    /// Race v4 and v6 candidate addresses when both are registered.
    pub happy_eyeballs_enabled: bool,
    /// Delay before the losing-family socket also starts writing.
    /// Must be positive.
    pub conn_attempt_delay: Duration,
    /// Offered QUIC versions, most preferred first.
    pub supported_versions: Vec<u32>,
    /// Private transport parameters, each id at or above the custom
    /// threshold, appended to the advertised parameters verbatim.
    pub custom_transport_parameters: Vec<(u64, Vec<u8>)>,
    /// Transport parameters advertised in the ClientHello.
    pub transport_params: TransportParameters,
    /// Application protocols offered via ALPN, in preference order.
    pub alpn: Vec<Vec<u8>>,
    /// Largest datagram the write path will emit.
    pub max_udp_payload: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_udp: false,
            turnoff_pmtud: false,
            enable_socket_err_msg_callback: false,
            happy_eyeballs_enabled: true,
            conn_attempt_delay: Duration::from_millis(150),
            supported_versions: vec![VERSION_1],
            custom_transport_parameters: Vec::new(),
            transport_params: TransportParameters {
                initial_max_data: 1 << 20,
                initial_max_stream_data_bidi_local: 1 << 16,
                initial_max_stream_data_bidi_remote: 1 << 16,
                initial_max_stream_data_uni: 1 << 16,
                initial_max_streams_bidi: 100,
                initial_max_streams_uni: 100,
                max_idle_timeout: 30_000,
                ..Default::default()
            },
            alpn: Vec::new(),
            max_udp_payload: 1252,
        }
    }
}
