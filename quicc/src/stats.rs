//! Transport statistics.

use std::time::Duration;

/// Counters kept by the transport; snapshot via `ClientTransport::stats`.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Datagrams or packets dropped before frame processing (no keys,
    /// parse failure, failed decrypt, pinned-cid mismatch).
    pub packets_dropped: u64,
    /// Whether both address families actually raced.
    pub happy_eyeballs_raced: bool,
    /// Secondary socket bind failures (connection continued on primary).
    pub secondary_bind_failures: u32,
    /// Time from `start` until the 1-RTT keys were derived.
    pub handshake_duration: Option<Duration>,
}
