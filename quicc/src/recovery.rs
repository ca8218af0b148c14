//! Congestion and loss collaborator interface.
//!
//! The transport core does not implement recovery; it notifies whichever
//! controller the embedder wires in and asks permission before sending.

/// Narrow congestion/loss interface consumed by the write path.
pub trait CongestionHooks: Send {
    fn on_packet_sent(&mut self, packet_number: u64, bytes: usize);
    fn on_ack_received(&mut self, largest_acked: u64);
    fn on_packet_loss(&mut self, packet_number: u64);
    /// Whether `bytes` more may be put in flight right now.
    fn can_send(&mut self, bytes: usize) -> bool;
}

/// Default controller: never blocks the handshake.
///
/// Real congestion control belongs to the surrounding connection state; the
/// handshake flights this crate emits are far below any sane initial window.
#[derive(Debug, Default)]
pub struct PassiveCongestion {
    bytes_in_flight: usize,
}

impl CongestionHooks for PassiveCongestion {
    fn on_packet_sent(&mut self, _packet_number: u64, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    fn on_ack_received(&mut self, _largest_acked: u64) {
        self.bytes_in_flight = 0;
    }

    fn on_packet_loss(&mut self, _packet_number: u64) {}

    fn can_send(&mut self, _bytes: usize) -> bool {
        true
    }
}
