//! Application-facing connection callbacks.

use quicc_quic::error::Error;

/// Hooks the embedding application supplies at `start`.
///
/// All methods run on the transport's event loop; implementations must not
/// block and must not call back into the transport synchronously (use the
/// handle's posted commands instead).
pub trait ConnectionCallback: Send {
    /// The first 1-RTT write key exists: application data written from now
    /// on is no longer replayable. Fired at most once.
    fn on_replay_safe(&mut self) {}

    /// The handshake reported success (1-RTT keys derived).
    fn on_handshake_finished(&mut self) {}

    /// The server rejected our 0-RTT data; content written early must be
    /// replayed by the stream layer at 1-RTT.
    fn on_early_data_rejected(&mut self) {}

    /// Terminal failure. The sockets are closed right after this returns.
    fn on_connection_error(&mut self, _error: &Error) {}

    /// Graceful end of the connection (application close or peer close
    /// without error).
    fn on_connection_end(&mut self) {}
}

/// Callback that ignores every event.
pub struct NoopConnectionCallback;

impl ConnectionCallback for NoopConnectionCallback {}
