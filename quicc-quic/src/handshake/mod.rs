//! The client handshake driver and its per-level crypto streams.

pub mod driver;
pub mod stream;

pub use driver::HandshakeDriver;
pub use stream::CryptoStream;
