//! # quicc: QUIC client transport
//!
//! The I/O half of the client: UDP sockets, happy-eyeballs address racing,
//! and the single-task event loop that pumps encrypted datagrams between the
//! network and the `quicc-quic` protocol core.
//!
//! ```text
//! quicc/
//! ├── client          - ClientTransport event loop and ClientHandle
//! ├── config          - Immutable transport settings
//! ├── events          - Application connection callbacks
//! ├── happy_eyeballs  - Dual-stack connection racing (v1)
//! ├── netio           - Socket creation, PMTUD policy, error-queue opt-in
//! ├── psk             - Resumption record cache interface
//! ├── recovery        - Congestion/loss collaborator hooks
//! └── stats           - Transport counters
//! ```
//!
//! Concurrency model: one task owns everything. There are no locks; the only
//! cross-thread surface is the command channel behind [`client::ClientHandle`].

pub mod client;
pub mod config;
pub mod events;
pub mod happy_eyeballs;
pub mod netio;
pub mod psk;
pub mod recovery;
pub mod stats;

pub use client::{tls13_machine_factory, ClientHandle, ClientTransport, TlsMachineFactory};
pub use config::TransportSettings;
pub use events::{ConnectionCallback, NoopConnectionCallback};
pub use happy_eyeballs::{AddressFamily, HappyEyeballs};
pub use psk::{InMemoryPskCache, PskCache};
pub use recovery::{CongestionHooks, PassiveCongestion};
pub use stats::TransportStats;
