//! UDP socket creation and configuration.

pub mod socket;

pub use socket::{create_socket, into_tokio, setup_socket};
