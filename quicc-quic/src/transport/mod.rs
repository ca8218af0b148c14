//! Transport parameters (RFC 9000 Section 7.4, 18).

pub mod parameters;

pub use parameters::{
    ServerTransportParameters, TransportParameters, CUSTOM_TRANSPORT_PARAM_THRESHOLD,
};
