//! Futu OpenD gateway adapter.
//!
//! Talks to a local gateway bridge over a socket using length-prefixed JSON
//! frames. Requests are multiplexed over one connection and matched to replies
//! by id. A simulated gateway with a fixed universe is included for demos and
//! tests.

pub mod client;
pub mod protocol;
pub mod simulated;

pub use client::{FutuGateway, GatewayConfig};
pub use simulated::{SimulatedGateway, SimulatedGatewayConfig};
