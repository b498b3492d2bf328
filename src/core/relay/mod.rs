//! Negotiation relay: room pairing and opaque signal forwarding.

pub mod client;
pub mod protocol;
pub mod rooms;
pub mod server;

pub use client::{RelayClient, RelayEvent};
pub use server::RelayServer;
