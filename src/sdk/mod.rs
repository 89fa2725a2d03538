//! High-level entry points for hosts embedding the engine.
//!
//! [`OaseClient`] binds the TLS listener and the UDP channel, then runs the
//! discovery → handoff → authentication → polling lifecycle in a background
//! task. [`probe_device`] performs a single discovery exchange for setup tools.
pub mod client;
pub mod discovery;

pub use client::{ClientError, OaseClient};
pub use discovery::{probe_device, DiscoveredDevice, DiscoveryClientError};
