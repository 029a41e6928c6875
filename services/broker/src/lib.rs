//! Broker service library crate.
//!
//! # Purpose
//! Exposes broker subsystems (config, event relay, TCP transport roles)
//! for use by the broker binary and integration tests.
pub mod config;
pub mod relay;
pub mod transport;
