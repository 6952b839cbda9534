//! Telemetry bridge library
//!
//! Relays device telemetry from an MQTT broker to WebSocket push clients.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
