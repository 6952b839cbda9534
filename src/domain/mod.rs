//! Domain models - core types shared by every component
//!
//! This module contains the canonical data types used throughout the bridge:
//! - `DeviceConfig` - broker credentials and topics for one registered device
//! - `DeviceRegistry` / `DeviceView` - the device map (writer / read-only handles)
//! - `TelemetryEvent` - normalized telemetry record produced by the classifier
//! - `BroadcastMessage` - the only payload shapes sent to push clients
//! - `ConnectionState` - broker connection lifecycle state
//! - error types surfaced at component seams

pub mod device;
pub mod errors;
pub mod types;

// Re-export commonly used types at module level
pub use device::{DeviceConfig, DeviceRegistry, DeviceView};
pub use errors::{ConnectError, FetchError, LinkError, PublishError};
pub use types::{
    unix_now, BroadcastMessage, ConnectionState, InboundMessage, StatsSnapshot, TelemetryEvent,
};
