//! IO modules - external system interfaces
//!
//! - `mqtt` - broker transport (rumqttc) behind the `BrokerLink` seam
//! - `lookup` - device configuration lookup (HTTP or static config)
//! - `push_server` - WebSocket endpoint for push clients
//! - `http_api` - management HTTP endpoint and Prometheus metrics
//! - `journal` - telemetry output to file (JSONL format)

pub mod http_api;
pub mod journal;
pub mod lookup;
pub mod mqtt;
pub mod push_server;

// Re-export commonly used types
pub use journal::Journal;
pub use lookup::{ConfigSource, HttpConfigSource, StaticConfigSource};
pub use mqtt::{BrokerLink, LinkConnector, LinkEvent, LinkSettings, RumqttConnector};
