//! Infrastructure - configuration, metrics, and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free counters and periodic reporting
//! - `broker` - Embedded MQTT broker (rumqttd) for local development

pub mod broker;
pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, DeviceEntry};
pub use metrics::{Metrics, MetricsSummary};
