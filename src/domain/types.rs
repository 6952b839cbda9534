//! Shared types for the telemetry bridge

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Broker connection lifecycle state
///
/// Exactly one instance lives inside the connection actor; everyone else
/// observes it through a `watch` channel or the lifecycle event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    /// Numeric code used by the metrics gauge
    pub fn code(&self) -> u64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Closed => 4,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw publish received from the broker, before classification
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Normalized telemetry record
///
/// Field names on the wire follow the device protocol (`duration`, `timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub session_id: String,
    #[serde(rename = "duration")]
    pub duration_seconds: f64,
    pub reason: String,
    #[serde(rename = "timestamp")]
    pub unix_timestamp_seconds: i64,
    /// Topic the event arrived on (kept for logs and the journal)
    #[serde(skip)]
    pub topic: String,
}

/// Aggregate counters exposed to push clients and the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub devices: u64,
    pub clients: u64,
    pub connection_state: ConnectionState,
    pub messages_received: u64,
    pub telemetry_events: u64,
    pub tolerated_events: u64,
    pub dropped_messages: u64,
    pub decode_errors: u64,
    pub broadcasts: u64,
    pub reconnects: u64,
    pub uptime_secs: u64,
}

/// Every payload shape ever sent to a push client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Welcome { stats: StatsSnapshot },
    #[serde(rename = "conversation_stats")]
    Telemetry(TelemetryEvent),
    Ping,
    Pong,
}

impl BroadcastMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages a push client may send to the hub
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
}
