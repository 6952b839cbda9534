//! Configuration loading from TOML files
//!
//! The binary selects the file with `--config` (default: config/dev.toml).
//!
//! Every section is optional; missing values fall back to the defaults below.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pause between CONNACK and the first SUBSCRIBE
    #[serde(default = "default_stabilize_delay_ms")]
    pub stabilize_delay_ms: u64,
    /// Fixed backoff between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    /// Topic for online/offline markers and the last will (disabled when unset)
    #[serde(default)]
    pub status_topic: Option<String>,
    /// Also subscribe to `diagnostic_topic` for visibility into all traffic
    #[serde(default)]
    pub diagnostic_subscribe: bool,
    #[serde(default = "default_diagnostic_topic")]
    pub diagnostic_topic: String,
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_stabilize_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_inbound_buffer() -> usize {
    1000
}

fn default_diagnostic_topic() -> String {
    "#".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stabilize_delay_ms: default_stabilize_delay_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            inbound_buffer: default_inbound_buffer(),
            status_topic: None,
            diagnostic_subscribe: false,
            diagnostic_topic: default_diagnostic_topic(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    /// Prefix of the per-device inbox topic
    #[serde(default = "default_inbox_prefix")]
    pub inbox_prefix: String,
    /// Prefix of the fallback wildcard subscription
    #[serde(default = "default_wildcard_prefix")]
    pub wildcard_prefix: String,
    /// `type` tag that marks a telemetry payload
    #[serde(default = "default_telemetry_marker")]
    pub telemetry_marker: String,
}

fn default_inbox_prefix() -> String {
    "devices/p2p/".to_string()
}

fn default_wildcard_prefix() -> String {
    "devices/".to_string()
}

fn default_telemetry_marker() -> String {
    "conversation_stats".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            inbox_prefix: default_inbox_prefix(),
            wildcard_prefix: default_wildcard_prefix(),
            telemetry_marker: default_telemetry_marker(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    /// Device configuration service URL (static `[[devices]]` entries are used when unset)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_lookup_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_lookup_timeout_ms() -> u64 {
    5_000
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self { url: None, timeout_ms: default_lookup_timeout_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// WebSocket listener port (0 to disable)
    #[serde(default = "default_push_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Outbound queue depth per client before it is considered failed
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

fn default_push_port() -> u16 {
    8080
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_client_buffer() -> usize {
    256
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            port: default_push_port(),
            ping_interval_secs: default_ping_interval_secs(),
            client_buffer: default_client_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Management API port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8081
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JournalConfig {
    /// JSONL file receiving every telemetry event (disabled when unset)
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Start an in-process rumqttd broker (local development)
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

/// Device registered at startup
///
/// With a lookup URL only `device_id`/`client_id` are used; without one the
/// remaining fields form the static device configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub device_id: String,
    /// Application client id presented by the caller of `add_device`
    #[serde(default)]
    pub client_id: String,
    /// Broker endpoint; falls back to the embedded broker address
    #[serde(default)]
    pub endpoint: Option<String>,
    /// MQTT client id issued for the device (drives the inbox topic)
    #[serde(default)]
    pub mqtt_client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub publish_topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    mqtt: MqttConfig,
    topics: TopicsConfig,
    lookup: LookupConfig,
    push: PushConfig,
    http: HttpConfig,
    journal: JournalConfig,
    metrics: MetricsConfig,
    broker: BrokerConfig,
    devices: Vec<DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            config_file,
            mqtt: toml_config.mqtt,
            topics: toml_config.topics,
            lookup: toml_config.lookup,
            push: toml_config.push,
            http: toml_config.http,
            journal: toml_config.journal,
            metrics: toml_config.metrics,
            broker: toml_config.broker,
            devices: toml_config.devices,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", source))?;
        Ok(Self::from_toml(toml_config, source.to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // MQTT
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt.connect_timeout_ms)
    }

    pub fn stabilize_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.stabilize_delay_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt.reconnect_interval_ms)
    }

    pub fn inbound_buffer(&self) -> usize {
        self.mqtt.inbound_buffer.max(1)
    }

    pub fn status_topic(&self) -> Option<&str> {
        self.mqtt.status_topic.as_deref().filter(|t| !t.is_empty())
    }

    /// Diagnostic catch-all topic, only when the feature flag is on
    pub fn diagnostic_topic(&self) -> Option<&str> {
        if self.mqtt.diagnostic_subscribe {
            Some(self.mqtt.diagnostic_topic.as_str())
        } else {
            None
        }
    }

    // Topics
    pub fn inbox_prefix(&self) -> &str {
        &self.topics.inbox_prefix
    }

    pub fn wildcard_prefix(&self) -> &str {
        &self.topics.wildcard_prefix
    }

    pub fn telemetry_marker(&self) -> &str {
        &self.topics.telemetry_marker
    }

    // Lookup
    pub fn lookup_url(&self) -> Option<&str> {
        self.lookup.url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup.timeout_ms)
    }

    // Push
    pub fn push_port(&self) -> u16 {
        self.push.port
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.push.ping_interval_secs.max(1))
    }

    pub fn client_buffer(&self) -> usize {
        self.push.client_buffer.max(1)
    }

    pub fn http_port(&self) -> u16 {
        self.http.port
    }

    pub fn journal_file(&self) -> Option<&str> {
        self.journal.file.as_deref().filter(|f| !f.is_empty())
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs.max(1)
    }

    // Embedded broker
    pub fn broker_embedded(&self) -> bool {
        self.broker.embedded
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        &self.devices
    }

    /// Builder method for tests to shorten MQTT timers
    pub fn with_mqtt_timers(
        mut self,
        stabilize_delay_ms: u64,
        reconnect_interval_ms: u64,
        connect_timeout_ms: u64,
    ) -> Self {
        self.mqtt.stabilize_delay_ms = stabilize_delay_ms;
        self.mqtt.reconnect_interval_ms = reconnect_interval_ms;
        self.mqtt.connect_timeout_ms = connect_timeout_ms;
        self
    }

    /// Builder method for tests to toggle the diagnostic subscription
    pub fn with_diagnostic_subscribe(mut self, enabled: bool) -> Self {
        self.mqtt.diagnostic_subscribe = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stabilize_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.inbox_prefix(), "devices/p2p/");
        assert_eq!(config.telemetry_marker(), "conversation_stats");
        assert_eq!(config.push_port(), 8080);
        assert_eq!(config.http_port(), 8081);
        assert!(config.lookup_url().is_none());
        assert!(config.status_topic().is_none());
        assert!(config.devices().is_empty());
    }

    #[test]
    fn test_diagnostic_topic_behind_flag() {
        let config = Config::default();
        assert_eq!(config.diagnostic_topic(), None);

        let config = config.with_diagnostic_subscribe(true);
        assert_eq!(config.diagnostic_topic(), Some("#"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
[mqtt]
stabilize_delay_ms = 250
status_topic = "bridge/status"

[[devices]]
device_id = "aa:bb:cc:dd:ee:ff"
client_id = "GID_test@@@aa_bb_cc_dd_ee_ff"
"#,
            "inline",
        )
        .unwrap();

        assert_eq!(config.stabilize_delay(), Duration::from_millis(250));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.status_topic(), Some("bridge/status"));
        assert_eq!(config.devices().len(), 1);
        assert_eq!(config.devices()[0].device_id, "aa:bb:cc:dd:ee:ff");
        assert!(config.devices()[0].endpoint.is_none());
    }

    #[test]
    fn test_empty_strings_treated_as_unset() {
        let config = Config::from_toml_str(
            r#"
[mqtt]
status_topic = ""

[lookup]
url = ""

[journal]
file = ""
"#,
            "inline",
        )
        .unwrap();

        assert!(config.status_topic().is_none());
        assert!(config.lookup_url().is_none());
        assert!(config.journal_file().is_none());
    }
}
