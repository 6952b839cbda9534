//! Device configuration lookup
//!
//! `HttpConfigSource` asks the remote lookup service for a device's broker
//! credentials. `StaticConfigSource` serves devices listed in the config file,
//! for local development without the lookup service.

use crate::domain::device::DeviceConfig;
use crate::domain::errors::FetchError;
use crate::infra::config::DeviceEntry;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, device_id: &str, client_id: &str) -> Result<DeviceConfig, FetchError>;
}

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    mac_address: &'a str,
    uuid: &'a str,
}

/// MQTT section of a lookup response
#[derive(Debug, Default, Deserialize)]
struct MqttCredentials {
    endpoint: Option<String>,
    username: Option<String>,
    #[serde(alias = "secret")]
    password: Option<String>,
    publish_topic: Option<String>,
    client_id: Option<String>,
}

/// Parse a lookup response body, either `{"mqtt":{...}}` or the flat object
pub fn parse_lookup_response(device_id: &str, body: &[u8]) -> Result<DeviceConfig, FetchError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let section = match value.get("mqtt") {
        Some(mqtt) if mqtt.is_object() => mqtt.clone(),
        Some(_) => return Err(FetchError::Malformed("mqtt section is not an object".to_string())),
        None if value.is_object() => value,
        None => return Err(FetchError::Malformed("response is not an object".to_string())),
    };

    let credentials: MqttCredentials =
        serde_json::from_value(section).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let endpoint = non_empty(credentials.endpoint).ok_or(FetchError::MissingCredentials("endpoint"))?;
    let username = non_empty(credentials.username);
    let password = non_empty(credentials.password);
    if username.is_some() && password.is_none() {
        return Err(FetchError::MissingCredentials("password"));
    }

    Ok(DeviceConfig {
        device_id: device_id.to_string(),
        client_credential_id: non_empty(credentials.client_id),
        broker_endpoint: endpoint,
        username,
        secret: password,
        publish_topic: non_empty(credentials.publish_topic),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Lookup over HTTP
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpConfigSource {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // One client for connection pooling
        let client = reqwest::Client::builder().timeout(timeout).http1_only().build()?;
        info!(url = %url, timeout_ms = %timeout.as_millis(), "config_lookup_initialized");
        Ok(Self { client, url: url.to_string(), timeout })
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self, device_id: &str, client_id: &str) -> Result<DeviceConfig, FetchError> {
        let body = serde_json::to_vec(&LookupRequest { mac_address: device_id, uuid: client_id })
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header("Device-Id", device_id)
            .header("Client-Id", client_id)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    FetchError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(device_id = %device_id, status = %status.as_u16(), "config_lookup_rejected");
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Http(e.to_string()))?;
        debug!(device_id = %device_id, bytes = %bytes.len(), "config_lookup_response");
        parse_lookup_response(device_id, &bytes)
    }
}

/// Devices declared in the config file
pub struct StaticConfigSource {
    entries: Vec<DeviceEntry>,
    /// Endpoint used for entries that do not name one
    default_endpoint: String,
}

impl StaticConfigSource {
    pub fn new(entries: &[DeviceEntry], default_endpoint: impl Into<String>) -> Self {
        Self { entries: entries.to_vec(), default_endpoint: default_endpoint.into() }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self, device_id: &str, client_id: &str) -> Result<DeviceConfig, FetchError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.device_id == device_id)
            .ok_or_else(|| FetchError::UnknownDevice(device_id.to_string()))?;

        if !entry.client_id.is_empty() && !client_id.is_empty() && entry.client_id != client_id {
            return Err(FetchError::UnknownDevice(format!("{} (client {})", device_id, client_id)));
        }

        let endpoint = entry.endpoint.clone().unwrap_or_else(|| self.default_endpoint.clone());
        let mut config = DeviceConfig::new(device_id, endpoint);
        config.client_credential_id = non_empty(entry.mqtt_client_id.clone());
        config.username = non_empty(entry.username.clone());
        config.secret = non_empty(entry.password.clone());
        config.publish_topic = non_empty(entry.publish_topic.clone());
        Ok(config)
    }
}
