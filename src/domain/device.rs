//! Device configuration and the device registry
//!
//! The registry is append/update-only and has exactly one writer (the bridge).
//! Everything else gets a `DeviceView`, which can only take snapshots.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Broker credentials and topics for one device, as returned by the lookup service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    /// MQTT client identifier issued for this device (also drives the inbox topic)
    pub client_credential_id: Option<String>,
    pub broker_endpoint: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Topic the device itself publishes on
    pub publish_topic: Option<String>,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, broker_endpoint: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            client_credential_id: None,
            broker_endpoint: broker_endpoint.into(),
            username: None,
            secret: None,
            publish_topic: None,
        }
    }

    pub fn with_client_credential_id(mut self, id: impl Into<String>) -> Self {
        self.client_credential_id = Some(id.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.secret = Some(secret.into());
        self
    }

    pub fn with_publish_topic(mut self, topic: impl Into<String>) -> Self {
        self.publish_topic = Some(topic.into());
        self
    }
}

/// Writer handle for the device map, keyed by `device_id` in registration order
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<Vec<DeviceConfig>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device. Returns true if the device was new.
    pub fn upsert(&self, config: DeviceConfig) -> bool {
        let mut devices = self.devices.write();
        match devices.iter_mut().find(|d| d.device_id == config.device_id) {
            Some(existing) => {
                *existing = config;
                false
            }
            None => {
                devices.push(config);
                true
            }
        }
    }

    /// Read-only handle sharing the same storage
    pub fn view(&self) -> DeviceView {
        DeviceView { devices: self.devices.clone() }
    }
}

/// Read-only handle for the device map
#[derive(Debug, Clone, Default)]
pub struct DeviceView {
    devices: Arc<RwLock<Vec<DeviceConfig>>>,
}

impl DeviceView {
    /// Copy of all device configs in registration order
    pub fn snapshot(&self) -> Vec<DeviceConfig> {
        self.devices.read().clone()
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceConfig> {
        self.devices.read().iter().find(|d| d.device_id == device_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.read().iter().map(|d| d.device_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// True if some registered device publishes on `topic`
    pub fn is_device_publish_topic(&self, topic: &str) -> bool {
        self.devices.read().iter().any(|d| d.publish_topic.as_deref() == Some(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_registration_order() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(DeviceConfig::new("a", "broker:1883")));
        assert!(registry.upsert(DeviceConfig::new("b", "broker:1883")));
        assert!(!registry.upsert(DeviceConfig::new("a", "other:1883")));

        let view = registry.view();
        assert_eq!(view.ids(), vec!["a", "b"]);
        assert_eq!(view.get("a").unwrap().broker_endpoint, "other:1883");
    }

    #[test]
    fn test_view_sees_later_writes() {
        let registry = DeviceRegistry::new();
        let view = registry.view();
        assert!(view.is_empty());

        registry.upsert(DeviceConfig::new("a", "broker").with_publish_topic("device-server"));
        assert_eq!(view.len(), 1);
        assert!(view.is_device_publish_topic("device-server"));
        assert!(!view.is_device_publish_topic("devices/p2p/a"));
    }

    #[test]
    fn test_secret_not_serialized() {
        let config = DeviceConfig::new("a", "broker").with_credentials("user", "hunter2");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"username\":\"user\""));
        assert!(!json.contains("hunter2"));
    }
}
