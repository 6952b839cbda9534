//! Bridge facade - wires the device registry, connection manager, classifier
//! and hub together and exposes the management operations.

use crate::domain::device::{DeviceConfig, DeviceRegistry};
use crate::domain::errors::{FetchError, PublishError};
use crate::domain::types::{InboundMessage, StatsSnapshot};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::lookup::ConfigSource;
use crate::io::mqtt::LinkConnector;
use crate::services::classifier::{run_pipeline, MessageClassifier, TelemetrySink};
use crate::services::connection::{ConnectionManager, ManagerSettings};
use crate::services::hub::BroadcastHub;
use crate::services::topic_resolver::TopicResolver;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of `add_device`, serialized as-is by the management API
#[derive(Debug, Clone, Serialize)]
pub struct AddDeviceOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<DeviceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AddDeviceOutcome {
    fn ok(config: DeviceConfig) -> Self {
        Self { success: true, config: Some(config), error: None }
    }

    fn failed(error: impl ToString) -> Self {
        Self { success: false, config: None, error: Some(error.to_string()) }
    }
}

/// Pipeline inputs held until `start`
struct PipelineParts {
    inbound: mpsc::Receiver<InboundMessage>,
    classifier: MessageClassifier,
    sink: Option<Arc<dyn TelemetrySink>>,
}

pub struct Bridge {
    registry: DeviceRegistry,
    source: Arc<dyn ConfigSource>,
    manager: ConnectionManager,
    hub: Arc<BroadcastHub>,
    metrics: Arc<Metrics>,
    resolver: TopicResolver,
    lookup_timeout: Duration,
    pipeline: Mutex<Option<PipelineParts>>,
}

impl Bridge {
    /// Build the bridge and spawn the connection actor
    pub fn new(
        config: &Config,
        source: Arc<dyn ConfigSource>,
        connector: Arc<dyn LinkConnector>,
        metrics: Arc<Metrics>,
        sink: Option<Arc<dyn TelemetrySink>>,
    ) -> Self {
        let registry = DeviceRegistry::new();
        let resolver = TopicResolver::from_config(config);
        let (manager, inbound) = ConnectionManager::spawn(
            ManagerSettings::from_config(config),
            connector,
            resolver.clone(),
            registry.view(),
            metrics.clone(),
        );
        let classifier = MessageClassifier::from_config(config, registry.view(), metrics.clone());
        let hub = Arc::new(BroadcastHub::new(metrics.clone(), config.ping_interval()));

        Self {
            registry,
            source,
            manager,
            hub,
            metrics,
            resolver,
            lookup_timeout: config.lookup_timeout(),
            pipeline: Mutex::new(Some(PipelineParts { inbound, classifier, sink })),
        }
    }

    /// Start the classifier pipeline. Only the first call has an effect.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let parts = self.pipeline.lock().take()?;
        let hub = self.hub.clone();
        Some(tokio::spawn(run_pipeline(parts.inbound, parts.classifier, hub, parts.sink)))
    }

    /// Look up a device, register it and make sure its topics are subscribed.
    ///
    /// The first device triggers the broker connection; its outcome is
    /// reported here. Later devices only extend the subscription set.
    ///
    /// A device whose lookup succeeded stays registered even when the connect
    /// fails, so it is listed by `list_devices` and subscribed once a later
    /// connect succeeds.
    pub async fn add_device(&self, device_id: &str, client_id: &str) -> AddDeviceOutcome {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return AddDeviceOutcome::failed("device_id is required");
        }

        let fetched = tokio::time::timeout(self.lookup_timeout, self.source.fetch(device_id, client_id))
            .await
            .unwrap_or_else(|_| Err(FetchError::Timeout(self.lookup_timeout.as_millis() as u64)));
        let config = match fetched {
            Ok(config) => config,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "device_lookup_failed");
                return AddDeviceOutcome::failed(e);
            }
        };

        let is_new = self.registry.upsert(config.clone());
        let devices = self.registry.view().len();
        self.metrics.set_devices(devices);
        info!(
            device_id = %device_id,
            endpoint = %config.broker_endpoint,
            new = %is_new,
            devices = %devices,
            "device_registered"
        );

        if let Err(e) = self.manager.connect(config.clone()).await {
            warn!(device_id = %device_id, error = %e, "broker_connect_failed");
            return AddDeviceOutcome::failed(e);
        }
        self.manager.refresh_subscriptions().await;

        AddDeviceOutcome::ok(config)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut stats = self.metrics.snapshot();
        stats.devices = self.registry.view().len() as u64;
        stats.clients = self.hub.client_count() as u64;
        stats.connection_state = self.manager.state();
        stats
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.registry.view().ids()
    }

    /// Publish a raw payload to a registered device's inbox topic
    pub async fn send_to_device(&self, device_id: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.registry.view().get(device_id).is_none() {
            return Err(PublishError::UnknownDevice(device_id.to_string()));
        }
        let topic = self.resolver.inbox_topic(device_id);
        self.manager.publish(&topic, payload).await?;
        info!(device_id = %device_id, topic = %topic, "device_message_sent");
        Ok(())
    }

    /// Close the broker connection and every push client
    pub async fn shutdown(&self) {
        info!("bridge_shutdown");
        self.manager.disconnect().await;
        self.hub.close_all();
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ConnectError;
    use crate::domain::types::ConnectionState;
    use crate::services::connection::testing::{FakeConnector, FakeOutcome};
    use async_trait::async_trait;

    /// Lookup returning `<id>/out` as the publish topic; `slow` never answers in time
    struct FakeSource {
        slow: bool,
    }

    #[async_trait]
    impl ConfigSource for FakeSource {
        async fn fetch(&self, device_id: &str, _client_id: &str) -> Result<DeviceConfig, FetchError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if device_id == "missing" {
                return Err(FetchError::Status(404));
            }
            Ok(DeviceConfig::new(device_id, "broker:1883").with_publish_topic(format!("{}/out", device_id)))
        }
    }

    fn bridge_with(slow: bool) -> (Bridge, FakeConnector) {
        let config = Config::default().with_mqtt_timers(100, 500, 1000);
        let connector = FakeConnector::new();
        let bridge = Bridge::new(
            &config,
            Arc::new(FakeSource { slow }),
            Arc::new(connector.clone()),
            Arc::new(Metrics::new()),
            None,
        );
        (bridge, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_device_connects_and_subscribes() {
        let (bridge, connector) = bridge_with(false);

        let outcome = bridge.add_device("a", "web-1").await;
        assert!(outcome.success);
        assert_eq!(outcome.config.unwrap().publish_topic.as_deref(), Some("a/out"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.subscriptions(0), vec!["a/out"]);

        // Second device reuses the connection and extends the subscriptions
        assert!(bridge.add_device("b", "web-1").await.success);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.subscriptions(0), vec!["a/out", "b/out"]);
        assert_eq!(bridge.list_devices(), vec!["a", "b"]);
        assert_eq!(bridge.stats().devices, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_device_lookup_failure() {
        let (bridge, connector) = bridge_with(false);

        let outcome = bridge.add_device("missing", "web-1").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("404"));
        assert_eq!(connector.opened(), 0);
        assert!(bridge.list_devices().is_empty());

        assert!(!bridge.add_device("  ", "web-1").await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_device_lookup_timeout() {
        let (bridge, _) = bridge_with(true);
        let outcome = bridge.add_device("a", "web-1").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_rejection_reported() {
        let (bridge, connector) = bridge_with(false);
        connector.push_outcome(FakeOutcome::Reject("bad credentials".into()));

        let outcome = bridge.add_device("a", "web-1").await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some(ConnectError::Rejected("bad credentials".into()).to_string().as_str())
        );
        assert_eq!(bridge.stats().connection_state, ConnectionState::Disconnected);
        assert_eq!(bridge.list_devices(), vec!["a"]);

        // Retry with the broker back: the kept registration is subscribed
        assert!(bridge.add_device("a", "web-1").await.success);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.subscriptions(1), vec!["a/out"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_device() {
        let (bridge, connector) = bridge_with(false);
        assert_eq!(
            bridge.send_to_device("aa:bb", Bytes::from_static(b"{}")).await,
            Err(PublishError::UnknownDevice("aa:bb".into()))
        );

        bridge.add_device("aa:bb", "web-1").await;
        bridge.send_to_device("aa:bb", Bytes::from_static(b"{\"type\":\"hello\"}")).await.unwrap();
        assert_eq!(connector.published()[0].0, "devices/p2p/aa_bb");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let (bridge, _) = bridge_with(false);
        assert!(bridge.start().is_some());
        assert!(bridge.start().is_none());

        bridge.add_device("a", "web-1").await;
        let (tx, _rx) = mpsc::channel(8);
        let client = bridge.hub().register(tx);

        bridge.shutdown().await;
        assert_eq!(bridge.stats().connection_state, ConnectionState::Closed);
        assert_eq!(bridge.stats().clients, 0);
        assert!(!client.is_open());

        let outcome = bridge.add_device("b", "web-1").await;
        assert!(!outcome.success);
    }
}
