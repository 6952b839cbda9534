//! MQTT transport for the connection manager
//!
//! `BrokerLink` is the seam between the connection state machine and the
//! wire. The rumqttc implementation maps eventloop events onto `LinkEvent`
//! and keeps track of which SUBSCRIBE each SUBACK answers so failures can be
//! reported per topic.

use crate::domain::device::DeviceConfig;
use crate::domain::errors::{ConnectError, LinkError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode, Transport,
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Request queue capacity between the client handle and the eventloop
const REQUEST_CAPACITY: usize = 100;

/// Upper bound for flushing the offline marker and DISCONNECT on close
const CLOSE_DRAIN: Duration = Duration::from_millis(500);

/// Offline marker published before a graceful disconnect and used as last will
pub const OFFLINE_MARKER: &str = r#"{"type":"bridge_status","status":"offline"}"#;

/// Online marker published after subscriptions are applied
pub const ONLINE_MARKER: &str = r#"{"type":"bridge_status","status":"online"}"#;

/// What the transport observed since the last poll
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// CONNACK with a success return code
    Connected,
    /// Broker refused the handshake (bad credentials, not authorized, ...)
    Rejected(String),
    /// Transport failed or closed; the next poll starts a fresh attempt
    Lost(String),
    /// Inbound PUBLISH
    Message { topic: String, payload: Bytes },
    SubscribeAcked { topic: String },
    SubscribeFailed { topic: String },
    /// Anything else (pings, acks, outgoing notifications)
    Idle,
}

/// Transport owned exclusively by the connection actor
#[async_trait]
pub trait BrokerLink: Send {
    /// Drive the transport until the next event.
    ///
    /// The owner drops the link after `Lost` or `Rejected` and opens a new one.
    async fn poll(&mut self) -> LinkEvent;

    /// Queue a SUBSCRIBE without waiting for the network
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;

    /// Queue a QoS 0 PUBLISH without waiting for the network
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), LinkError>;

    /// Best-effort graceful shutdown of a connected transport
    async fn close(&mut self, farewell: Option<(String, Bytes)>);
}

/// Transport parameters that come from bridge configuration, not the device
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub keep_alive: Duration,
    pub status_topic: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self { keep_alive: Duration::from_secs(30), status_topic: None }
    }
}

/// Creates transports; opening must not perform network I/O
pub trait LinkConnector: Send + Sync {
    fn open(
        &self,
        config: &DeviceConfig,
        settings: &LinkSettings,
    ) -> Result<Box<dyn BrokerLink>, ConnectError>;
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `host`, `host:port`, and `mqtt://`, `tcp://`, `mqtts://`, `ssl://` URLs
    pub fn parse(endpoint: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidEndpoint(endpoint.to_string());
        let trimmed = endpoint.trim();

        let (rest, tls) = match trimmed.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => (rest, false),
            Some(("mqtts" | "ssl" | "tls", rest)) => (rest, true),
            Some(_) => return Err(invalid()),
            None => (trimmed, false),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT }),
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        Ok(Self { host: host.to_string(), port, tls })
    }
}

/// Build rumqttc options for a device config
pub fn mqtt_options(
    config: &DeviceConfig,
    settings: &LinkSettings,
) -> Result<MqttOptions, ConnectError> {
    let endpoint = BrokerEndpoint::parse(&config.broker_endpoint)?;

    let client_id = config
        .client_credential_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("telemetry-bridge-{}", std::process::id()));

    let mut options = MqttOptions::new(client_id, endpoint.host, endpoint.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);

    if let Some(username) = config.username.as_deref() {
        options.set_credentials(username, config.secret.as_deref().unwrap_or_default());
    }

    if let Some(topic) = settings.status_topic.as_deref() {
        options.set_last_will(LastWill::new(topic, OFFLINE_MARKER, QoS::AtMostOnce, false));
    }

    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

/// rumqttc-backed connector
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl LinkConnector for RumqttConnector {
    fn open(
        &self,
        config: &DeviceConfig,
        settings: &LinkSettings,
    ) -> Result<Box<dyn BrokerLink>, ConnectError> {
        let options = mqtt_options(config, settings)?;
        info!(
            endpoint = %config.broker_endpoint,
            client_id = %options.client_id(),
            "mqtt_link_opened"
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Box::new(RumqttLink::new(client, eventloop)))
    }
}

/// rumqttc client plus its eventloop
pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Topics queued for SUBSCRIBE, in request order
    queued_subscriptions: VecDeque<String>,
    /// Packet id -> topic for SUBSCRIBEs on the wire
    inflight_subscriptions: FxHashMap<u16, String>,
}

impl RumqttLink {
    pub fn new(client: AsyncClient, eventloop: EventLoop) -> Self {
        Self {
            client,
            eventloop,
            queued_subscriptions: VecDeque::new(),
            inflight_subscriptions: FxHashMap::default(),
        }
    }

    fn reset_subscription_tracking(&mut self) {
        self.queued_subscriptions.clear();
        self.inflight_subscriptions.clear();
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn poll(&mut self) -> LinkEvent {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    LinkEvent::Connected
                } else {
                    self.reset_subscription_tracking();
                    LinkEvent::Rejected(format!("{:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                LinkEvent::Message { topic: publish.topic, payload: publish.payload }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let topic = self
                    .inflight_subscriptions
                    .remove(&ack.pkid)
                    .unwrap_or_else(|| format!("<pkid {}>", ack.pkid));
                if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                    LinkEvent::SubscribeFailed { topic }
                } else {
                    LinkEvent::SubscribeAcked { topic }
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Some(topic) = self.queued_subscriptions.pop_front() {
                    self.inflight_subscriptions.insert(pkid, topic);
                }
                LinkEvent::Idle
            }
            Ok(_) => LinkEvent::Idle,
            Err(ConnectionError::ConnectionRefused(code)) => {
                self.reset_subscription_tracking();
                LinkEvent::Rejected(format!("{:?}", code))
            }
            Err(e) => {
                self.reset_subscription_tracking();
                LinkEvent::Lost(e.to_string())
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| LinkError(e.to_string()))?;
        self.queued_subscriptions.push_back(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| LinkError(e.to_string()))
    }

    async fn close(&mut self, farewell: Option<(String, Bytes)>) {
        if let Some((topic, payload)) = farewell {
            if let Err(e) = self.publish(&topic, payload) {
                debug!(error = %e, "mqtt_offline_marker_failed");
            }
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "mqtt_disconnect_request_failed");
            return;
        }

        let eventloop = &mut self.eventloop;
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_DRAIN, drain).await.is_err() {
            debug!("mqtt_close_drain_timeout");
        }
    }
}
