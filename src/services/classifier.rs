//! Inbound message classification
//!
//! Decides which broker messages are telemetry. Two paths produce an event:
//! - the payload's `type` equals the telemetry marker
//! - tolerant path: the payload arrived on a registered device's own publish
//!   topic and carries `duration` and `session_id`, whatever its `type` says
//!   (device firmware versions disagree on the tag)
//!
//! Everything else is dropped with a trace log. Decode failures are counted
//! and never propagated.

use crate::domain::device::DeviceView;
use crate::domain::types::{unix_now, InboundMessage, TelemetryEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::hub::BroadcastHub;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Reason used when the payload does not carry one
pub const UNKNOWN_REASON: &str = "unknown";

/// Receives every classified event before it is broadcast
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

pub struct MessageClassifier {
    marker: String,
    devices: DeviceView,
    metrics: Arc<Metrics>,
}

impl MessageClassifier {
    pub fn new(marker: impl Into<String>, devices: DeviceView, metrics: Arc<Metrics>) -> Self {
        Self { marker: marker.into(), devices, metrics }
    }

    pub fn from_config(config: &Config, devices: DeviceView, metrics: Arc<Metrics>) -> Self {
        Self::new(config.telemetry_marker(), devices, metrics)
    }

    pub fn classify(&self, topic: &str, payload: &[u8]) -> Option<TelemetryEvent> {
        let Some(object) = self.decode(topic, payload) else {
            self.metrics.record_decode_error();
            return None;
        };

        let message_type = object.get("type").and_then(Value::as_str);
        let session_id = object.get("session_id").and_then(Value::as_str);
        let duration = object.get("duration").and_then(Value::as_f64);

        if message_type == Some(self.marker.as_str()) {
            return match (session_id, duration) {
                (Some(session_id), Some(duration)) => {
                    Some(self.accept(topic, &object, session_id, duration, false))
                }
                _ => {
                    debug!(
                        topic = %topic,
                        has_session_id = %session_id.is_some(),
                        has_duration = %duration.is_some(),
                        "telemetry_missing_fields"
                    );
                    None
                }
            };
        }

        if let (Some(session_id), Some(duration)) = (session_id, duration) {
            if self.devices.is_device_publish_topic(topic) {
                info!(
                    topic = %topic,
                    message_type = %message_type.unwrap_or("-"),
                    session_id = %session_id,
                    "telemetry_tolerated"
                );
                return Some(self.accept(topic, &object, session_id, duration, true));
            }
        }

        trace!(topic = %topic, message_type = %message_type.unwrap_or("-"), "message_ignored");
        None
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Option<Map<String, Value>> {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                debug!(topic = %topic, bytes = %payload.len(), error = %e, "payload_not_utf8");
                return None;
            }
        };
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => Some(object),
            Ok(_) => {
                debug!(topic = %topic, "payload_not_object");
                None
            }
            Err(e) => {
                debug!(topic = %topic, error = %e, "payload_not_json");
                None
            }
        }
    }

    fn accept(
        &self,
        topic: &str,
        object: &Map<String, Value>,
        session_id: &str,
        duration: f64,
        tolerated: bool,
    ) -> TelemetryEvent {
        self.metrics.record_telemetry(tolerated);

        let reason = object.get("reason").and_then(Value::as_str).unwrap_or(UNKNOWN_REASON);
        let timestamp = object
            .get("timestamp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.trunc() as i64)))
            .unwrap_or_else(unix_now);

        TelemetryEvent {
            session_id: session_id.to_string(),
            duration_seconds: duration,
            reason: reason.to_string(),
            unix_timestamp_seconds: timestamp,
            topic: topic.to_string(),
        }
    }
}

/// Consume inbound messages until the connection manager goes away
pub async fn run_pipeline(
    mut inbound: mpsc::Receiver<InboundMessage>,
    classifier: MessageClassifier,
    hub: Arc<BroadcastHub>,
    sink: Option<Arc<dyn TelemetrySink>>,
) {
    info!("classifier_pipeline_started");
    while let Some(message) = inbound.recv().await {
        let Some(event) = classifier.classify(&message.topic, &message.payload) else {
            continue;
        };
        if let Some(sink) = &sink {
            sink.record(&event);
        }
        hub.broadcast(&event);
    }
    info!("classifier_pipeline_stopped");
}
