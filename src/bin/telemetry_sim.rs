//! Device simulator - publishes telemetry payloads to a broker
//!
//! Useful against the embedded broker to watch events reach push clients.
//!
//! Usage:
//!   cargo run --bin telemetry-sim -- --topic devices/aa_bb/out --count 5

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "telemetry-sim")]
#[command(about = "Publish simulated device telemetry")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic to publish to
    #[arg(short, long, default_value = "device-server")]
    topic: String,

    /// Number of events to publish
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Pause between events in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Omit the `type` marker so the bridge has to accept the payload by shape
    #[arg(long)]
    untyped: bool,

    /// Interleave non-telemetry chatter between events
    #[arg(long)]
    noise: bool,
}

fn telemetry_payload(seq: u32, untyped: bool) -> serde_json::Value {
    let mut payload = json!({
        "session_id": format!("sim-{}", seq),
        "duration": 1.5 + f64::from(seq % 10),
        "reason": if seq % 3 == 0 { "user_hangup" } else { "tts_stop" },
        "timestamp": chrono::Utc::now().timestamp(),
    });
    if !untyped {
        payload["type"] = json!("conversation_stats");
    }
    payload
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let client_id = format!("telemetry-sim-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Drive the event loop until every publish is acknowledged
    let expected_acks = args.count as usize + if args.noise { args.count as usize } else { 0 };
    let driver = tokio::spawn(async move {
        let mut acks = 0usize;
        while acks < expected_acks {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_connected"),
                Ok(Event::Incoming(Packet::PubAck(_))) => acks += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "sim_connection_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    for seq in 0..args.count {
        if args.noise {
            let chatter = json!({"type": "heartbeat", "seq": seq}).to_string();
            if let Err(e) = client.publish(&args.topic, QoS::AtLeastOnce, false, chatter).await {
                warn!(error = %e, "sim_publish_failed");
            }
        }

        let payload = telemetry_payload(seq, args.untyped).to_string();
        match client.publish(&args.topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => info!(seq = %seq, topic = %args.topic, "sim_event_published"),
            Err(e) => warn!(seq = %seq, error = %e, "sim_publish_failed"),
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    if tokio::time::timeout(Duration::from_secs(10), driver).await.is_err() {
        warn!("sim_ack_timeout");
    }
    let _ = client.disconnect().await;
    info!(count = %args.count, "sim_done");
}
