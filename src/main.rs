//! Telemetry bridge - relays device telemetry from MQTT to WebSocket clients
//!
//! Module structure:
//! - `domain/` - Core types (DeviceConfig, TelemetryEvent, ConnectionState)
//! - `io/` - External interfaces (MQTT link, lookup, push server, HTTP API, journal)
//! - `services/` - Bridge logic (TopicResolver, ConnectionManager, classifier, hub)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use std::sync::Arc;
use telemetry_bridge::infra::{Config, Metrics};
use telemetry_bridge::io::{
    ConfigSource, HttpConfigSource, Journal, RumqttConnector, StaticConfigSource,
};
use telemetry_bridge::services::{Bridge, TelemetrySink};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Telemetry bridge - MQTT device telemetry to WebSocket push clients
#[derive(Parser, Debug)]
#[command(name = "telemetry-bridge", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug for per-message visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "telemetry-bridge starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    if config.broker_embedded() {
        telemetry_bridge::infra::broker::start_embedded_broker(
            config.broker_bind_address(),
            config.broker_port(),
        );
    }

    info!(
        config_file = %config.config_file(),
        lookup_url = %config.lookup_url().unwrap_or("-"),
        static_devices = %config.devices().len(),
        push_port = %config.push_port(),
        http_port = %config.http_port(),
        stabilize_delay_ms = %config.stabilize_delay().as_millis(),
        reconnect_interval_ms = %config.reconnect_interval().as_millis(),
        diagnostic_topic = %config.diagnostic_topic().unwrap_or("-"),
        status_topic = %config.status_topic().unwrap_or("-"),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let source: Arc<dyn ConfigSource> = match config.lookup_url() {
        Some(url) => Arc::new(HttpConfigSource::new(url, config.lookup_timeout())?),
        None => {
            let endpoint = format!("localhost:{}", config.broker_port());
            info!(default_endpoint = %endpoint, "using_static_device_configs");
            Arc::new(StaticConfigSource::new(config.devices(), endpoint))
        }
    };

    let sink: Option<Arc<dyn TelemetrySink>> =
        config.journal_file().map(|path| Arc::new(Journal::new(path)) as Arc<dyn TelemetrySink>);

    let bridge = Arc::new(Bridge::new(
        &config,
        source,
        Arc::new(RumqttConnector),
        metrics.clone(),
        sink,
    ));
    bridge.start();

    // Push server
    let push_hub = bridge.hub();
    let push_port = config.push_port();
    let client_buffer = config.client_buffer();
    let push_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry_bridge::io::push_server::start_push_server(
            push_port,
            push_hub,
            client_buffer,
            push_shutdown,
        )
        .await
        {
            error!(error = %e, "push_server_error");
        }
    });

    // Management HTTP API (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let http_bridge = bridge.clone();
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                telemetry_bridge::io::http_api::start_http_server(http_port, http_bridge, http_shutdown)
                    .await
            {
                error!(error = %e, "http_api_error");
            }
        });
    }

    // Metrics reporter
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    // Devices declared in the config file
    for entry in config.devices().iter().cloned() {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let outcome = bridge.add_device(&entry.device_id, &entry.client_id).await;
            if !outcome.success {
                warn!(
                    device_id = %entry.device_id,
                    error = %outcome.error.unwrap_or_default(),
                    "static_device_registration_failed"
                );
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);
    bridge.shutdown().await;

    info!("telemetry-bridge shutdown complete");
    Ok(())
}
