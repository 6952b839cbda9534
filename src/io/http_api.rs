//! Management HTTP endpoint
//!
//! Device registration, stats, and Prometheus text metrics on one hyper
//! http1 server.

use crate::domain::errors::PublishError;
use crate::domain::types::StatsSnapshot;
use crate::infra::metrics::Metrics;
use crate::services::bridge::Bridge;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(stats: &StatsSnapshot, metrics: &Metrics) -> String {
    let mut output = String::with_capacity(2048);

    write_metric(&mut output, "bridge_devices", "Registered devices", MetricType::Gauge, stats.devices);
    write_metric(&mut output, "bridge_clients", "Connected push clients", MetricType::Gauge, stats.clients);
    write_metric(
        &mut output,
        "bridge_connection_state",
        "Broker connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=closed)",
        MetricType::Gauge,
        stats.connection_state.code(),
    );
    write_metric(
        &mut output,
        "bridge_messages_received_total",
        "Publishes received from the broker",
        MetricType::Counter,
        stats.messages_received,
    );
    write_metric(
        &mut output,
        "bridge_telemetry_events_total",
        "Messages classified as telemetry",
        MetricType::Counter,
        stats.telemetry_events,
    );
    write_metric(
        &mut output,
        "bridge_tolerated_events_total",
        "Telemetry accepted without the marker type",
        MetricType::Counter,
        stats.tolerated_events,
    );
    write_metric(
        &mut output,
        "bridge_dropped_messages_total",
        "Inbound messages dropped on a full pipeline",
        MetricType::Counter,
        stats.dropped_messages,
    );
    write_metric(
        &mut output,
        "bridge_decode_errors_total",
        "Payloads that were not JSON objects",
        MetricType::Counter,
        stats.decode_errors,
    );
    write_metric(&mut output, "bridge_broadcasts_total", "Telemetry broadcasts", MetricType::Counter, stats.broadcasts);
    write_metric(&mut output, "bridge_reconnects_total", "Broker reconnect cycles", MetricType::Counter, stats.reconnects);
    write_metric(
        &mut output,
        "bridge_subscription_failures_total",
        "Failed topic subscriptions",
        MetricType::Counter,
        metrics.subscription_failures(),
    );
    write_metric(
        &mut output,
        "bridge_clients_dropped_total",
        "Push clients dropped after a failed send",
        MetricType::Counter,
        metrics.clients_dropped(),
    );
    write_metric(
        &mut output,
        "bridge_clients_evicted_total",
        "Push clients evicted by the liveness probe",
        MetricType::Counter,
        metrics.clients_evicted(),
    );
    write_metric(&mut output, "bridge_uptime_seconds", "Process uptime", MetricType::Gauge, stats.uptime_secs);

    output
}

#[derive(Debug, Deserialize)]
struct AddDeviceRequest {
    device_id: String,
    #[serde(default)]
    client_id: String,
}

#[derive(Serialize)]
struct ApiResult<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn error_response(status: StatusCode, error: &str) -> Response<Full<Bytes>> {
    json_response(status, &ApiResult { success: false, error: Some(error) })
}

/// `/devices/{id}/messages` -> `id`
fn message_target(path: &str) -> Option<&str> {
    path.strip_prefix("/devices/")
        .and_then(|rest| rest.strip_suffix("/messages"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

async fn read_body(req: Request<hyper::body::Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    bridge: Arc<Bridge>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&bridge.stats(), &bridge.metrics());
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/stats") => Ok(json_response(StatusCode::OK, &bridge.stats())),
        (&Method::GET, "/devices") => Ok(json_response(StatusCode::OK, &bridge.list_devices())),
        (&Method::POST, "/devices") => {
            let body = match read_body(req).await {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            let request: AddDeviceRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
            };
            let outcome = bridge.add_device(&request.device_id, &request.client_id).await;
            let status = if outcome.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
            info!(device_id = %request.device_id, success = %outcome.success, "api_add_device");
            Ok(json_response(status, &outcome))
        }
        (&Method::POST, _) if message_target(&path).is_some() => {
            let device_id = message_target(&path).unwrap_or_default().to_string();
            let body = match read_body(req).await {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            match bridge.send_to_device(&device_id, body).await {
                Ok(()) => Ok(json_response(StatusCode::OK, &ApiResult { success: true, error: None })),
                Err(e) => {
                    let status = match e {
                        PublishError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                        _ => StatusCode::SERVICE_UNAVAILABLE,
                    };
                    Ok(error_response(status, &e.to_string()))
                }
            }
        }
        (&Method::OPTIONS, _) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the management HTTP server
pub async fn start_http_server(
    port: u16,
    bridge: Arc<Bridge>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve_http(listener, bridge, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve_http(listener: TcpListener, bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(port = %port, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let bridge = bridge.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let bridge = bridge.clone();
                                async move { handle_request(req, bridge).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_api_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return;
                }
            }
        }
    }
}
