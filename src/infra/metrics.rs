//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Monotonic counters are never reset; the periodic report swaps the
//! per-interval counters to zero to compute rates.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; do NOT use them for coordination or logic decisions.

use crate::domain::types::{ConnectionState, StatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector shared by every component
pub struct Metrics {
    /// Publishes received from the broker (monotonic)
    messages_received: AtomicU64,
    /// Publishes since last report (reset on report)
    messages_since_report: AtomicU64,
    /// Messages classified as telemetry (monotonic)
    telemetry_events: AtomicU64,
    /// Telemetry accepted through the tolerance rule (monotonic)
    tolerated_events: AtomicU64,
    /// Inbound messages dropped because the pipeline channel was full (monotonic)
    dropped_messages: AtomicU64,
    /// Payloads that were not UTF-8 JSON objects (monotonic)
    decode_errors: AtomicU64,
    /// Telemetry broadcasts (monotonic)
    broadcasts: AtomicU64,
    /// Individual client deliveries since last report (reset on report)
    deliveries_since_report: AtomicU64,
    /// Clients dropped after a failed write (monotonic)
    clients_dropped: AtomicU64,
    /// Clients evicted by the liveness probe (monotonic)
    clients_evicted: AtomicU64,
    /// Transitions into Reconnecting (monotonic)
    reconnects: AtomicU64,
    /// Subscriptions that failed locally or in SUBACK (monotonic)
    subscription_failures: AtomicU64,
    /// Currently registered push clients (gauge)
    clients: AtomicU64,
    /// Currently registered devices (gauge)
    devices: AtomicU64,
    /// Current `ConnectionState` code (gauge)
    connection_state: AtomicU64,
    started_at: Instant,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_since_report: AtomicU64::new(0),
            telemetry_events: AtomicU64::new(0),
            tolerated_events: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            deliveries_since_report: AtomicU64::new(0),
            clients_dropped: AtomicU64::new(0),
            clients_evicted: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            subscription_failures: AtomicU64::new(0),
            clients: AtomicU64::new(0),
            devices: AtomicU64::new(0),
            connection_state: AtomicU64::new(ConnectionState::Disconnected.code()),
            started_at: Instant::now(),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.messages_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_telemetry(&self, tolerated: bool) {
        self.telemetry_events.fetch_add(1, Ordering::Relaxed);
        if tolerated {
            self.tolerated_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_broadcast(&self, delivered: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries_since_report.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_dropped(&self) {
        self.clients_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_evicted(&self) {
        self.clients_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscription_failure(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_clients(&self, count: usize) {
        self.clients.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_devices(&self, count: usize) {
        self.devices.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state.code(), Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_code(self.connection_state.load(Ordering::Relaxed))
    }

    pub fn subscription_failures(&self) -> u64 {
        self.subscription_failures.load(Ordering::Relaxed)
    }

    pub fn clients_dropped(&self) -> u64 {
        self.clients_dropped.load(Ordering::Relaxed)
    }

    pub fn clients_evicted(&self) -> u64 {
        self.clients_evicted.load(Ordering::Relaxed)
    }

    /// Aggregate counters without resetting anything
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            devices: self.devices.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
            connection_state: self.connection_state(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            telemetry_events: self.telemetry_events.load(Ordering::Relaxed),
            tolerated_events: self.tolerated_events.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Generate a periodic report and reset the per-interval counters
    pub fn report(&self) -> MetricsSummary {
        let messages_count = self.messages_since_report.swap(0, Ordering::Relaxed);
        let deliveries = self.deliveries_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let messages_per_sec = if elapsed.as_secs_f64() > 0.0 {
            messages_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            stats: self.snapshot(),
            messages_per_sec,
            deliveries,
            subscription_failures: self.subscription_failures(),
            clients_dropped: self.clients_dropped(),
            clients_evicted: self.clients_evicted(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of metrics for a reporting interval
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub stats: StatsSnapshot,
    pub messages_per_sec: f64,
    /// Client deliveries during the interval
    pub deliveries: u64,
    pub subscription_failures: u64,
    pub clients_dropped: u64,
    pub clients_evicted: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            state = %self.stats.connection_state,
            devices = %self.stats.devices,
            clients = %self.stats.clients,
            messages_total = %self.stats.messages_received,
            messages_per_sec = format!("{:.1}", self.messages_per_sec),
            telemetry_total = %self.stats.telemetry_events,
            tolerated_total = %self.stats.tolerated_events,
            dropped_total = %self.stats.dropped_messages,
            decode_errors = %self.stats.decode_errors,
            deliveries = %self.deliveries,
            reconnects = %self.stats.reconnects,
            "metrics"
        );
    }
}
