//! Push client registry and fan-out
//!
//! Each client gets a bounded outbound queue drained by its socket writer.
//! Offers never block: a full or closed queue drops that client and nobody
//! else. A per-client liveness task probes on a fixed interval and evicts a
//! client that missed the previous probe.

use crate::domain::types::{BroadcastMessage, ClientFrame, TelemetryEvent};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Frames queued for a client's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized `BroadcastMessage`, shared between all recipients
    Text(Arc<str>),
    /// Protocol-level ping
    Probe,
}

/// One connected push client
pub struct ClientConnection {
    pub id: String,
    tx: mpsc::Sender<Outbound>,
    /// Answered the last probe
    alive: AtomicBool,
    last_pong_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
    shutdown: Notify,
    pub connected_at: Instant,
}

impl ClientConnection {
    pub fn new(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            alive: AtomicBool::new(true),
            last_pong_at: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            connected_at: Instant::now(),
        }
    }

    /// Queue a frame without waiting. Returns false if the queue is full or closed.
    pub fn offer(&self, frame: Outbound) -> bool {
        !self.is_closed() && self.tx.try_send(frame).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed() && !self.tx.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Protocol pong received
    pub fn record_pong(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_pong_at.lock() = Some(Instant::now());
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        *self.last_pong_at.lock()
    }

    /// Read and clear the alive flag
    fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the socket side to close. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.shutdown.notify_waiters();
        }
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close is not missed
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

pub struct BroadcastHub {
    clients: Mutex<FxHashMap<String, Arc<ClientConnection>>>,
    metrics: Arc<Metrics>,
    ping_interval: Duration,
}

impl BroadcastHub {
    pub fn new(metrics: Arc<Metrics>, ping_interval: Duration) -> Self {
        Self { clients: Mutex::new(FxHashMap::default()), metrics, ping_interval }
    }

    /// Register a client, greet it, and start its liveness probe
    ///
    /// The welcome is queued under the registry lock so no broadcast can
    /// reach the client ahead of it.
    pub fn register(self: &Arc<Self>, tx: mpsc::Sender<Outbound>) -> Arc<ClientConnection> {
        let id = uuid::Uuid::now_v7().to_string();
        let client = Arc::new(ClientConnection::new(id.clone(), tx));

        let registered = {
            let mut clients = self.clients.lock();
            let count = clients.len() + 1;
            let mut stats = self.metrics.snapshot();
            stats.clients = count as u64;

            let greeted = match (BroadcastMessage::Welcome { stats }).to_json() {
                Ok(json) => client.offer(Outbound::Text(json.into())),
                Err(e) => {
                    warn!(client_id = %id, error = %e, "welcome_serialize_failed");
                    true
                }
            };
            if greeted {
                clients.insert(id.clone(), client.clone());
                self.metrics.set_clients(count);
                Some(count)
            } else {
                None
            }
        };

        let Some(count) = registered else {
            client.close();
            self.metrics.record_client_dropped();
            warn!(client_id = %id, reason = "welcome_failed", "client_dropped");
            return client;
        };
        info!(client_id = %id, clients = %count, "client_registered");

        self.spawn_liveness(client.clone());
        client
    }

    /// Remove a client. Returns false if it was not registered.
    pub fn unregister(&self, id: &str) -> bool {
        let (removed, count) = {
            let mut clients = self.clients.lock();
            let removed = clients.remove(id);
            (removed, clients.len())
        };
        match removed {
            Some(client) => {
                client.close();
                self.metrics.set_clients(count);
                debug!(client_id = %id, clients = %count, "client_unregistered");
                true
            }
            None => false,
        }
    }

    fn drop_client(&self, id: &str, reason: &str) {
        if self.unregister(id) {
            self.metrics.record_client_dropped();
            warn!(client_id = %id, reason = %reason, "client_dropped");
        }
    }

    /// Serialize once and offer to every open client. Returns the delivery count.
    pub fn broadcast(&self, event: &TelemetryEvent) -> usize {
        let json: Arc<str> = match BroadcastMessage::Telemetry(event.clone()).to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(session_id = %event.session_id, error = %e, "broadcast_serialize_failed");
                return 0;
            }
        };

        let recipients: Vec<Arc<ClientConnection>> = self.clients.lock().values().cloned().collect();

        let mut delivered = 0;
        for client in &recipients {
            if client.is_open() && client.offer(Outbound::Text(json.clone())) {
                delivered += 1;
            } else {
                self.drop_client(&client.id, "send_failed");
            }
        }

        self.metrics.record_broadcast(delivered);
        debug!(
            session_id = %event.session_id,
            recipients = %recipients.len(),
            delivered = %delivered,
            "telemetry_broadcast"
        );
        delivered
    }

    /// Handle an application-level text frame from a client.
    ///
    /// `{"type":"ping"}` is answered with `{"type":"pong"}`; liveness is driven
    /// by protocol pongs only.
    pub fn on_client_text(&self, client: &ClientConnection, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Ping) => {
                let pong = match BroadcastMessage::Pong.to_json() {
                    Ok(json) => json,
                    Err(_) => return,
                };
                if !client.offer(Outbound::Text(pong.into())) {
                    self.drop_client(&client.id, "pong_failed");
                }
            }
            Ok(ClientFrame::Pong) => {}
            Err(_) => debug!(client_id = %client.id, bytes = %text.len(), "client_text_ignored"),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.lock().contains_key(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Close and forget every client
    pub fn close_all(&self) {
        let drained: Vec<Arc<ClientConnection>> = {
            let mut clients = self.clients.lock();
            clients.drain().map(|(_, c)| c).collect()
        };
        for client in &drained {
            client.close();
        }
        self.metrics.set_clients(0);
        if !drained.is_empty() {
            info!(clients = %drained.len(), "clients_closed");
        }
    }

    fn spawn_liveness(self: &Arc<Self>, client: Arc<ClientConnection>) {
        let hub: Weak<Self> = Arc::downgrade(self);
        let interval = self.ping_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            // A late tick must not be followed by an immediate second one
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = client.closed() => break,
                }

                let Some(hub) = hub.upgrade() else { break };
                if !hub.contains(&client.id) {
                    break;
                }

                // Previous probe went unanswered
                if !client.take_alive() {
                    if hub.unregister(&client.id) {
                        hub.metrics.record_client_evicted();
                        info!(client_id = %client.id, "client_evicted");
                    }
                    break;
                }

                if !client.offer(Outbound::Probe) {
                    hub.drop_client(&client.id, "probe_failed");
                    break;
                }
            }
        });
    }
}
