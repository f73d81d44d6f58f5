//! Event routing fabric.
//!
//! The router consumes requester results and status heartbeats, converts
//! them into canonical events, and fans each one out to every matching
//! subscription through a pluggable delivery callback.  Delivery failures
//! are per-subscription: one full buffer never aborts the fanout or stalls
//! another session.
//!
//! DATA and STATUS travel explicit, separate input paths — classification
//! is by type, never by inspecting a kind prefix.

use crate::event::{flags, CanonicalEvent, EventEnvelope};
use crate::index::{EventAttrs, Subscription, SubscriptionFilter, SubscriptionIndex};
use crate::request::{FetchResult, FetchStatus};
use crate::status::StatusSnapshot;
use crate::stream::MetricKind;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Delivery seam
// ---------------------------------------------------------------------------

/// A routed event, classified at the type level.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedEvent {
    Data(CanonicalEvent),
    Status(CanonicalEvent),
}

impl RoutedEvent {
    pub fn event(&self) -> &CanonicalEvent {
        match self {
            RoutedEvent::Data(e) | RoutedEvent::Status(e) => e,
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self, RoutedEvent::Status(_))
    }
}

/// Per-delivery context handed to the hub so it can apply its session
/// policies (throttling, include-status defaults) without asking the
/// router back.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub client_id: String,
    pub subscription_id: Uuid,
    pub throttle_ms: u64,
    pub include_status: bool,
}

/// What the delivery callback did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Intentionally not delivered (buffer full, throttled); counted.
    Dropped,
    /// The client no longer exists; the session teardown will cascade.
    Gone,
}

/// Non-blocking delivery callback, one invocation per matching
/// subscription.
pub type DeliveryFn = Arc<dyn Fn(&DeliveryContext, &RoutedEvent) -> DeliveryOutcome + Send + Sync>;

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("client {0} is not registered")]
    UnknownClient(String),
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Conversion bounds for canonical events.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Events with larger payloads are dropped, not truncated.
    pub max_payload_bytes: usize,
    /// A DATA event whose origin timestamp lags now by more than this gets
    /// the `late` flag.
    pub lateness_bound: std::time::Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_payload_bytes: 1 << 20,
            lateness_bound: std::time::Duration::from_secs(300),
        }
    }
}

/// Routing counters, readable at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    pub events_in: u64,
    pub data_out: u64,
    pub status_out: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_in: AtomicU64,
    data_out: AtomicU64,
    status_out: AtomicU64,
    dropped: AtomicU64,
}

/// Owns the subscription index and the per-(tenant, site, metric)
/// sequence counters.
pub struct Router {
    cfg: RouterConfig,
    index: Mutex<SubscriptionIndex>,
    /// client-id -> tenant, as registered by the hub.
    clients: Mutex<HashMap<String, String>>,
    sequences: Mutex<HashMap<(String, String, MetricKind), u64>>,
    delivery: RwLock<Option<DeliveryFn>>,
    counters: Counters,
}

impl Router {
    pub fn new(cfg: RouterConfig) -> Arc<Self> {
        Arc::new(Router {
            cfg,
            index: Mutex::new(SubscriptionIndex::new()),
            clients: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            delivery: RwLock::new(None),
            counters: Counters::default(),
        })
    }

    /// Install the fanout callback.  Must be non-blocking.
    pub async fn set_delivery(&self, delivery: DeliveryFn) {
        *self.delivery.write().await = Some(delivery);
    }

    pub async fn register_client(&self, client_id: &str, tenant: &str) {
        self.clients
            .lock()
            .await
            .insert(client_id.to_owned(), tenant.to_owned());
    }

    /// Drop the client and cascade to all of its subscriptions.
    pub async fn unregister_client(&self, client_id: &str) {
        self.clients.lock().await.remove(client_id);
        let removed = self.index.lock().await.remove_by_client(client_id);
        if !removed.is_empty() {
            debug!(client_id, count = removed.len(), "released subscriptions");
        }
    }

    pub async fn subscribe(
        &self,
        client_id: &str,
        filter: SubscriptionFilter,
        include_status: bool,
        throttle_ms: u64,
    ) -> Result<Uuid, SubscribeError> {
        if !self.clients.lock().await.contains_key(client_id) {
            return Err(SubscribeError::UnknownClient(client_id.to_owned()));
        }
        let sub = Subscription::new(client_id, filter, include_status, throttle_ms);
        Ok(self.index.lock().await.add(sub))
    }

    pub async fn unsubscribe(&self, id: &Uuid) -> bool {
        self.index.lock().await.remove(id).is_some()
    }

    /// Remove every subscription a client holds, keeping the client
    /// registered (the UNSUB semantics).
    pub async fn unsubscribe_client(&self, client_id: &str) -> usize {
        self.index.lock().await.remove_by_client(client_id).len()
    }

    pub async fn subscription_count(&self, client_id: &str) -> usize {
        self.index.lock().await.count_for_client(client_id)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_in: self.counters.events_in.load(Ordering::Relaxed),
            data_out: self.counters.data_out.load(Ordering::Relaxed),
            status_out: self.counters.status_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    // -- input paths --

    /// Consume one requester result.  Failed results update KPIs only and
    /// are never routed as DATA; clients learn about errors via STATUS.
    pub async fn on_requester_result(&self, result: FetchResult) {
        self.counters.events_in.fetch_add(1, Ordering::Relaxed);
        if !matches!(result.status, FetchStatus::Success) {
            return;
        }
        let payload = result.payload.unwrap_or_default();
        if payload.len() > self.cfg.max_payload_bytes {
            warn!(
                stream = %result.key,
                len = payload.len(),
                "payload exceeds configured maximum; dropping event"
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let timestamp = result.window.to;
        let mut event_flags = 0u8;
        let lag = Utc::now() - timestamp;
        if lag
            > chrono::Duration::from_std(self.cfg.lateness_bound)
                .unwrap_or_else(|_| chrono::Duration::seconds(300))
        {
            event_flags |= flags::LATE;
        }

        let sequence = self.next_sequence(&result.key.sequence_scope()).await;
        let kind = result.key.metric.as_str().to_owned();
        let event = CanonicalEvent {
            envelope: EventEnvelope {
                version: omni_proto::ENVELOPE_VERSION,
                timestamp,
                key: result.key,
                source: result.source,
                sequence,
                flags: event_flags,
                trace_id: Uuid::new_v4(),
            },
            kind,
            schema_version: 1,
            payload,
        };
        self.fanout(RoutedEvent::Data(event)).await;
    }

    /// Consume one status heartbeat.
    pub async fn on_status_heartbeat(&self, status: StatusSnapshot) {
        self.counters.events_in.fetch_add(1, Ordering::Relaxed);
        let payload = match serde_json::to_vec(&status.to_wire_body()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize status body");
                return;
            }
        };
        let sequence = self.next_sequence(&status.key.sequence_scope()).await;
        let source = status.source.clone();
        let event = CanonicalEvent {
            envelope: EventEnvelope {
                version: omni_proto::ENVELOPE_VERSION,
                timestamp: status.emitted_at,
                key: status.key,
                source,
                sequence,
                flags: 0,
                trace_id: Uuid::new_v4(),
            },
            kind: "status".to_owned(),
            schema_version: 1,
            payload,
        };
        self.fanout(RoutedEvent::Status(event)).await;
    }

    /// Drain the two input channels until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut results: mpsc::Receiver<FetchResult>,
        mut statuses: mpsc::Receiver<StatusSnapshot>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe = results.recv() => match maybe {
                    Some(result) => self.on_requester_result(result).await,
                    None => break,
                },
                maybe = statuses.recv() => match maybe {
                    Some(status) => self.on_status_heartbeat(status).await,
                    None => break,
                },
            }
        }
        debug!("router drain exited");
    }

    // -- internals --

    async fn next_sequence(&self, scope: &(String, String, MetricKind)) -> u64 {
        let mut sequences = self.sequences.lock().await;
        let counter = sequences.entry(scope.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn fanout(&self, routed: RoutedEvent) {
        let contexts: Vec<DeliveryContext> = {
            let index = self.index.lock().await;
            let event = routed.event();
            let attrs = EventAttrs::from_event(event);
            let matched = if routed.is_status() {
                index.match_status(&attrs)
            } else {
                index.match_event(&attrs)
            };
            matched
                .into_iter()
                .map(|sub| DeliveryContext {
                    client_id: sub.client_id.clone(),
                    subscription_id: sub.id,
                    throttle_ms: sub.throttle_ms,
                    include_status: sub.include_status,
                })
                .collect()
        };
        if contexts.is_empty() {
            return;
        }
        let Some(delivery) = self.delivery.read().await.clone() else {
            return;
        };

        let now = Utc::now();
        let mut delivered = Vec::new();
        for ctx in &contexts {
            match delivery(ctx, &routed) {
                DeliveryOutcome::Delivered => {
                    delivered.push(ctx.subscription_id);
                    if routed.is_status() {
                        self.counters.status_out.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.counters.data_out.fetch_add(1, Ordering::Relaxed);
                    }
                }
                DeliveryOutcome::Dropped => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Gone => {}
            }
        }
        if !delivered.is_empty() {
            let mut index = self.index.lock().await;
            for id in delivered {
                index.record_delivery(&id, now);
            }
        }
    }
}
