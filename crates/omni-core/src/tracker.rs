//! Shared per-stream KPI store.
//!
//! The tracker is the only cross-component mutable state in the gateway:
//! requesters write, the status pusher reads.  Every mutation is atomic
//! over the full [`StreamKpis`] record, so a snapshot taken under the read
//! lock is internally consistent.  Mutations are write-through: the record
//! is created on first update if the stream was never registered, which
//! supports late-discovered streams.

use crate::stream::StreamKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Mutable per-stream health record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamKpis {
    pub last_success_ts: Option<DateTime<Utc>>,
    pub last_error_ts: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub in_flight: bool,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub circuit_breaker_open: bool,
    pub notes: Option<String>,
}

/// Thread-safe KPI store keyed by [`StreamKey`].
///
/// Lock scope is one short critical section per operation; all operations
/// are O(1) map accesses.
#[derive(Debug, Default)]
pub struct StreamTracker {
    inner: RwLock<HashMap<StreamKey, StreamKpis>>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream with an empty record.  Idempotent.
    pub async fn register(&self, key: &StreamKey) {
        self.inner
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(StreamKpis::default);
    }

    /// Record a successful strategy call.
    ///
    /// Resets `consecutive_errors` to 0, clears the last error message, and
    /// closes the circuit breaker — all in one atomic record update.
    pub async fn update_success(&self, key: &StreamKey, latency: Duration) {
        let mut map = self.inner.write().await;
        let kpis = map.entry(key.clone()).or_insert_with(StreamKpis::default);
        kpis.last_success_ts = Some(Utc::now());
        kpis.last_latency_ms = Some(latency.as_millis().min(u128::from(u64::MAX)) as u64);
        kpis.consecutive_errors = 0;
        kpis.consecutive_successes = kpis.consecutive_successes.saturating_add(1);
        kpis.last_error_msg = None;
        kpis.circuit_breaker_open = false;
    }

    /// Record a failed strategy call.  Resets `consecutive_successes`.
    pub async fn update_error(&self, key: &StreamKey, message: &str) {
        let mut map = self.inner.write().await;
        let kpis = map.entry(key.clone()).or_insert_with(StreamKpis::default);
        kpis.last_error_ts = Some(Utc::now());
        kpis.last_error_msg = Some(message.to_owned());
        kpis.consecutive_errors = kpis.consecutive_errors.saturating_add(1);
        kpis.consecutive_successes = 0;
    }

    /// True iff a strategy call is currently running for this stream.
    pub async fn set_in_flight(&self, key: &StreamKey, in_flight: bool) {
        let mut map = self.inner.write().await;
        let kpis = map.entry(key.clone()).or_insert_with(StreamKpis::default);
        kpis.in_flight = in_flight;
    }

    /// Mutated only by the stream's owning requester.
    pub async fn set_circuit(&self, key: &StreamKey, open: bool) {
        let mut map = self.inner.write().await;
        let kpis = map.entry(key.clone()).or_insert_with(StreamKpis::default);
        kpis.circuit_breaker_open = open;
    }

    pub async fn set_notes(&self, key: &StreamKey, notes: Option<String>) {
        let mut map = self.inner.write().await;
        let kpis = map.entry(key.clone()).or_insert_with(StreamKpis::default);
        kpis.notes = notes;
    }

    /// A consistent copy of one stream's record.
    pub async fn get_kpis_snapshot(&self, key: &StreamKey) -> Option<StreamKpis> {
        self.inner.read().await.get(key).cloned()
    }

    /// A consistent copy of every tracked stream.  The status pusher calls
    /// this once per tick and does state determination outside the lock.
    pub async fn list_all(&self) -> Vec<(StreamKey, StreamKpis)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
