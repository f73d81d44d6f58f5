//! Per-requester in-process counters and latency ring.
//!
//! Pure observability; never on the routing hot path.  The gateway's
//! Prometheus exposition reads snapshots from here.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_RING_SIZE: usize = 100;

#[derive(Debug)]
struct CollectorInner {
    latencies: VecDeque<Duration>,
    ring_size: usize,
    processed: u64,
    success: u64,
    error: u64,
}

/// Derived view over the collector at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSnapshot {
    pub processed: u64,
    pub success: u64,
    pub error: u64,
    /// success / processed, 1.0 when nothing was processed yet.
    pub success_rate: f64,
    /// Mean over the latency ring (last N calls), in milliseconds.
    pub avg_latency_ms: f64,
}

/// Counters plus a ring of the last N call latencies.
#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<CollectorInner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_ring_size(DEFAULT_RING_SIZE)
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ring_size(ring_size: usize) -> Self {
        MetricsCollector {
            inner: Mutex::new(CollectorInner {
                latencies: VecDeque::with_capacity(ring_size),
                ring_size,
                processed: 0,
                success: 0,
                error: 0,
            }),
        }
    }

    pub async fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock().await;
        inner.processed += 1;
        inner.success += 1;
        push_latency(&mut inner, latency);
    }

    pub async fn record_error(&self, latency: Duration) {
        let mut inner = self.inner.lock().await;
        inner.processed += 1;
        inner.error += 1;
        push_latency(&mut inner, latency);
    }

    pub async fn snapshot(&self) -> CollectorSnapshot {
        let inner = self.inner.lock().await;
        let success_rate = if inner.processed == 0 {
            1.0
        } else {
            inner.success as f64 / inner.processed as f64
        };
        let avg_latency_ms = if inner.latencies.is_empty() {
            0.0
        } else {
            let total: f64 = inner
                .latencies
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum();
            total / inner.latencies.len() as f64
        };
        CollectorSnapshot {
            processed: inner.processed,
            success: inner.success,
            error: inner.error,
            success_rate,
            avg_latency_ms,
        }
    }
}

fn push_latency(inner: &mut CollectorInner, latency: Duration) {
    if inner.latencies.len() == inner.ring_size {
        inner.latencies.pop_front();
    }
    inner.latencies.push_back(latency);
}
