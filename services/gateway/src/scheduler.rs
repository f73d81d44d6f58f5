//! Poll scheduling.
//!
//! Collaborator surface, not data plane: one interval task per stream
//! enqueues a poll request covering the window since the last accepted
//! enqueue.  A full queue leaves the window lower bound in place, so the
//! next tick widens the request instead of losing coverage.

use crate::metrics;
use crate::state::AppState;
use crate::strategies;
use omni_core::collector::MetricsCollector;
use omni_core::request::{PollRequest, TimeWindow};
use omni_core::requester::{EnqueueOutcome, Requester};
use omni_core::stream::{MetricKind, SourceKind, StreamKey};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build, start, and schedule one requester per (connection × metric).
/// Returns the requesters so shutdown can stop them in order.
pub async fn spawn_connections(state: &AppState) -> Vec<Arc<Requester>> {
    let requester_cfg = state.config.requester_config();
    let mut requesters = Vec::new();
    for conn in &state.config.connections {
        if !conn.active {
            info!(connection = %conn.id, "connection inactive; not polled");
            continue;
        }
        let Some(strategy) = strategies::for_connection(conn) else {
            warn!(
                connection = %conn.id,
                type_id = %conn.type_id,
                "no strategy available for provider type; skipping connection"
            );
            continue;
        };
        let source = source_for(&conn.type_id);
        for metric_name in &conn.metrics {
            let (metric, known) = MetricKind::parse_lenient(metric_name);
            if !known {
                warn!(
                    connection = %conn.id,
                    metric = %metric_name,
                    "unknown metric projected to 'other'"
                );
            }
            let key = StreamKey::new(
                conn.tenant_id.clone(),
                conn.site_id.clone(),
                None,
                metric,
                source,
            );
            let requester = Requester::new(
                key,
                requester_cfg.clone(),
                Arc::clone(&strategy),
                Arc::clone(&state.tracker),
                Arc::new(MetricsCollector::new()),
                state.results_tx.clone(),
                state.cancel.child_token(),
            );
            requester.start().await;
            spawn_poller(
                Arc::clone(&requester),
                Duration::from_secs(conn.provider.poll_seconds.max(1)),
                state.cancel.child_token(),
            );
            requesters.push(requester);
        }
    }
    info!(streams = requesters.len(), "poll schedule started");
    requesters
}

fn source_for(type_id: &str) -> SourceKind {
    if type_id.eq_ignore_ascii_case("processapi") {
        SourceKind::ProcessApi
    } else {
        SourceKind::Cloud
    }
}

/// One interval task enqueueing polls for one stream.  The first tick
/// fires immediately; the initial window reaches one interval back.
pub fn spawn_poller(
    requester: Arc<Requester>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut window_start = Utc::now()
            - chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(60));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            let request = PollRequest::new(
                requester.key().clone(),
                TimeWindow::new(window_start, now),
            );
            match requester.enqueue(request).await {
                EnqueueOutcome::Accepted => {
                    window_start = now;
                }
                EnqueueOutcome::RejectedQueueFull => {
                    // Keep window_start: the next tick covers the gap.
                    metrics::ENQUEUE_REJECTED
                        .with_label_values(&["queue_full"])
                        .inc();
                    warn!(stream = %requester.key(), "poll queue full; widening next window");
                }
                EnqueueOutcome::RejectedShuttingDown => break,
            }
        }
        debug!(stream = %requester.key(), "poller exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::request::FetchResult;
    use omni_core::tracker::StreamTracker;
    use omni_test_utils::MockStrategy;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn poller_enqueues_contiguous_windows() {
        let tracker = Arc::new(StreamTracker::new());
        let (tx, mut rx) = mpsc::channel::<FetchResult>(16);
        let key = StreamKey::new("t", "s", None, MetricKind::Climate, SourceKind::ProcessApi);
        let strategy = MockStrategy::succeeding(b"{}", Duration::ZERO);
        let cancel = CancellationToken::new();
        let requester = Requester::new(
            key,
            omni_core::requester::RequesterConfig::default(),
            strategy,
            tracker,
            Arc::new(MetricsCollector::new()),
            tx,
            cancel.child_token(),
        );
        requester.start().await;
        spawn_poller(
            Arc::clone(&requester),
            Duration::from_secs(5),
            cancel.child_token(),
        );

        let first = rx.recv().await.expect("first poll");
        let second = rx.recv().await.expect("second poll");
        assert_eq!(first.window.to, second.window.from);
        assert!(second.window.to >= second.window.from);
        cancel.cancel();
        requester.stop().await;
    }

    #[test]
    fn provider_type_maps_to_source() {
        assert_eq!(source_for("processapi"), SourceKind::ProcessApi);
        assert_eq!(source_for("ProcessAPI"), SourceKind::ProcessApi);
        assert_eq!(source_for("scaleaq"), SourceKind::Cloud);
    }
}
