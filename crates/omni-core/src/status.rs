//! Stream health heartbeats.
//!
//! The [`StatusPusher`] snapshots the tracker on a fixed interval and
//! derives one [`StatusSnapshot`] per known stream, so clients can
//! distinguish "no data yet" from "backend failing".  State determination
//! is a pure function over (KPIs, staleness, thresholds) and runs outside
//! the tracker lock.

use crate::stream::StreamKey;
use crate::tracker::{StreamKpis, StreamTracker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Thresholds for heartbeat emission and state determination.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub heartbeat_interval: Duration,
    /// Staleness beyond which a healthy stream stops reporting `ok`.
    pub stale_threshold_ok: u64,
    /// Staleness beyond which a stream is `degraded` outright.
    pub stale_threshold_degraded: u64,
    /// Consecutive errors at which a stream is `failing`.
    pub max_consecutive_errors: u32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            heartbeat_interval: Duration::from_secs(10),
            stale_threshold_ok: 30,
            stale_threshold_degraded: 120,
            max_consecutive_errors: 5,
        }
    }
}

/// Health state of one stream at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ok,
    Partial,
    Degraded,
    Failing,
    Paused,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Ok => "ok",
            StreamState::Partial => "partial",
            StreamState::Degraded => "degraded",
            StreamState::Failing => "failing",
            StreamState::Paused => "paused",
        }
    }
}

/// One heartbeat, derived from a KPI record at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub key: StreamKey,
    /// Seconds since the last successful call; 0 if never succeeded.
    pub staleness_sec: u64,
    pub state: StreamState,
    pub in_flight: bool,
    pub last_latency_ms: Option<u64>,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub last_error_ts: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
    pub source: String,
    pub notes: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Derive a heartbeat for `key` from its KPI record at `now`.
    pub fn derive(key: &StreamKey, kpis: &StreamKpis, now: DateTime<Utc>, cfg: &StatusConfig) -> Self {
        let staleness_sec = kpis
            .last_success_ts
            .map(|ts| (now - ts).num_seconds().max(0) as u64)
            .unwrap_or(0);
        StatusSnapshot {
            key: key.clone(),
            staleness_sec,
            state: determine_state(kpis, staleness_sec, cfg),
            in_flight: kpis.in_flight,
            last_latency_ms: kpis.last_latency_ms,
            last_success_ts: kpis.last_success_ts,
            last_error_ts: kpis.last_error_ts,
            last_error_msg: kpis.last_error_msg.clone(),
            source: key.source.as_str().to_owned(),
            notes: kpis.notes.clone(),
            emitted_at: now,
        }
    }

    /// The frozen wire body for STATUS frames.
    pub fn to_wire_body(&self) -> omni_proto::StatusBody {
        omni_proto::StatusBody {
            last_success_ts: self.last_success_ts.map(|ts| ts.timestamp_millis()),
            last_latency_ms: self.last_latency_ms,
            staleness_s: self.staleness_sec,
            in_flight: self.in_flight,
            last_error_ts: self.last_error_ts.map(|ts| ts.timestamp_millis()),
            last_error_msg: self.last_error_msg.clone(),
            state: self.state.as_str().to_owned(),
            source: self.source.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// State determination, first match wins.  Thresholds use strict
/// inequality: staleness exactly equal to a threshold takes the
/// lower-severity branch.
pub fn determine_state(kpis: &StreamKpis, staleness_sec: u64, cfg: &StatusConfig) -> StreamState {
    if kpis.circuit_breaker_open {
        return StreamState::Paused;
    }
    if kpis.consecutive_errors >= cfg.max_consecutive_errors {
        return StreamState::Failing;
    }
    if kpis.last_success_ts.is_none() {
        return if kpis.last_error_ts.is_some() {
            StreamState::Failing
        } else {
            // Never produced anything yet.
            StreamState::Partial
        };
    }
    if staleness_sec > cfg.stale_threshold_degraded {
        return StreamState::Degraded;
    }
    if staleness_sec > cfg.stale_threshold_ok {
        return if kpis.consecutive_errors > 0 {
            StreamState::Degraded
        } else {
            StreamState::Partial
        };
    }
    if kpis.consecutive_errors > 0 {
        return StreamState::Partial;
    }
    StreamState::Ok
}

// ---------------------------------------------------------------------------
// StatusPusher
// ---------------------------------------------------------------------------

/// Periodic heartbeat emitter.  One per process; emits immediately on
/// start, then every `heartbeat_interval`.
pub struct StatusPusher {
    tracker: Arc<StreamTracker>,
    cfg: StatusConfig,
    out: mpsc::Sender<StatusSnapshot>,
    cancel: CancellationToken,
}

impl StatusPusher {
    pub fn new(
        tracker: Arc<StreamTracker>,
        cfg: StatusConfig,
        out: mpsc::Sender<StatusSnapshot>,
        cancel: CancellationToken,
    ) -> Self {
        StatusPusher {
            tracker,
            cfg,
            out,
            cancel,
        }
    }

    /// Run the tick loop until cancelled.  The first tick fires
    /// immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.cfg.heartbeat_interval);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.emit_all().await;
        }
        debug!("status pusher exited");
    }

    async fn emit_all(&self) {
        let records = self.tracker.list_all().await;
        let now = Utc::now();
        for (key, kpis) in records {
            let snapshot = StatusSnapshot::derive(&key, &kpis, now, &self.cfg);
            if self.out.send(snapshot).await.is_err() {
                // Router gone; stop trying for this tick.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MetricKind, SourceKind};

    fn key() -> StreamKey {
        StreamKey::new("t1", "s1", None, MetricKind::Water, SourceKind::ProcessApi)
    }

    fn cfg() -> StatusConfig {
        StatusConfig::default()
    }

    fn healthy_kpis() -> StreamKpis {
        StreamKpis {
            last_success_ts: Some(Utc::now()),
            ..StreamKpis::default()
        }
    }

    #[test]
    fn breaker_open_wins_over_everything() {
        let kpis = StreamKpis {
            circuit_breaker_open: true,
            consecutive_errors: 99,
            ..healthy_kpis()
        };
        assert_eq!(determine_state(&kpis, 10_000, &cfg()), StreamState::Paused);
    }

    #[test]
    fn error_run_at_max_is_failing() {
        let kpis = StreamKpis {
            consecutive_errors: 5,
            ..healthy_kpis()
        };
        assert_eq!(determine_state(&kpis, 0, &cfg()), StreamState::Failing);

        let below = StreamKpis {
            consecutive_errors: 4,
            ..healthy_kpis()
        };
        assert_ne!(determine_state(&below, 0, &cfg()), StreamState::Failing);
    }

    #[test]
    fn never_succeeded_with_errors_is_failing_without_is_partial() {
        let erring = StreamKpis {
            last_error_ts: Some(Utc::now()),
            consecutive_errors: 1,
            ..StreamKpis::default()
        };
        assert_eq!(determine_state(&erring, 0, &cfg()), StreamState::Failing);

        let untouched = StreamKpis::default();
        assert_eq!(determine_state(&untouched, 0, &cfg()), StreamState::Partial);
    }

    #[test]
    fn staleness_thresholds_are_strict() {
        // Exactly at a threshold takes the lower-severity branch.
        let kpis = healthy_kpis();
        assert_eq!(determine_state(&kpis, 30, &cfg()), StreamState::Ok);
        assert_eq!(determine_state(&kpis, 31, &cfg()), StreamState::Partial);
        assert_eq!(determine_state(&kpis, 120, &cfg()), StreamState::Partial);
        assert_eq!(determine_state(&kpis, 121, &cfg()), StreamState::Degraded);
    }

    #[test]
    fn moderate_staleness_with_errors_is_degraded() {
        let kpis = StreamKpis {
            consecutive_errors: 1,
            ..healthy_kpis()
        };
        assert_eq!(determine_state(&kpis, 31, &cfg()), StreamState::Degraded);
        // Fresh but erring: partial.
        assert_eq!(determine_state(&kpis, 0, &cfg()), StreamState::Partial);
    }

    #[test]
    fn determine_state_is_pure() {
        let kpis = StreamKpis {
            consecutive_errors: 2,
            ..healthy_kpis()
        };
        let first = determine_state(&kpis, 40, &cfg());
        let second = determine_state(&kpis, 40, &cfg());
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn pusher_emits_immediately_and_then_on_interval() {
        let tracker = Arc::new(StreamTracker::new());
        tracker.register(&key()).await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let pusher = StatusPusher::new(
            Arc::clone(&tracker),
            StatusConfig {
                heartbeat_interval: Duration::from_secs(10),
                ..cfg()
            },
            tx,
            cancel.clone(),
        );
        tokio::spawn(pusher.run());

        // First emission arrives without waiting a full interval.
        let first = rx.recv().await.expect("immediate heartbeat");
        assert_eq!(first.key, key());
        assert_eq!(first.state, StreamState::Partial);
        assert_eq!(first.staleness_sec, 0);

        // Second emission arrives after the interval.
        let second = rx.recv().await.expect("second heartbeat");
        assert_eq!(second.key, key());
        cancel.cancel();
    }

    #[test]
    fn wire_body_round_trips_fields() {
        let now = Utc::now();
        let kpis = StreamKpis {
            last_success_ts: Some(now - chrono::Duration::seconds(42)),
            last_latency_ms: Some(77),
            last_error_msg: Some("HTTP 503".to_owned()),
            last_error_ts: Some(now),
            consecutive_errors: 1,
            ..StreamKpis::default()
        };
        let snapshot = StatusSnapshot::derive(&key(), &kpis, now, &cfg());
        assert_eq!(snapshot.staleness_sec, 42);
        let body = snapshot.to_wire_body();
        assert_eq!(body.staleness_s, 42);
        assert_eq!(body.last_latency_ms, Some(77));
        assert_eq!(body.state, "degraded");
        assert_eq!(body.source, "processapi");
    }
}
