//! Per-stream poll scheduler.
//!
//! One [`Requester`] serves exactly one stream and serializes strategy
//! calls: at most one in flight at any time.  It owns a bounded inbound
//! queue with tail coalescing, a backoff ladder, and a circuit breaker,
//! and it is the only writer of its stream's KPIs.
//!
//! # Failure semantics
//! A strategy error is retried only by future enqueues from the upstream
//! scheduler — a requester never re-executes the same request.  Backoff
//! and the breaker delay processing of the *next* queued request.

use crate::collector::MetricsCollector;
use crate::request::{FetchErrorKind, FetchResult, FetchStatus, PollRequest};
use crate::strategy::RequestStrategy;
use crate::stream::StreamKey;
use crate::tracker::StreamTracker;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables for one requester.  The gateway builds this from the
/// `[requester]` config section; defaults match the documented contract.
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Per-call deadline for the strategy.
    pub request_timeout: Duration,
    /// Three non-decreasing sleep durations indexed by consecutive errors.
    pub backoff_steps: [Duration; 3],
    /// Consecutive errors before the breaker opens.
    pub breaker_threshold: u32,
    /// How long an open breaker suspends strategy calls.
    pub breaker_pause: Duration,
    pub max_queue_size: usize,
    pub coalescing_enabled: bool,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        RequesterConfig {
            request_timeout: Duration::from_secs(30),
            backoff_steps: [
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            breaker_threshold: 5,
            breaker_pause: Duration::from_secs(30 * 60),
            max_queue_size: 1_000,
            coalescing_enabled: true,
        }
    }
}

/// Typed outcome of [`Requester::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    RejectedQueueFull,
    RejectedShuttingDown,
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueState {
    items: VecDeque<PollRequest>,
    accepting: bool,
}

/// The per-stream scheduler.  Create with [`Requester::new`], then
/// [`Requester::start`] to spawn the worker.
pub struct Requester {
    key: StreamKey,
    cfg: RequesterConfig,
    strategy: Arc<dyn RequestStrategy>,
    tracker: Arc<StreamTracker>,
    collector: Arc<MetricsCollector>,
    results: mpsc::Sender<FetchResult>,
    queue: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Requester {
    /// `cancel` should be a child of the process root token so shutdown
    /// propagates without an explicit `stop` on every stream.
    pub fn new(
        key: StreamKey,
        cfg: RequesterConfig,
        strategy: Arc<dyn RequestStrategy>,
        tracker: Arc<StreamTracker>,
        collector: Arc<MetricsCollector>,
        results: mpsc::Sender<FetchResult>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Requester {
            key,
            cfg,
            strategy,
            tracker,
            collector,
            results,
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                accepting: true,
            }),
            notify: Notify::new(),
            cancel,
            worker: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Register the stream and spawn the worker.  Idempotent; returns once
    /// the requester accepts enqueues (which it does from construction).
    pub async fn start(self: &Arc<Self>) {
        self.tracker.register(&self.key).await;
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            let me = Arc::clone(self);
            *guard = Some(tokio::spawn(me.run_worker()));
        }
    }

    /// Stop accepting, cancel the in-flight call, and wait for the worker
    /// to exit.  Remaining queued items are not drained.
    pub async fn stop(&self) {
        {
            let mut q = self.queue.lock().await;
            q.accepting = false;
        }
        self.cancel.cancel();
        self.notify.notify_one();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Offer a request to the queue.
    ///
    /// With coalescing enabled, a request for the same stream as the tail
    /// element widens the tail's window instead of adding an item; the
    /// merged request counts as one item against the bound.
    pub async fn enqueue(&self, request: PollRequest) -> EnqueueOutcome {
        let mut q = self.queue.lock().await;
        if !q.accepting {
            return EnqueueOutcome::RejectedShuttingDown;
        }
        if self.cfg.coalescing_enabled {
            if let Some(tail) = q.items.back_mut() {
                if tail.key == request.key {
                    tail.window = tail.window.union(&request.window);
                    drop(q);
                    self.notify.notify_one();
                    return EnqueueOutcome::Accepted;
                }
            }
        }
        if q.items.len() >= self.cfg.max_queue_size {
            return EnqueueOutcome::RejectedQueueFull;
        }
        q.items.push_back(request);
        drop(q);
        self.notify.notify_one();
        EnqueueOutcome::Accepted
    }

    /// Current queue depth (the in-flight request is not counted).
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.items.len()
    }

    /// A consistent copy of the head request's window, if any.
    pub async fn head_window(&self) -> Option<crate::request::TimeWindow> {
        self.queue.lock().await.items.front().map(|r| r.window)
    }

    // -- worker --

    async fn next_request(&self) -> Option<PollRequest> {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(req) = q.items.pop_front() {
                    return Some(req);
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = self.notify.notified() => {}
            }
        }
    }

    async fn run_worker(self: Arc<Self>) {
        let mut consecutive_errors: u32 = 0;
        let mut breaker_deadline: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(req) = self.next_request().await else {
                break;
            };

            // Breaker gate: the head request waits at the front of the
            // queue until the pause deadline passes.
            if let Some(deadline) = breaker_deadline {
                if Instant::now() < deadline {
                    {
                        let mut q = self.queue.lock().await;
                        q.items.push_front(req);
                    }
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                    continue;
                }
                breaker_deadline = None;
            }

            self.tracker.set_in_flight(&self.key, true).await;
            let started = std::time::Instant::now();
            let outcome = AssertUnwindSafe(tokio::time::timeout(
                self.cfg.request_timeout,
                self.strategy.execute(&self.cancel, &req),
            ))
            .catch_unwind()
            .await;
            let latency = started.elapsed();

            let (status, error, payload) = match outcome {
                Ok(Ok(Ok(bytes))) => (FetchStatus::Success, None, Some(bytes)),
                Ok(Ok(Err(e))) => (FetchStatus::Failed(e.kind), Some(e.message), None),
                Ok(Err(_elapsed)) => (
                    FetchStatus::Failed(FetchErrorKind::Timeout),
                    Some(format!(
                        "request timed out after {}s",
                        self.cfg.request_timeout.as_secs()
                    )),
                    None,
                ),
                Err(_panic) => {
                    warn!(stream = %self.key, "strategy panicked; recording generic error");
                    (
                        FetchStatus::Failed(FetchErrorKind::Other),
                        Some("strategy panicked".to_owned()),
                        None,
                    )
                }
            };

            // KPIs update before the result is published.
            match status {
                FetchStatus::Success => {
                    consecutive_errors = 0;
                    breaker_deadline = None;
                    self.tracker.update_success(&self.key, latency).await;
                    self.collector.record_success(latency).await;
                }
                FetchStatus::Failed(FetchErrorKind::Cancelled) => {
                    // Non-fault: no counters, no breaker advance.
                    debug!(stream = %self.key, "strategy call cancelled");
                }
                FetchStatus::Failed(_) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.tracker
                        .update_error(&self.key, error.as_deref().unwrap_or("error"))
                        .await;
                    self.collector.record_error(latency).await;
                }
            }

            let result = FetchResult {
                key: self.key.clone(),
                window: req.window,
                source: self.strategy.name().to_owned(),
                latency,
                status,
                error,
                payload,
            };
            if self.results.send(result).await.is_err() {
                debug!(stream = %self.key, "result channel closed; router is gone");
            }
            self.tracker.set_in_flight(&self.key, false).await;

            // Backoff sleep on any non-cancellation error; once the error
            // run reaches the threshold, the breaker pause begins after the
            // backoff completes.
            if let FetchStatus::Failed(kind) = status {
                if kind != FetchErrorKind::Cancelled {
                    let step_idx = consecutive_errors.saturating_sub(1).min(2) as usize;
                    let step = self.cfg.backoff_steps[step_idx];
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(step) => {}
                    }
                    if consecutive_errors >= self.cfg.breaker_threshold {
                        breaker_deadline = Some(Instant::now() + self.cfg.breaker_pause);
                        self.tracker.set_circuit(&self.key, true).await;
                        warn!(
                            stream = %self.key,
                            consecutive_errors,
                            pause_s = self.cfg.breaker_pause.as_secs(),
                            "circuit breaker opened"
                        );
                    }
                }
            }
        }
        debug!(stream = %self.key, "requester worker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TimeWindow;
    use crate::strategy::StrategyError;
    use crate::stream::{MetricKind, SourceKind};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> StreamKey {
        StreamKey::new("t1", "site-1", None, MetricKind::Climate, SourceKind::Cloud)
    }

    fn window(from_min: u32, to_min: u32) -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 8, 1, 10, from_min, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 1, 10, to_min, 0).unwrap(),
        )
    }

    /// Scripted strategy: fails `fail_first` calls, then succeeds with a
    /// fixed payload.  Records virtual call times and peak concurrency.
    struct ScriptedStrategy {
        fail_first: u32,
        delay: Duration,
        calls: Mutex<Vec<Instant>>,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
    }

    impl ScriptedStrategy {
        fn new(fail_first: u32, delay: Duration) -> Arc<Self> {
            Arc::new(ScriptedStrategy {
                fail_first,
                delay,
                calls: Mutex::new(Vec::new()),
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
            })
        }

        async fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl RequestStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _request: &PollRequest,
        ) -> Result<Vec<u8>, StrategyError> {
            let n = {
                let mut calls = self.calls.lock().await;
                calls.push(Instant::now());
                calls.len() as u32
            };
            let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if n <= self.fail_first {
                Err(StrategyError::server("HTTP 502"))
            } else {
                Ok(br#"{"v":1}"#.to_vec())
            }
        }
    }

    fn fast_cfg() -> RequesterConfig {
        RequesterConfig {
            request_timeout: Duration::from_secs(5),
            backoff_steps: [
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ],
            breaker_threshold: 3,
            breaker_pause: Duration::from_secs(2),
            max_queue_size: 10,
            coalescing_enabled: false,
        }
    }

    fn build(
        cfg: RequesterConfig,
        strategy: Arc<dyn RequestStrategy>,
    ) -> (Arc<Requester>, mpsc::Receiver<FetchResult>, Arc<StreamTracker>) {
        let tracker = Arc::new(StreamTracker::new());
        let collector = Arc::new(MetricsCollector::new());
        let (tx, rx) = mpsc::channel(64);
        let requester = Requester::new(
            key(),
            cfg,
            strategy,
            Arc::clone(&tracker),
            collector,
            tx,
            CancellationToken::new(),
        );
        (requester, rx, tracker)
    }

    #[tokio::test]
    async fn coalescing_merges_tail_windows_into_one_item() {
        let cfg = RequesterConfig {
            coalescing_enabled: true,
            ..fast_cfg()
        };
        let (requester, _rx, _tracker) = build(cfg, ScriptedStrategy::new(0, Duration::ZERO));
        // Worker not started: both enqueues land before any dequeue.
        let r1 = requester.enqueue(PollRequest::new(key(), window(0, 5))).await;
        let r2 = requester.enqueue(PollRequest::new(key(), window(3, 8))).await;
        assert_eq!(r1, EnqueueOutcome::Accepted);
        assert_eq!(r2, EnqueueOutcome::Accepted);
        assert_eq!(requester.queue_len().await, 1);
        assert_eq!(requester.head_window().await, Some(window(0, 8)));
    }

    #[tokio::test]
    async fn queue_rejects_deterministically_at_the_bound() {
        let cfg = RequesterConfig {
            max_queue_size: 2,
            coalescing_enabled: false,
            ..fast_cfg()
        };
        let (requester, _rx, _tracker) = build(cfg, ScriptedStrategy::new(0, Duration::ZERO));
        assert_eq!(
            requester.enqueue(PollRequest::new(key(), window(0, 1))).await,
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            requester.enqueue(PollRequest::new(key(), window(1, 2))).await,
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            requester.enqueue(PollRequest::new(key(), window(2, 3))).await,
            EnqueueOutcome::RejectedQueueFull
        );
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_rejected_as_shutting_down() {
        let (requester, _rx, _tracker) =
            build(fast_cfg(), ScriptedStrategy::new(0, Duration::ZERO));
        requester.start().await;
        requester.stop().await;
        assert_eq!(
            requester.enqueue(PollRequest::new(key(), window(0, 1))).await,
            EnqueueOutcome::RejectedShuttingDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_updates_kpis_before_result_is_published() {
        let strategy = ScriptedStrategy::new(0, Duration::from_millis(50));
        let (requester, mut rx, tracker) = build(fast_cfg(), strategy);
        requester.start().await;
        requester.enqueue(PollRequest::new(key(), window(0, 5))).await;

        let result = rx.recv().await.expect("one result");
        assert!(result.status.is_success());
        assert_eq!(result.payload.as_deref(), Some(br#"{"v":1}"#.as_slice()));
        assert_eq!(result.window, window(0, 5));
        assert_eq!(result.source, "scripted");

        // KPIs were written before the publish.
        let kpis = tracker.get_kpis_snapshot(&key()).await.unwrap();
        assert_eq!(kpis.consecutive_errors, 0);
        assert!(kpis.last_success_ts.is_some());
        requester.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_threshold_and_pauses_calls() {
        let strategy = ScriptedStrategy::new(u32::MAX, Duration::ZERO);
        let (requester, mut rx, tracker) = build(fast_cfg(), Arc::clone(&strategy) as _);
        requester.start().await;
        for i in 0..5u32 {
            let outcome = requester
                .enqueue(PollRequest::new(key(), window(i, i + 1)))
                .await;
            assert_eq!(outcome, EnqueueOutcome::Accepted);
        }

        // Errors at t=0,1,2; breaker opens after the third backoff; the
        // fourth call runs only once the 2s pause has elapsed (t=5).
        for _ in 0..4 {
            let result = rx.recv().await.expect("result");
            assert!(!result.status.is_success());
        }
        let times = strategy.call_times().await;
        assert!(times.len() >= 4);
        let t0 = times[0];
        let offsets: Vec<u64> = times[..4]
            .iter()
            .map(|t| t.duration_since(t0).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 5]);

        let kpis = tracker.get_kpis_snapshot(&key()).await.unwrap();
        assert!(kpis.circuit_breaker_open);
        requester.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_minus_one_does_not_open_the_breaker() {
        let strategy = ScriptedStrategy::new(2, Duration::ZERO);
        let (requester, mut rx, tracker) = build(fast_cfg(), Arc::clone(&strategy) as _);
        requester.start().await;
        for i in 0..3u32 {
            requester
                .enqueue(PollRequest::new(key(), window(i, i + 1)))
                .await;
        }

        // Two errors, then a success: the breaker never opens, and the
        // success closes the error run.
        for _ in 0..2 {
            let result = rx.recv().await.unwrap();
            assert!(!result.status.is_success());
            let kpis = tracker.get_kpis_snapshot(&key()).await.unwrap();
            assert!(!kpis.circuit_breaker_open);
        }
        let result = rx.recv().await.unwrap();
        assert!(result.status.is_success());
        let kpis = tracker.get_kpis_snapshot(&key()).await.unwrap();
        assert_eq!(kpis.consecutive_errors, 0);
        assert!(!kpis.circuit_breaker_open);
        requester.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_strategy_call_in_flight() {
        let strategy = ScriptedStrategy::new(0, Duration::from_millis(20));
        let cfg = RequesterConfig {
            coalescing_enabled: false,
            ..fast_cfg()
        };
        let (requester, mut rx, _tracker) = build(cfg, Arc::clone(&strategy) as _);
        requester.start().await;
        for i in 0..6u32 {
            requester
                .enqueue(PollRequest::new(key(), window(i, i + 1)))
                .await;
        }
        for _ in 0..6 {
            rx.recv().await.unwrap();
        }
        assert_eq!(strategy.max_concurrent.load(Ordering::SeqCst), 1);
        requester.stop().await;
    }

    /// A strategy that reports cancellation on every call.
    struct CancelledStrategy;

    #[async_trait]
    impl RequestStrategy for CancelledStrategy {
        fn name(&self) -> &str {
            "cancelled"
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _request: &PollRequest,
        ) -> Result<Vec<u8>, StrategyError> {
            Err(StrategyError::cancelled())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_non_fault() {
        let (requester, mut rx, tracker) = build(fast_cfg(), Arc::new(CancelledStrategy));
        requester.start().await;
        requester.enqueue(PollRequest::new(key(), window(0, 1))).await;

        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, FetchStatus::Failed(FetchErrorKind::Cancelled));
        let kpis = tracker.get_kpis_snapshot(&key()).await.unwrap();
        assert_eq!(kpis.consecutive_errors, 0);
        assert!(!kpis.circuit_breaker_open);
        assert!(kpis.last_error_ts.is_none());
        requester.stop().await;
    }
}
