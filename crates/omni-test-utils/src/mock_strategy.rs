use async_trait::async_trait;
use omni_core::request::PollRequest;
use omni_core::strategy::{RequestStrategy, StrategyError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted call outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Payload(Vec<u8>),
    Error(StrategyError),
}

/// A scripted [`RequestStrategy`] for tests.
///
/// Pops one outcome per call from the script; when the script runs dry,
/// every further call returns the default outcome.  Each call sleeps
/// `delay` first (cancellable), so latency-sensitive tests get a
/// deterministic duration under a paused clock.
pub struct MockStrategy {
    name: String,
    delay: Duration,
    script: Mutex<VecDeque<MockOutcome>>,
    default: MockOutcome,
    calls: AtomicU32,
}

impl MockStrategy {
    /// A strategy that always succeeds with `payload` after `delay`.
    pub fn succeeding(payload: &[u8], delay: Duration) -> Arc<Self> {
        Arc::new(MockStrategy {
            name: "mock".to_owned(),
            delay,
            script: Mutex::new(VecDeque::new()),
            default: MockOutcome::Payload(payload.to_vec()),
            calls: AtomicU32::new(0),
        })
    }

    /// A strategy that always fails with `error`.
    pub fn failing(error: StrategyError) -> Arc<Self> {
        Arc::new(MockStrategy {
            name: "mock".to_owned(),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            default: MockOutcome::Error(error),
            calls: AtomicU32::new(0),
        })
    }

    /// A strategy that plays `script` in order, then repeats `default`.
    pub fn scripted(script: Vec<MockOutcome>, default: MockOutcome) -> Arc<Self> {
        Arc::new(MockStrategy {
            name: "mock".to_owned(),
            delay: Duration::ZERO,
            script: Mutex::new(script.into()),
            default,
            calls: AtomicU32::new(0),
        })
    }

    /// Total calls observed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestStrategy for MockStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        _request: &PollRequest,
    ) -> Result<Vec<u8>, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(StrategyError::cancelled()),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        match outcome {
            MockOutcome::Payload(bytes) => Ok(bytes),
            MockOutcome::Error(error) => Err(error),
        }
    }
}
