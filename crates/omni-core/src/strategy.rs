//! The pluggable vendor-call seam.
//!
//! A [`RequestStrategy`] performs one upstream call for one poll request.
//! Implementations live outside the core (the gateway wires one per
//! connection); the requester only sees this trait.
//!
//! # Cancellation
//! `execute` must honor the cancellation token and return promptly with a
//! [`FetchErrorKind::Cancelled`] error when it fires.  The requester
//! classifies cancellation as non-fault: no error counter increment, no
//! circuit-breaker advance.

use crate::request::{FetchErrorKind, PollRequest};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A classified strategy failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StrategyError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl StrategyError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        StrategyError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ClientError, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ServerError, message)
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ConnectionRefused, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FetchErrorKind::Cancelled, "execution cancelled")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Other, message)
    }
}

/// Performs one vendor call and returns the raw payload bytes.
///
/// Idempotency is not required; the requester never re-executes a request
/// on failure (retries come only from future enqueues upstream).
#[async_trait]
pub trait RequestStrategy: Send + Sync {
    /// Strategy name, recorded as the event source on routed data.
    fn name(&self) -> &str;

    /// Perform one call for `request`, bounded by the caller's timeout and
    /// the cancellation token.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &PollRequest,
    ) -> Result<Vec<u8>, StrategyError>;

    /// Optional health probe.  The default reports healthy; requesters
    /// infer health from result history when a strategy cannot do better.
    async fn health_check(&self) -> Result<(), StrategyError> {
        Ok(())
    }
}
