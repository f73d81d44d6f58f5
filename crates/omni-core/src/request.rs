//! Poll requests and fetch results.
//!
//! A [`PollRequest`] is one unit of work for a requester; it is ephemeral
//! and consumed on dequeue.  A [`FetchResult`] is the outcome of one
//! strategy execution, produced by the requester and consumed exactly once
//! by the router.

use crate::stream::StreamKey;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        TimeWindow { from, to }
    }

    /// The smallest window containing both inputs.  Coalescing merges
    /// consecutive queued requests into the union of their windows.
    pub fn union(&self, other: &TimeWindow) -> TimeWindow {
        TimeWindow {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }
}

/// One unit of work for a requester.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub key: StreamKey,
    pub window: TimeWindow,
    pub request_id: Uuid,
    pub enqueued_at: Instant,
}

impl PollRequest {
    pub fn new(key: StreamKey, window: TimeWindow) -> Self {
        PollRequest {
            key,
            window,
            request_id: Uuid::new_v4(),
            enqueued_at: Instant::now(),
        }
    }
}

/// Classified failure kind of a strategy execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    ClientError,
    ServerError,
    ConnectionRefused,
    /// Cancelled by shutdown; non-fault (no counter or breaker advance).
    Cancelled,
    Other,
}

impl FetchErrorKind {
    /// Projection used for metrics labels.  `Cancelled` is not part of the
    /// exported label set and projects to `other`.
    pub fn as_label(self) -> &'static str {
        match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::ClientError => "client_error",
            FetchErrorKind::ServerError => "server_error",
            FetchErrorKind::ConnectionRefused => "connection_refused",
            FetchErrorKind::Cancelled | FetchErrorKind::Other => "other",
        }
    }
}

/// Outcome classification of one strategy execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Failed(FetchErrorKind),
}

impl FetchStatus {
    pub fn is_success(self) -> bool {
        matches!(self, FetchStatus::Success)
    }

    pub fn as_label(self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Failed(kind) => kind.as_label(),
        }
    }
}

/// Outcome of one strategy execution for one poll request.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub key: StreamKey,
    pub window: TimeWindow,
    /// Name of the strategy that produced this result.
    pub source: String,
    pub latency: Duration,
    pub status: FetchStatus,
    pub error: Option<String>,
    /// Raw payload bytes; present only on success.
    pub payload: Option<Vec<u8>>,
}
