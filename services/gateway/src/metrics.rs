//! Prometheus exposition.
//!
//! All families carry the `omniapi_` prefix.  Label values are sanitized
//! before use: tenant and site are truncated to bounded lengths and
//! normalized to `unknown` when missing; metric and error-code labels come
//! from closed categorical sets, so cardinality is bounded by config, not
//! by traffic.

use axum::http::StatusCode;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

const TENANT_LABEL_MAX: usize = 32;
const SITE_LABEL_MAX: usize = 48;

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "omniapi_requests_total",
        "Strategy executions by outcome",
        &["tenant", "site", "metric", "status"]
    )
    .expect("register omniapi_requests_total");
    pub static ref REQUEST_LATENCY: HistogramVec = register_histogram_vec!(
        "omniapi_request_latency_seconds",
        "Strategy execution latency",
        &["metric"]
    )
    .expect("register omniapi_request_latency_seconds");
    pub static ref REQUEST_ERRORS: IntCounterVec = register_int_counter_vec!(
        "omniapi_request_errors_total",
        "Strategy failures by classified code",
        &["metric", "code"]
    )
    .expect("register omniapi_request_errors_total");
    pub static ref EVENTS_ROUTED: IntCounterVec = register_int_counter_vec!(
        "omniapi_events_routed_total",
        "Events delivered to sessions, by kind (data/status)",
        &["kind"]
    )
    .expect("register omniapi_events_routed_total");
    pub static ref EVENTS_DROPPED: IntCounterVec = register_int_counter_vec!(
        "omniapi_events_dropped_total",
        "Events not delivered (buffer full, throttled), by kind",
        &["kind"]
    )
    .expect("register omniapi_events_dropped_total");
    pub static ref WS_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "omniapi_ws_sessions_active",
        "Currently connected WebSocket sessions"
    )
    .expect("register omniapi_ws_sessions_active");
    pub static ref WS_FRAMES_SENT: IntCounterVec = register_int_counter_vec!(
        "omniapi_ws_frames_sent_total",
        "Outbound frames written to sockets, by frame type",
        &["type"]
    )
    .expect("register omniapi_ws_frames_sent_total");
    pub static ref STATUS_KEEP_LATEST: IntCounter = register_int_counter!(
        "omniapi_status_keep_latest_total",
        "STATUS frames superseded under backpressure (keep-latest)"
    )
    .expect("register omniapi_status_keep_latest_total");
    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        "omniapi_delivery_latency_seconds",
        "Router-callback to outbound-buffer enqueue latency"
    )
    .expect("register omniapi_delivery_latency_seconds");
    pub static ref ENQUEUE_REJECTED: IntCounterVec = register_int_counter_vec!(
        "omniapi_enqueue_rejected_total",
        "Poll requests rejected by a requester queue",
        &["reason"]
    )
    .expect("register omniapi_enqueue_rejected_total");
}

/// Bounded tenant label: truncated, `unknown` when empty.
pub fn tenant_label(tenant: &str) -> String {
    bounded_label(tenant, TENANT_LABEL_MAX)
}

/// Bounded site label: truncated, `unknown` when empty.
pub fn site_label(site: &str) -> String {
    bounded_label(site, SITE_LABEL_MAX)
}

fn bounded_label(value: &str, max: usize) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "unknown".to_owned();
    }
    trimmed.chars().take(max).collect()
}

/// `GET /metrics` handler: text exposition of every registered family.
pub async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
