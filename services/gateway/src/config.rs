//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/omniapi/gateway.toml`.
//!
//! Every section is optional and falls back to documented defaults.
//! Unknown keys are ignored with a warning; structural errors (wrong
//! types, a malformed backoff ladder) are fatal at startup.

use omni_core::requester::RequesterConfig;
use omni_core::status::StatusConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub requester: RequesterSection,
    pub status: StatusSection,
    pub websocket: WebsocketSection,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone)]
pub struct RequesterSection {
    pub timeout_seconds: u64,
    pub backoff_seconds: [u64; 3],
    pub failures_threshold: u32,
    pub pause_minutes: u64,
    pub coalescing_enabled: bool,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct StatusSection {
    pub heartbeat_seconds: u64,
    pub stale_threshold_ok: u64,
    pub stale_threshold_degraded: u64,
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone)]
pub struct WebsocketSection {
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Seconds allowed for one outbound socket write.
    pub write_wait: u64,
    /// Read deadline: the session closes after this many seconds without
    /// an inbound frame.
    pub pong_wait: u64,
    /// Interval for transport pings when the outbound path is idle.
    pub ping_period: u64,
    pub max_message_size: usize,
    /// Bounded per-session outbound buffer, in messages.
    pub outbound_buffer_size: usize,
}

/// One upstream connection: a (tenant, site) pair polled for a set of
/// metrics through one provider.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub tenant_id: String,
    /// Provider type, e.g. `processapi`.
    pub type_id: String,
    pub site_id: String,
    pub metrics: Vec<String>,
    pub active: bool,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub poll_seconds: u64,
}

impl GatewayConfig {
    pub fn requester_config(&self) -> RequesterConfig {
        RequesterConfig {
            request_timeout: Duration::from_secs(self.requester.timeout_seconds),
            backoff_steps: [
                Duration::from_secs(self.requester.backoff_seconds[0]),
                Duration::from_secs(self.requester.backoff_seconds[1]),
                Duration::from_secs(self.requester.backoff_seconds[2]),
            ],
            breaker_threshold: self.requester.failures_threshold,
            breaker_pause: Duration::from_secs(self.requester.pause_minutes * 60),
            max_queue_size: self.requester.max_queue_size,
            coalescing_enabled: self.requester.coalescing_enabled,
        }
    }

    pub fn status_config(&self) -> StatusConfig {
        StatusConfig {
            heartbeat_interval: Duration::from_secs(self.status.heartbeat_seconds),
            stale_threshold_ok: self.status.stale_threshold_ok,
            stale_threshold_degraded: self.status.stale_threshold_degraded,
            max_consecutive_errors: self.status.max_consecutive_errors,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            requester: RequesterSection::default(),
            status: StatusSection::default(),
            websocket: WebsocketSection::default(),
            connections: Vec::new(),
        }
    }
}

impl Default for RequesterSection {
    fn default() -> Self {
        RequesterSection {
            timeout_seconds: 30,
            backoff_seconds: [60, 120, 300],
            failures_threshold: 5,
            pause_minutes: 30,
            coalescing_enabled: true,
            max_queue_size: 1_000,
        }
    }
}

impl Default for StatusSection {
    fn default() -> Self {
        StatusSection {
            heartbeat_seconds: 10,
            stale_threshold_ok: 30,
            stale_threshold_degraded: 120,
            max_consecutive_errors: 5,
        }
    }
}

impl Default for WebsocketSection {
    fn default() -> Self {
        WebsocketSection {
            read_buffer: 4_096,
            write_buffer: 4_096,
            write_wait: 10,
            pong_wait: 60,
            ping_period: 54,
            max_message_size: 1 << 20,
            outbound_buffer_size: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    requester: Option<RawRequester>,
    status: Option<RawStatus>,
    websocket: Option<RawWebsocket>,
    connections: Option<Vec<RawConnection>>,
}

#[derive(Debug, Deserialize)]
struct RawRequester {
    timeout_seconds: Option<u64>,
    backoff_seconds: Option<Vec<u64>>,
    circuit_breaker: Option<RawCircuitBreaker>,
    coalescing_enabled: Option<bool>,
    max_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawCircuitBreaker {
    failures_threshold: Option<u32>,
    pause_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    heartbeat_seconds: Option<u64>,
    stale_threshold_ok: Option<u64>,
    stale_threshold_degraded: Option<u64>,
    max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawWebsocket {
    read_buffer: Option<usize>,
    write_buffer: Option<usize>,
    write_wait: Option<u64>,
    pong_wait: Option<u64>,
    ping_period: Option<u64>,
    max_message_size: Option<usize>,
    outbound_buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    id: Option<String>,
    tenant_id: Option<String>,
    type_id: Option<String>,
    site_id: Option<String>,
    metrics: Option<Vec<String>>,
    status: Option<String>,
    provider_config: Option<RawProviderConfig>,
}

#[derive(Debug, Deserialize)]
struct RawProviderConfig {
    base_url: Option<String>,
    poll_seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/omniapi/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/omniapi/gateway.toml"))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let value: toml::Value =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if let Some(table) = value.as_table() {
        warn_unknown_keys(table, &["requester", "status", "websocket", "connections"], "");
        if let Some(section) = table.get("requester").and_then(toml::Value::as_table) {
            warn_unknown_keys(
                section,
                &[
                    "timeout_seconds",
                    "backoff_seconds",
                    "circuit_breaker",
                    "coalescing_enabled",
                    "max_queue_size",
                ],
                "requester.",
            );
        }
        if let Some(section) = table.get("status").and_then(toml::Value::as_table) {
            warn_unknown_keys(
                section,
                &[
                    "heartbeat_seconds",
                    "stale_threshold_ok",
                    "stale_threshold_degraded",
                    "max_consecutive_errors",
                ],
                "status.",
            );
        }
        if let Some(section) = table.get("websocket").and_then(toml::Value::as_table) {
            warn_unknown_keys(
                section,
                &[
                    "read_buffer",
                    "write_buffer",
                    "write_wait",
                    "pong_wait",
                    "ping_period",
                    "max_message_size",
                    "outbound_buffer_size",
                ],
                "websocket.",
            );
        }
    }

    let raw: RawConfig = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

fn warn_unknown_keys(table: &toml::value::Table, known: &[&str], prefix: &str) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            warn!(key = format!("{prefix}{key}"), "unknown config key ignored");
        }
    }
}

fn validate(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let defaults = GatewayConfig::default();

    let requester = match raw.requester {
        Some(r) => {
            let backoff_seconds = match r.backoff_seconds {
                Some(steps) => {
                    if steps.len() != 3 {
                        return Err(ConfigError::Invalid(format!(
                            "requester.backoff_seconds must have exactly 3 entries, got {}",
                            steps.len()
                        )));
                    }
                    if steps[0] > steps[1] || steps[1] > steps[2] {
                        return Err(ConfigError::Invalid(
                            "requester.backoff_seconds must be non-decreasing".to_owned(),
                        ));
                    }
                    [steps[0], steps[1], steps[2]]
                }
                None => defaults.requester.backoff_seconds,
            };
            let breaker = r.circuit_breaker.unwrap_or(RawCircuitBreaker {
                failures_threshold: None,
                pause_minutes: None,
            });
            let failures_threshold = breaker
                .failures_threshold
                .unwrap_or(defaults.requester.failures_threshold);
            if failures_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "requester.circuit_breaker.failures_threshold must be >= 1".to_owned(),
                ));
            }
            RequesterSection {
                timeout_seconds: r.timeout_seconds.unwrap_or(defaults.requester.timeout_seconds),
                backoff_seconds,
                failures_threshold,
                pause_minutes: breaker.pause_minutes.unwrap_or(defaults.requester.pause_minutes),
                coalescing_enabled: r
                    .coalescing_enabled
                    .unwrap_or(defaults.requester.coalescing_enabled),
                max_queue_size: r.max_queue_size.unwrap_or(defaults.requester.max_queue_size),
            }
        }
        None => defaults.requester,
    };

    let status = match raw.status {
        Some(s) => StatusSection {
            heartbeat_seconds: s.heartbeat_seconds.unwrap_or(defaults.status.heartbeat_seconds),
            stale_threshold_ok: s
                .stale_threshold_ok
                .unwrap_or(defaults.status.stale_threshold_ok),
            stale_threshold_degraded: s
                .stale_threshold_degraded
                .unwrap_or(defaults.status.stale_threshold_degraded),
            max_consecutive_errors: s
                .max_consecutive_errors
                .unwrap_or(defaults.status.max_consecutive_errors),
        },
        None => defaults.status,
    };

    let websocket = match raw.websocket {
        Some(w) => WebsocketSection {
            read_buffer: w.read_buffer.unwrap_or(defaults.websocket.read_buffer),
            write_buffer: w.write_buffer.unwrap_or(defaults.websocket.write_buffer),
            write_wait: w.write_wait.unwrap_or(defaults.websocket.write_wait),
            pong_wait: w.pong_wait.unwrap_or(defaults.websocket.pong_wait),
            ping_period: w.ping_period.unwrap_or(defaults.websocket.ping_period),
            max_message_size: w
                .max_message_size
                .unwrap_or(defaults.websocket.max_message_size),
            outbound_buffer_size: w
                .outbound_buffer_size
                .unwrap_or(defaults.websocket.outbound_buffer_size),
        },
        None => defaults.websocket,
    };

    let mut connections = Vec::new();
    for (i, raw_conn) in raw.connections.unwrap_or_default().into_iter().enumerate() {
        let id = raw_conn
            .id
            .ok_or_else(|| ConfigError::Invalid(format!("connections[{i}].id is required")))?;
        let tenant_id = raw_conn.tenant_id.ok_or_else(|| {
            ConfigError::Invalid(format!("connections[{i}].tenant_id is required"))
        })?;
        let type_id = raw_conn.type_id.ok_or_else(|| {
            ConfigError::Invalid(format!("connections[{i}].type_id is required"))
        })?;
        let site_id = raw_conn.site_id.ok_or_else(|| {
            ConfigError::Invalid(format!("connections[{i}].site_id is required"))
        })?;
        let metrics = raw_conn.metrics.unwrap_or_default();
        if metrics.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "connections[{i}].metrics must list at least one metric"
            )));
        }
        let active = match raw_conn.status.as_deref() {
            None | Some("active") => true,
            Some("inactive") => false,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "connections[{i}].status must be 'active' or 'inactive', got '{other}'"
                )))
            }
        };
        let provider = raw_conn
            .provider_config
            .map(|p| ProviderConfig {
                base_url: p.base_url,
                poll_seconds: p.poll_seconds.unwrap_or(60),
            })
            .unwrap_or(ProviderConfig {
                base_url: None,
                poll_seconds: 60,
            });
        connections.push(ConnectionConfig {
            id,
            tenant_id,
            type_id,
            site_id,
            metrics,
            active,
            provider,
        });
    }

    Ok(GatewayConfig {
        requester,
        status,
        websocket,
        connections,
    })
}
