// omni-proto: Dashboard WebSocket session protocol types and serialization.
//
// All frames are JSON text messages with a top-level `type` field for
// discriminated deserialization.  The enum variants map 1:1 to the frozen
// v1 message types.  Binary frames are not part of the protocol.

use serde::{Deserialize, Serialize};

/// Protocol version identifier, echoed in the `ACK` for a successful
/// connection handshake and usable for content negotiation.
pub const PROTOCOL_VERSION: &str = "omniapi-ws-v1";

/// Envelope version carried in the `v` field of DATA and STATUS frames.
pub const ENVELOPE_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Wire identity of a stream, embedded in DATA and STATUS frames.
///
/// `cage_id` is omitted from the JSON entirely when the stream is not
/// cage-scoped; an empty string is a real (present) cage id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStream {
    pub tenant: String,
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "cageId", default, skip_serializing_if = "Option::is_none")]
    pub cage_id: Option<String>,
    pub kind: String,
    pub metric: String,
}

/// One entry in a SUB's `streams` array.
///
/// `kind` selects the event category; `metric`, when present, refines it
/// (unknown metric names are accepted with a WARN and projected to `other`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelector {
    pub kind: String,
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "cageId", default, skip_serializing_if = "Option::is_none")]
    pub cage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// Subscribe to one or more streams.  Creates one subscription per entry
/// in `streams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMessage {
    pub streams: Vec<StreamSelector>,
    #[serde(rename = "includeStatus", default)]
    pub include_status: bool,
    /// Minimum milliseconds between delivered DATA frames per
    /// (subscription, stream).  0 disables throttling.
    #[serde(rename = "throttleMs", default)]
    pub throttle_ms: u64,
    /// Request an immediate STATUS snapshot for every currently-known
    /// stream matching the new subscriptions.
    #[serde(rename = "needSnapshot", default)]
    pub need_snapshot: bool,
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Positive acknowledgement of a client request (SUB or UNSUB).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Protocol error.  The session stays open for every code except socket
/// level failures; the client may correct and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// One of the frozen codes in [`error_codes`].
    pub code: String,
    pub message: String,
}

/// Non-fatal advisory (e.g. a SUB entry referenced an unknown metric and
/// was projected to `other`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnMessage {
    pub message: String,
}

/// Flags surfaced on a DATA frame.  Only set when at least one bit is
/// meaningful to the client; `partial` marks a payload whose window may be
/// incomplete (late-arriving data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

/// A routed telemetry event.  `ts` is the event-origin timestamp in Unix
/// milliseconds (the upper bound of the polled window), not delivery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub v: u16,
    pub ts: i64,
    pub stream: WireStream,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<DataFlags>,
}

/// Stream health descriptor inside a STATUS frame.
///
/// Field names are frozen; absent optionals mean "never observed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    pub staleness_s: u64,
    pub in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_msg: Option<String>,
    /// One of: ok, partial, degraded, failing, paused.
    pub state: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A stream health heartbeat.  `ts` is the emission timestamp in Unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub v: u16,
    pub ts: i64,
    pub stream: WireStream,
    pub status: StatusBody,
}

/// Frozen v1 error codes.
pub mod error_codes {
    pub const MISSING_TENANT: &str = "MISSING_TENANT";
    pub const INVALID_TENANT: &str = "INVALID_TENANT";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const INVALID_SUB: &str = "INVALID_SUB";
    pub const SUB_FAILED: &str = "SUB_FAILED";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All WebSocket message types in the v1 session protocol.
///
/// Serializes/deserializes using the `type` field as a tag.
///
/// ```json
/// { "type": "SUB", "streams": [ ... ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "SUB")]
    Sub(SubMessage),
    #[serde(rename = "UNSUB")]
    Unsub,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ACK")]
    Ack(AckMessage),
    #[serde(rename = "ERROR")]
    Error(ErrorMessage),
    #[serde(rename = "WARN")]
    Warn(WarnMessage),
    #[serde(rename = "DATA")]
    Data(DataMessage),
    #[serde(rename = "STATUS")]
    Status(StatusMessage),
}

impl WsMessage {
    /// Build an ERROR frame from a frozen code and a human message.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        WsMessage::Error(ErrorMessage {
            code: code.to_owned(),
            message: message.into(),
        })
    }

    /// Build an ACK frame with no payload.
    pub fn ack(message: impl Into<String>) -> Self {
        WsMessage::Ack(AckMessage {
            message: message.into(),
            data: None,
        })
    }
}
