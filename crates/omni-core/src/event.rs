//! Canonical routed events.
//!
//! Everything that reaches a client goes through a [`CanonicalEvent`]:
//! an envelope (identity, sequence, flags, trace id) around an opaque
//! payload.  The envelope timestamp is event-origin time — the upper
//! bound of the polled window — never enqueue or delivery time.

use crate::stream::StreamKey;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Envelope flag bits.
pub mod flags {
    pub const RETRY: u8 = 1;
    pub const DUPLICATE: u8 = 1 << 1;
    pub const LATE: u8 = 1 << 2;
    pub const SYNTHETIC: u8 = 1 << 3;
}

/// Metadata surrounding a canonical event's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub version: u16,
    /// Event-origin time.
    pub timestamp: DateTime<Utc>,
    pub key: StreamKey,
    /// Name of the producing strategy, or `status` for heartbeats.
    pub source: String,
    /// Monotonically non-decreasing within (tenant, site, metric).
    pub sequence: u64,
    pub flags: u8,
    pub trace_id: Uuid,
}

impl EventEnvelope {
    pub fn has_flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }
}

/// A routed message: envelope + kind + opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub envelope: EventEnvelope,
    /// Derived from the stream metric, or `status` for heartbeats.
    pub kind: String,
    pub schema_version: u16,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_distinct() {
        let bits = [flags::RETRY, flags::DUPLICATE, flags::LATE, flags::SYNTHETIC];
        for (i, a) in bits.iter().enumerate() {
            for b in &bits[i + 1..] {
                assert_eq!(a & b, 0);
            }
        }
    }

    #[test]
    fn has_flag_reads_combined_bits() {
        let envelope = EventEnvelope {
            version: 1,
            timestamp: Utc::now(),
            key: StreamKey::new(
                "t",
                "s",
                None,
                crate::stream::MetricKind::Ops,
                crate::stream::SourceKind::Derived,
            ),
            source: "derived".to_owned(),
            sequence: 1,
            flags: flags::LATE | flags::SYNTHETIC,
            trace_id: Uuid::new_v4(),
        };
        assert!(envelope.has_flag(flags::LATE));
        assert!(envelope.has_flag(flags::SYNTHETIC));
        assert!(!envelope.has_flag(flags::RETRY));
    }
}
