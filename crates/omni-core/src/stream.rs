//! Stream identity.
//!
//! A stream is the continuous series of observations for one
//! (tenant, site, cage?, metric, source) tuple.  [`StreamKey`] is the
//! immutable identity used as the map key in the tracker and the router.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Telemetry category of a stream.
///
/// The categorical set is closed; anything outside it projects to `Other`
/// (including at the metrics-label boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Feeding,
    Biometric,
    Climate,
    Water,
    Ops,
    Status,
    Other,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Feeding => "feeding",
            MetricKind::Biometric => "biometric",
            MetricKind::Climate => "climate",
            MetricKind::Water => "water",
            MetricKind::Ops => "ops",
            MetricKind::Status => "status",
            MetricKind::Other => "other",
        }
    }

    /// Parse a metric name, projecting unknown names to `Other`.
    ///
    /// Returns the kind and whether the name was recognized, so callers can
    /// surface a warning for projected names without failing the request.
    pub fn parse_lenient(name: &str) -> (Self, bool) {
        match name.to_ascii_lowercase().as_str() {
            "feeding" => (MetricKind::Feeding, true),
            "biometric" => (MetricKind::Biometric, true),
            "climate" => (MetricKind::Climate, true),
            "water" => (MetricKind::Water, true),
            "ops" => (MetricKind::Ops, true),
            "status" => (MetricKind::Status, true),
            "other" => (MetricKind::Other, true),
            _ => (MetricKind::Other, false),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a stream's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Cloud,
    ProcessApi,
    Derived,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Cloud => "cloud",
            SourceKind::ProcessApi => "processapi",
            SourceKind::Derived => "derived",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of a data stream.
///
/// Equality is over all five fields; `cage: None` is distinct from
/// `cage: Some("")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub tenant: String,
    pub site: String,
    pub cage: Option<String>,
    pub metric: MetricKind,
    pub source: SourceKind,
}

impl StreamKey {
    pub fn new(
        tenant: impl Into<String>,
        site: impl Into<String>,
        cage: Option<String>,
        metric: MetricKind,
        source: SourceKind,
    ) -> Self {
        StreamKey {
            tenant: tenant.into(),
            site: site.into(),
            cage,
            metric,
            source,
        }
    }

    /// The scope over which envelope sequence numbers are monotonic.
    pub fn sequence_scope(&self) -> (String, String, MetricKind) {
        (self.tenant.clone(), self.site.clone(), self.metric)
    }
}

// Display reads "tenant/site[/cage]/metric@source" in logs.
impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.site)?;
        if let Some(cage) = &self.cage {
            write!(f, "/{cage}")?;
        }
        write!(f, "/{}@{}", self.metric, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_cage_is_distinct_from_empty_cage() {
        let absent = StreamKey::new("t", "s", None, MetricKind::Feeding, SourceKind::Cloud);
        let empty = StreamKey::new(
            "t",
            "s",
            Some(String::new()),
            MetricKind::Feeding,
            SourceKind::Cloud,
        );
        assert_ne!(absent, empty);

        let mut set = std::collections::HashSet::new();
        set.insert(absent);
        set.insert(empty);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_lenient_projects_unknown_to_other() {
        assert_eq!(MetricKind::parse_lenient("feeding"), (MetricKind::Feeding, true));
        assert_eq!(MetricKind::parse_lenient("CLIMATE"), (MetricKind::Climate, true));
        assert_eq!(MetricKind::parse_lenient("turbidity"), (MetricKind::Other, false));
    }

    #[test]
    fn sequence_scope_ignores_cage_and_source() {
        let a = StreamKey::new("t", "s", Some("c1".into()), MetricKind::Water, SourceKind::Cloud);
        let b = StreamKey::new("t", "s", None, MetricKind::Water, SourceKind::ProcessApi);
        assert_eq!(a.sequence_scope(), b.sequence_scope());
    }
}
