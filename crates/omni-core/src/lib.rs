// omni-core: the streaming data plane of the telemetry gateway.
//
// Contains the per-stream poll scheduler (requester), the shared KPI store
// (tracker), the heartbeat emitter (status), and the routing fabric
// (index + router).  No networking lives here; the gateway service wires
// these pieces to sockets.

pub mod collector;
pub mod event;
pub mod index;
pub mod request;
pub mod requester;
pub mod router;
pub mod status;
pub mod strategy;
pub mod stream;
pub mod tracker;

pub use event::{CanonicalEvent, EventEnvelope};
pub use request::{FetchErrorKind, FetchResult, FetchStatus, PollRequest, TimeWindow};
pub use requester::{EnqueueOutcome, Requester, RequesterConfig};
pub use router::{DeliveryContext, DeliveryOutcome, RoutedEvent, Router, RouterConfig};
pub use status::{determine_state, StatusConfig, StatusPusher, StatusSnapshot, StreamState};
pub use strategy::{RequestStrategy, StrategyError};
pub use stream::{MetricKind, SourceKind, StreamKey};
pub use tracker::{StreamKpis, StreamTracker};
