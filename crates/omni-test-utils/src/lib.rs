// omni-test-utils: test doubles for gateway integration tests.
//
// MockStrategy stands in for a vendor adapter with scripted outcomes;
// WsTestClient is a typed client for the dashboard WebSocket protocol.

mod mock_strategy;
mod ws_client;

pub use mock_strategy::{MockOutcome, MockStrategy};
pub use ws_client::WsTestClient;
