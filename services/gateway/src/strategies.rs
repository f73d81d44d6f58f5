//! Concrete request strategies.
//!
//! Vendor cloud clients are out of scope; the generic ProcessAPI adapter
//! below is the one concrete strategy the gateway ships.  It GETs a JSON
//! document for (site, metric, window) from a local collector and
//! classifies transport and HTTP failures into the core error kinds.

use crate::config::ConnectionConfig;
use async_trait::async_trait;
use omni_core::request::PollRequest;
use omni_core::strategy::{RequestStrategy, StrategyError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the strategy for a configured connection, if its provider type
/// is supported.
pub fn for_connection(conn: &ConnectionConfig) -> Option<Arc<dyn RequestStrategy>> {
    if conn.type_id.eq_ignore_ascii_case("processapi") {
        let base_url = conn.provider.base_url.as_deref()?;
        return ProcessApiStrategy::new(base_url)
            .ok()
            .map(|s| Arc::new(s) as Arc<dyn RequestStrategy>);
    }
    None
}

/// Polls a local ProcessAPI collector over HTTP.
pub struct ProcessApiStrategy {
    base_url: String,
    client: reqwest::Client,
}

impl ProcessApiStrategy {
    pub fn new(base_url: &str) -> Result<Self, StrategyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StrategyError::other(format!("building http client: {e}")))?;
        Ok(ProcessApiStrategy {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url_for(&self, request: &PollRequest) -> String {
        format!(
            "{}/v1/sites/{}/metrics/{}?from={}&to={}",
            self.base_url,
            request.key.site,
            request.key.metric,
            request.window.from.timestamp(),
            request.window.to.timestamp(),
        )
    }
}

#[async_trait]
impl RequestStrategy for ProcessApiStrategy {
    fn name(&self) -> &str {
        "processapi"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &PollRequest,
    ) -> Result<Vec<u8>, StrategyError> {
        let url = self.url_for(request);
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(StrategyError::cancelled()),
            response = self.client.get(&url).send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(StrategyError::timeout(format!("GET {url}: {e}")))
            }
            Err(e) if e.is_connect() => {
                return Err(StrategyError::connection_refused(format!("GET {url}: {e}")))
            }
            Err(e) => return Err(StrategyError::other(format!("GET {url}: {e}"))),
        };

        let status = response.status();
        if status.is_client_error() {
            return Err(StrategyError::client(format!("GET {url}: HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(StrategyError::server(format!("GET {url}: HTTP {status}")));
        }
        let body = tokio::select! {
            () = cancel.cancelled() => return Err(StrategyError::cancelled()),
            body = response.bytes() => body,
        };
        body.map(|bytes| bytes.to_vec())
            .map_err(|e| StrategyError::other(format!("reading body from {url}: {e}")))
    }
}
