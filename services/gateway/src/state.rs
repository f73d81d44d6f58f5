//! Shared gateway state and core wiring.
//!
//! `AppState::new` assembles the data plane: tracker, router (with the
//! hub delivery callback installed), the requester-result metrics bridge,
//! and the status pusher.  Requesters are attached afterwards from the
//! connections config (see `scheduler::spawn_connections`).

use crate::config::GatewayConfig;
use crate::metrics;
use crate::session::SessionRegistry;
use omni_core::request::{FetchResult, FetchStatus};
use omni_core::router::{Router, RouterConfig};
use omni_core::status::StatusPusher;
use omni_core::tracker::StreamTracker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub tracker: Arc<StreamTracker>,
    pub sessions: Arc<SessionRegistry>,
    pub cancel: CancellationToken,
    /// Requester results enter here; a bridge task records metrics and
    /// forwards into the router.
    pub results_tx: mpsc::Sender<FetchResult>,
}

impl AppState {
    pub async fn new(config: GatewayConfig, cancel: CancellationToken) -> Self {
        let config = Arc::new(config);
        let tracker = Arc::new(StreamTracker::new());
        let sessions = Arc::new(SessionRegistry::new());
        let router = Router::new(RouterConfig::default());
        router
            .set_delivery(crate::hub::make_delivery(Arc::clone(&sessions)))
            .await;

        let (results_tx, mut bridge_rx) = mpsc::channel::<FetchResult>(1_024);
        let (router_results_tx, router_results_rx) = mpsc::channel::<FetchResult>(1_024);
        tokio::spawn(async move {
            while let Some(result) = bridge_rx.recv().await {
                observe_result(&result);
                if router_results_tx.send(result).await.is_err() {
                    break;
                }
            }
        });

        let (status_tx, status_rx) = mpsc::channel(256);
        tokio::spawn(Arc::clone(&router).run(
            router_results_rx,
            status_rx,
            cancel.child_token(),
        ));

        let pusher = StatusPusher::new(
            Arc::clone(&tracker),
            config.status_config(),
            status_tx,
            cancel.child_token(),
        );
        tokio::spawn(pusher.run());

        AppState {
            config,
            router,
            tracker,
            sessions,
            cancel,
            results_tx,
        }
    }
}

fn observe_result(result: &FetchResult) {
    let tenant = metrics::tenant_label(&result.key.tenant);
    let site = metrics::site_label(&result.key.site);
    let metric = result.key.metric.as_str();
    metrics::REQUESTS_TOTAL
        .with_label_values(&[&tenant, &site, metric, result.status.as_label()])
        .inc();
    metrics::REQUEST_LATENCY
        .with_label_values(&[metric])
        .observe(result.latency.as_secs_f64());
    if let FetchStatus::Failed(kind) = result.status {
        metrics::REQUEST_ERRORS
            .with_label_values(&[metric, kind.as_label()])
            .inc();
    }
}
