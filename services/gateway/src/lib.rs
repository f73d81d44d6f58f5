pub mod config;
pub mod hub;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod strategies;

pub use state::AppState;

use axum::{routing::get, Router};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(hub::ws_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
