// gateway: polls vendor telemetry per configured connection and fans the
// normalized stream out to dashboard WebSocket sessions.

use clap::Parser;
use gateway::{build_router, config, AppState};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "OmniAPI streaming gateway")]
struct Args {
    /// Path to the gateway TOML config.
    #[arg(long, default_value = "/etc/omniapi/gateway.toml")]
    config: PathBuf,
    /// Listen address for the HTTP/WebSocket server.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                path = %args.config.display(),
                connections = cfg.connections.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let state = AppState::new(cfg, cancel.clone()).await;
    let requesters = gateway::scheduler::spawn_connections(&state).await;

    let listener = match tokio::net::TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", args.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %args.bind, "gateway listening");

    let shutdown_cancel = cancel.clone();
    let serve = axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
        });
    if let Err(e) = serve.await {
        eprintln!("server error: {e}");
    }

    // Requesters finish their in-flight call (bounded by the request
    // timeout) before the process exits.
    for requester in &requesters {
        requester.stop().await;
    }
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
