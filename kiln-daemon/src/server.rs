//! WebSocket server: accepts connections and starts their pumps.

use crate::conn;
use crate::handler::BuildHandler;
use crate::hub::Hub;
use crate::registry::JobRegistry;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use kiln_core::{BuildService, Config};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    registry: Arc<JobRegistry>,
    max_message_bytes: usize,
    send_queue_size: usize,
}

/// Run the daemon until the shutdown token fires.
pub async fn serve(
    config: Config,
    service: Arc<BuildService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    serve_on(listener, config, service, shutdown).await
}

/// Run the daemon on an already-bound listener (tests bind port 0).
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    config: Config,
    service: Arc<BuildService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let registry = Arc::new(JobRegistry::new());
    let handler = Arc::new(BuildHandler::new(service, registry.clone()));
    let hub = Arc::new(Hub::new(handler));

    let state = AppState {
        hub,
        registry: registry.clone(),
        max_message_bytes: config.max_message_bytes,
        send_queue_size: config.send_queue_size,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    info!(addr = %listener.local_addr()?, "Listening for build clients");

    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
        .await?;

    // Stop whatever is still running before the process exits.
    registry.cancel_all();
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes).on_upgrade(move |socket| {
        conn::run_connection(socket, state.hub, state.max_message_bytes, state.send_queue_size)
    })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    format!("ok\nactive_jobs: {}\n", state.registry.job_count())
}
