//! Liveness and status listener.

use std::future::Future;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use jobd_sync::Orchestrator;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobd-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health listener started");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "JobDaemon is running"
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}
