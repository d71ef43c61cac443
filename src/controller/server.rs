//! # HTTP Server
//!
//! Metrics and probe endpoints for the controller.
//!
//! - `/metrics` - Prometheus text format
//! - `/healthz` - Liveness, 200 while the process serves HTTP
//! - `/readyz` - 200 once the initial BindingConfig list has succeeded, 503
//!   before that and again as soon as shutdown begins
//!
//! The port comes from `METRICS_PORT` (default 5000).

use crate::observability::metrics::REGISTRY;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Lifecycle flags behind the probes
#[derive(Debug, Default)]
pub struct ServerState {
    listening: AtomicBool,
    synced: AtomicBool,
    shutting_down: AtomicBool,
}

/// Body of `/readyz`
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub listening: bool,
    pub synced: bool,
    pub shutting_down: bool,
}

impl ServerState {
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// The controller has listed BindingConfigs at least once
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Relaxed);
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn readiness(&self) -> Readiness {
        let listening = self.is_listening();
        let synced = self.synced.load(Ordering::Relaxed);
        let shutting_down = self.is_shutting_down();
        Readiness {
            ready: listening && synced && !shutting_down,
            listening,
            synced,
            shutting_down,
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = router(Arc::clone(&state));

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    state.listening.store(true, Ordering::Relaxed);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let readiness = state.readiness();
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn readyz(state: &Arc<ServerState>) -> StatusCode {
        readyz_handler(State(Arc::clone(state))).await.into_response().status()
    }

    #[tokio::test]
    async fn test_ready_only_between_sync_and_shutdown() {
        let state = Arc::new(ServerState::default());
        assert_eq!(readyz(&state).await, StatusCode::SERVICE_UNAVAILABLE);

        state.listening.store(true, Ordering::Relaxed);
        assert_eq!(readyz(&state).await, StatusCode::SERVICE_UNAVAILABLE);

        state.mark_synced();
        assert_eq!(readyz(&state).await, StatusCode::OK);

        state.begin_shutdown();
        assert_eq!(readyz(&state).await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            state.readiness(),
            Readiness {
                ready: false,
                listening: true,
                synced: true,
                shutting_down: true,
            }
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
