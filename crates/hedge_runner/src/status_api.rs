use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use serde::Serialize;

use crate::state::EngineStatus;

/// Read-only status surface: health, prometheus metrics and the latest
/// engine snapshot. There is deliberately no control plane.
#[derive(Clone)]
pub struct StatusState {
    pub status: Arc<RwLock<EngineStatus>>,
    pub prometheus: PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
}

pub fn spawn_status_server(port: u16, state: StatusState) {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .route("/state", get(engine_state))
            .with_state(state);
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, %err, "status server failed to bind");
                return;
            }
        };
        tracing::info!(%addr, "status server started");
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "status server terminated");
        }
    });
}

async fn health() -> impl IntoResponse {
    Json(HealthResp { status: "ok" })
}

async fn metrics(State(state): State<StatusState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn engine_state(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.status.read().clone();
    Json(snapshot)
}
