//! Admin HTTP API — health checks, Prometheus metrics, JSON status.
//!
//! `/metrics` is mounted on the main listener as well. When `admin_port` is
//! configured, all three endpoints are also served on a separate listener:
//!   GET /health  — 200 OK, for load balancer health checks
//!   GET /metrics — Prometheus exposition format
//!   GET /status  — JSON snapshot of instruments and pool

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::MetricSnapshot;
use crate::pool::PoolStats;
use crate::state::AppState;

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the admin router on its own port until the listener fails.
pub async fn serve(state: AppState, host: String, port: u16) {
    let addr = format!("{host}:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(addr = %addr, "admin API");
            if let Err(e) = axum::serve(listener, router(state)).await {
                error!(error = %e, "admin server error");
            }
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind admin port");
        }
    }
}

// ─── GET /health ─────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    (StatusCode::OK, [(CONTENT_TYPE, "application/json")], r#"{"status":"ok"}"#)
}

// ─── GET /metrics ────────────────────────────────────────────────────────────

pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.registry.render(),
    )
        .into_response()
}

// ─── GET /status ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Status {
    uptime_secs: u64,
    delay_range_ms: [u64; 2],
    pool: PoolStats,
    metrics: Vec<MetricSnapshot>,
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    let delay = state.processor.delay();
    Json(Status {
        uptime_secs: state.started_at.elapsed().as_secs(),
        delay_range_ms: [delay.min.as_millis() as u64, delay.max.as_millis() as u64],
        pool: state.pool.stats(),
        metrics: state.registry.snapshot(),
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
