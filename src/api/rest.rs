// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Operational surface:
//   GET  /health                         auth/account status, uptime, queue
//   GET  /metrics                        cache hit rates, queue stats, PnL
//   POST /webhook                        signal ingress (JSON payload)
//   GET  /api/strategies/:name/verify    {will_trade, reasons, next_execution}
//   POST /api/strategies/:name/start
//   POST /api/strategies/:name/stop
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::signals::{RawSignal, SignalOutcome};

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook))
        .route("/api/strategies/:name/verify", get(strategy_verify))
        .route("/api/strategies/:name/start", post(strategy_start))
        .route("/api/strategies/:name/stop", post(strategy_stop))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics())
}

/// Signal ingress. Accepted and policy-ignored payloads answer 200; payloads
/// the normalizer refuses answer 422 with the reason.
async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RawSignal>,
) -> impl IntoResponse {
    let outcome = state.intake.handle(payload).await;
    state.increment_version();

    let status = match &outcome {
        SignalOutcome::Accepted { .. } | SignalOutcome::Ignored { .. } => StatusCode::OK,
        SignalOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(outcome))
}

async fn strategy_verify(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&name) {
        Some(strategy) => {
            let report = strategy.verify(Utc::now());
            (StatusCode::OK, Json(json!(report)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown strategy '{name}'") })),
        ),
    }
}

async fn strategy_start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    set_strategy_enabled(&state, &name, true)
}

async fn strategy_stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    set_strategy_enabled(&state, &name, false)
}

fn set_strategy_enabled(
    state: &Arc<AppState>,
    name: &str,
    enabled: bool,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.registry.get(name) {
        Some(strategy) => {
            strategy.set_enabled(enabled);
            state.increment_version();
            info!(strategy = name, enabled, "strategy toggled via API");
            (
                StatusCode::OK,
                Json(json!({ "strategy": name, "enabled": enabled })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown strategy '{name}'") })),
        ),
    }
}
