//! Liveness, readiness, and metrics exposition.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};

use super::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// GET /health — process liveness only.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/ready — database connectivity gates readiness; the upstream
/// WHO probe and model credentials are reported but not gating.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();
    let icd_api_reachable = probe_icd_api(&state).await;
    let model_credentials = state.config.gemini_api_key.is_some();

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if database_ok { "ready" } else { "unavailable" },
            "checks": {
                "database": database_ok,
                "icd_api": icd_api_reachable,
                "model_credentials": model_credentials,
            },
        })),
    )
}

/// Connectivity probe against the upstream WHO ICD API. Reachability only;
/// authentication belongs to the catalog loader, not this service.
async fn probe_icd_api(state: &AppState) -> bool {
    state
        .http
        .get(&state.config.who_icd_base_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .is_ok()
}

/// GET /metrics — Prometheus text exposition.
async fn metrics(State(state): State<AppState>) -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
