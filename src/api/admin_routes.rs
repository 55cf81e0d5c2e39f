//! Operational endpoints: cache stats, audit query, embedding maintenance,
//! limiter stats.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::error::{AppError, AppResult};

/// Batch size for one embedding API call during generation.
const EMBED_CHUNK: usize = 32;

pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/clear", post(cache_clear))
        .route("/admin/rate-limit/stats", get(rate_limit_stats))
        .route("/admin/audit", get(audit_query))
        .route("/admin/embeddings/stats", get(embedding_stats))
        .route("/admin/embeddings/init", post(embeddings_init))
        .route("/admin/embeddings/generate", post(embeddings_generate))
        .with_state(state)
}

/// GET /admin/cache/stats
async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "mappings": state.caches.mappings.stats(),
        "embeddings": state.caches.embeddings.stats(),
        "search": state.caches.search.stats(),
        "fhir": state.caches.fhir.stats(),
    }))
}

/// POST /admin/cache/clear
async fn cache_clear(State(state): State<AppState>) -> Json<Value> {
    state.caches.clear_all();
    info!("all caches cleared");
    Json(json!({"success": true}))
}

/// GET /admin/rate-limit/stats
async fn rate_limit_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.limiter.stats()))
}

#[derive(Debug, Deserialize)]
struct AuditQueryParams {
    action: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /admin/audit?action=&limit=&offset=
async fn audit_query(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> AppResult<Json<Value>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);
    let records = state
        .audit_repo
        .query(params.action.as_deref().filter(|a| !a.is_empty()), limit, offset)
        .await?;
    Ok(Json(json!({"records": records, "limit": limit, "offset": offset})))
}

/// GET /admin/embeddings/stats
async fn embedding_stats(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let coverage = state.codes.embedding_coverage().await?;
    Ok(Json(json!(coverage)))
}

/// POST /admin/embeddings/init
///
/// Ensure the vector extension exists and report current coverage.
async fn embeddings_init(State(state): State<AppState>) -> AppResult<Json<Value>> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(&state.pool)
        .await?;
    let coverage = state.codes.embedding_coverage().await?;
    Ok(Json(json!({"success": true, "coverage": coverage})))
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    /// "source" or "target".
    table: String,
    #[serde(default = "default_generate_limit")]
    limit: i64,
}

fn default_generate_limit() -> i64 {
    100
}

/// POST /admin/embeddings/generate
///
/// Embed rows that lack a vector, in document mode, batched.
async fn embeddings_generate(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> AppResult<Json<Value>> {
    let limit = params.limit.clamp(1, 1000);
    let rows = match params.table.as_str() {
        "source" => state.codes.source_rows_missing_embedding(limit).await?,
        "target" => state.codes.target_rows_missing_embedding(limit).await?,
        other => {
            return Err(AppError::Validation(format!(
                "unknown table '{}' (expected source|target)",
                other
            )))
        }
    };

    let mut processed = 0usize;
    for chunk in rows.chunks(EMBED_CHUNK) {
        let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
        let vectors = state.embedder.embed_documents(&texts).await?;
        for ((id, _), vector) in chunk.iter().zip(vectors) {
            match params.table.as_str() {
                "source" => state.codes.set_source_embedding(*id, vector).await?,
                _ => state.codes.set_target_embedding(*id, vector).await?,
            }
            processed += 1;
        }
    }

    info!(table = %params.table, processed, "embedding generation pass finished");
    Ok(Json(json!({
        "success": true,
        "table": params.table,
        "processed": processed,
    })))
}
