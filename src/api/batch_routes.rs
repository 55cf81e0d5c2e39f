//! Batch mapping endpoints: the synchronous lookup and the async job queue.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::mapping_routes::{sync_batch, BatchCodeRef};
use super::AppState;
use crate::error::{AppError, AppResult};
use crate::jobs::{estimate_duration_secs, BatchJob, JobQueue};
use crate::models::SourceSystem;
use crate::rate_limit::caller_identity;

const MAX_ASYNC_BATCH: usize = 100;

pub fn create_batch_router(state: AppState) -> Router {
    Router::new()
        .route("/mapping/batch", post(sync_batch))
        .route("/mapping/batch/async", post(submit_async_batch))
        .route(
            "/mapping/batch/:id",
            get(batch_status).delete(cancel_batch),
        )
        .route("/mapping/batch/:id/results", get(batch_results))
        .with_state(state)
}

// ============================================================================
// Async submission
// ============================================================================

#[derive(Debug, Deserialize)]
struct AsyncBatchBody {
    codes: Vec<BatchCodeRef>,
    #[serde(default)]
    callback_url: Option<String>,
    #[serde(default = "default_save_results")]
    save_results: bool,
}

fn default_save_results() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct AsyncBatchResponse {
    job_id: Uuid,
    status: crate::jobs::JobStatus,
    progress: crate::jobs::JobProgress,
    estimated_time: String,
}

/// POST /mapping/batch/async — 202 with a job handle.
async fn submit_async_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AsyncBatchBody>,
) -> AppResult<(StatusCode, Json<AsyncBatchResponse>)> {
    if body.codes.is_empty() {
        return Err(AppError::Validation("codes must not be empty".to_string()));
    }
    if body.codes.len() > MAX_ASYNC_BATCH {
        return Err(AppError::Validation(format!(
            "at most {} codes per batch",
            MAX_ASYNC_BATCH
        )));
    }
    if let Some(url) = body.callback_url.as_deref() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Validation(
                "callback_url must be an http(s) URL".to_string(),
            ));
        }
    }

    let mut codes: Vec<(String, SourceSystem)> = Vec::with_capacity(body.codes.len());
    for entry in &body.codes {
        let system: SourceSystem = entry
            .system
            .parse()
            .map_err(|e: String| AppError::Validation(e))?;
        codes.push((entry.code.clone(), system));
    }

    let item_count = codes.len();
    let job = JobQueue::submit(
        &state.jobs,
        codes,
        Some(caller_identity(&headers)),
        body.callback_url.clone(),
        body.save_results,
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(AsyncBatchResponse {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            estimated_time: format!(
                "{}s",
                estimate_duration_secs(item_count, state.config.job_item_delay_ms)
            ),
        }),
    ))
}

// ============================================================================
// Job inspection and cancellation
// ============================================================================

fn job_snapshot(state: &AppState, id: Uuid) -> AppResult<BatchJob> {
    state
        .jobs
        .snapshot(id)
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))
}

fn status_body(job: &BatchJob) -> Value {
    json!({
        "job_id": job.id,
        "status": job.status,
        "progress": job.progress,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
    })
}

/// GET /mapping/batch/:id
async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let job = job_snapshot(&state, id)?;
    Ok(Json(status_body(&job)))
}

/// GET /mapping/batch/:id/results — per-item results, pending items visible.
async fn batch_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let job = job_snapshot(&state, id)?;
    Ok(Json(json!({
        "job_id": job.id,
        "status": job.status,
        "progress": job.progress,
        "results": job.items,
    })))
}

/// DELETE /mapping/batch/:id — cancel; the worker stops at the next item
/// boundary.
async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let job = state.jobs.cancel(id)?;
    Ok(Json(json!({
        "job_id": job.id,
        "status": job.status,
        "progress": job.progress,
        "message": "cancellation requested",
    })))
}
