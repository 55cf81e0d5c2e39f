//! Interactive translation, mapping listing, stats, and human review.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::cache::mapping_key;
use crate::error::{AppError, AppResult};
use crate::models::{Equivalence, MappingDetail, SourceSystem, ValidationStatus};
use crate::service::{MappingPayload, TranslateRequest};

const MAX_PAGE_SIZE: i64 = 100;
const MAX_SYNC_BATCH: usize = 100;

// ============================================================================
// Router
// ============================================================================

pub fn create_mapping_router(state: AppState) -> Router {
    Router::new()
        .route("/mapping", post(translate).get(list_mappings))
        .route("/mapping/stats", get(mapping_stats))
        .route("/mapping/:id/validate", patch(validate_mapping))
        .with_state(state)
}

// ============================================================================
// Interactive translate
// ============================================================================

#[derive(Debug, Serialize)]
struct TranslateResponse {
    success: bool,
    source: &'static str,
    mapping: MappingPayload,
    processing_time_ms: u64,
}

/// POST /mapping
///
/// Translate one source code. Cached mappings short-circuit the pipeline;
/// UNMATCHED is a normal 200 with a null target.
async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> AppResult<Json<TranslateResponse>> {
    request.validate()?;
    let system = request.parsed_system()?;

    let outcome = state.service.translate(request.code.trim(), system).await?;
    Ok(Json(TranslateResponse {
        success: outcome.mapping.matched(),
        source: outcome.source_label,
        mapping: outcome.mapping,
        processing_time_ms: outcome.processing_time_ms,
    }))
}

// ============================================================================
// Listing and stats
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListQuery {
    system: Option<String>,
    equivalence: Option<String>,
    status: Option<String>,
    min_confidence: Option<f32>,
    max_confidence: Option<f32>,
    q: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    total: i64,
    page: i64,
    limit: i64,
    mappings: Vec<MappingDetail>,
}

/// GET /mapping
async fn list_mappings(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ListResponse>> {
    let limit = query.limit.unwrap_or(20);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let page = query.page.unwrap_or(1).max(1);

    let filters = crate::database::MappingFilters {
        system: parse_opt::<SourceSystem>(query.system.as_deref())?,
        equivalence: parse_opt::<Equivalence>(query.equivalence.as_deref())?,
        status: parse_opt::<ValidationStatus>(query.status.as_deref())?,
        min_confidence: query.min_confidence,
        max_confidence: query.max_confidence,
        query: query.q.clone().filter(|q| !q.is_empty()),
        sort: parse_opt(query.sort.as_deref())?.unwrap_or_default(),
        descending: match query.order.as_deref() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "unknown order '{}' (expected asc|desc)",
                    other
                )))
            }
        },
        page,
        limit,
    };

    let (total, mappings) = state.mappings.list(&filters).await?;
    Ok(Json(ListResponse {
        total,
        page,
        limit,
        mappings,
    }))
}

/// GET /mapping/stats
async fn mapping_stats(
    State(state): State<AppState>,
) -> AppResult<Json<crate::database::MappingStats>> {
    Ok(Json(state.mappings.stats().await?))
}

// ============================================================================
// Human validation
// ============================================================================

#[derive(Debug, Deserialize)]
struct ValidateBody {
    status: String,
    validator: String,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    success: bool,
    mapping: MappingDetail,
}

/// PATCH /mapping/:id/validate
///
/// Review action: sets the validation status, validator, and timestamp, and
/// shields the row from future pipeline overwrites.
async fn validate_mapping(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ValidateBody>,
) -> AppResult<Json<ValidateResponse>> {
    if body.validator.trim().is_empty() {
        return Err(AppError::Validation("validator must not be empty".to_string()));
    }
    let status: ValidationStatus = body
        .status
        .parse()
        .map_err(|e: String| AppError::Validation(e))?;

    state.mappings.validate(id, status, body.validator.trim()).await?;
    let detail = state
        .mappings
        .find_detail_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("mapping {} not found", id)))?;

    // The cached entry no longer reflects the row.
    state
        .caches
        .mappings
        .invalidate(&mapping_key(detail.source_system, &detail.source_code));

    Ok(Json(ValidateResponse {
        success: true,
        mapping: detail,
    }))
}

// ============================================================================
// Synchronous batch lookup
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BatchCodeRef {
    pub code: String,
    pub system: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncBatchBody {
    codes: Vec<BatchCodeRef>,
}

#[derive(Debug, Serialize)]
struct SyncBatchItem {
    code: String,
    system: SourceSystem,
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mapping: Option<MappingPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncBatchResponse {
    success: bool,
    summary: SyncBatchSummary,
    results: Vec<SyncBatchItem>,
}

#[derive(Debug, Serialize)]
struct SyncBatchSummary {
    total: usize,
    found: usize,
    missing: usize,
}

/// POST /mapping/batch
///
/// Lookup-only: reports existing mappings without running the pipeline.
pub async fn sync_batch(
    State(state): State<AppState>,
    Json(body): Json<SyncBatchBody>,
) -> AppResult<(StatusCode, Json<SyncBatchResponse>)> {
    if body.codes.is_empty() {
        return Err(AppError::Validation("codes must not be empty".to_string()));
    }
    if body.codes.len() > MAX_SYNC_BATCH {
        return Err(AppError::Validation(format!(
            "at most {} codes per batch",
            MAX_SYNC_BATCH
        )));
    }

    let mut results = Vec::with_capacity(body.codes.len());
    let mut found = 0usize;
    for entry in &body.codes {
        let system: SourceSystem = entry
            .system
            .parse()
            .map_err(|e: String| AppError::Validation(e))?;
        match state.service.lookup_existing(&entry.code, system).await {
            Ok(Some(mapping)) => {
                found += 1;
                results.push(SyncBatchItem {
                    code: entry.code.clone(),
                    system,
                    found: true,
                    mapping: Some(mapping),
                    error: None,
                });
            }
            Ok(None) => results.push(SyncBatchItem {
                code: entry.code.clone(),
                system,
                found: false,
                mapping: None,
                error: None,
            }),
            Err(AppError::NotFound(message)) => results.push(SyncBatchItem {
                code: entry.code.clone(),
                system,
                found: false,
                mapping: None,
                error: Some(message),
            }),
            Err(other) => return Err(other),
        }
    }

    let total = results.len();
    Ok((
        StatusCode::OK,
        Json(SyncBatchResponse {
            success: true,
            summary: SyncBatchSummary {
                total,
                found,
                missing: total - found,
            },
            results,
        }),
    ))
}

fn parse_opt<T: std::str::FromStr<Err = String>>(value: Option<&str>) -> AppResult<Option<T>> {
    match value.filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: String| AppError::Validation(e)),
        None => Ok(None),
    }
}
