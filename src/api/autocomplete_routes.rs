//! Autocomplete over the source and target catalogs.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::cache::response_key;
use crate::error::{AppError, AppResult};
use crate::models::SourceSystem;

const MAX_LIMIT: i64 = 50;
const MIN_QUERY_LEN: usize = 2;

pub fn create_autocomplete_router(state: AppState) -> Router {
    Router::new()
        .route("/autocomplete/source", get(autocomplete_source))
        .route("/autocomplete/target", get(autocomplete_target))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AutocompleteQuery {
    q: String,
    system: Option<String>,
    limit: Option<i64>,
}

fn check_params(q: &str, limit: i64) -> AppResult<()> {
    if q.trim().chars().count() < MIN_QUERY_LEN {
        return Err(AppError::Validation(format!(
            "q must be at least {} characters",
            MIN_QUERY_LEN
        )));
    }
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    Ok(())
}

/// GET /autocomplete/source?q=&system=&limit=
async fn autocomplete_source(
    State(state): State<AppState>,
    Query(query): Query<AutocompleteQuery>,
) -> AppResult<Json<Value>> {
    let limit = query.limit.unwrap_or(10);
    check_params(&query.q, limit)?;
    let system: Option<SourceSystem> = match query.system.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse().map_err(|e: String| AppError::Validation(e))?),
        None => None,
    };

    let key = response_key(
        "/autocomplete/source",
        &[
            ("q".to_string(), query.q.trim().to_lowercase()),
            (
                "system".to_string(),
                system.map(|s| s.as_str().to_string()).unwrap_or_default(),
            ),
            ("limit".to_string(), limit.to_string()),
        ],
        None,
    );
    if let Some(cached) = state.caches.search.get(&key) {
        return Ok(Json(cached));
    }

    let codes = state
        .codes
        .autocomplete_source(query.q.trim(), system, limit)
        .await?;
    let body = json!({
        "results": codes.iter().map(|code| json!({
            "code": code.code,
            "system": code.system,
            "term": code.term,
            "english_name": code.english_name,
        })).collect::<Vec<_>>(),
    });
    state.caches.search.set(key, body.clone());
    Ok(Json(body))
}

/// GET /autocomplete/target?q=&limit=
async fn autocomplete_target(
    State(state): State<AppState>,
    Query(query): Query<AutocompleteQuery>,
) -> AppResult<Json<Value>> {
    let limit = query.limit.unwrap_or(10);
    check_params(&query.q, limit)?;

    let key = response_key(
        "/autocomplete/target",
        &[
            ("q".to_string(), query.q.trim().to_lowercase()),
            ("limit".to_string(), limit.to_string()),
        ],
        None,
    );
    if let Some(cached) = state.caches.search.get(&key) {
        return Ok(Json(cached));
    }

    let codes = state.codes.autocomplete_target(query.q.trim(), limit).await?;
    let body = json!({
        "results": codes.iter().map(|code| json!({
            "code": code.code,
            "title": code.title,
            "category": code.category,
        })).collect::<Vec<_>>(),
    });
    state.caches.search.set(key, body.clone());
    Ok(Json(body))
}
