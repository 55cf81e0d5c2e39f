//! FHIR R4 terminology operations.
//!
//! Thin handlers over the store and the translation service; resource
//! shaping lives in [`crate::fhir`]. Errors on this surface render as
//! OperationOutcome resources.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::cache::response_key;
use crate::error::{AppError, AppResult};
use crate::fhir;
use crate::models::{MappingSource, SourceSystem};

pub fn create_fhir_router(state: AppState) -> Router {
    Router::new()
        .route("/fhir/metadata", get(metadata))
        .route("/fhir/CodeSystem", get(list_code_systems))
        .route("/fhir/CodeSystem/$lookup", get(lookup))
        .route("/fhir/CodeSystem/:id", get(read_code_system))
        .route("/fhir/ConceptMap/$translate", post(translate))
        .route("/fhir/ValueSet/$expand", get(expand))
        .with_state(state)
}

/// Render AppError as an OperationOutcome with the matching status.
fn outcome_response(error: AppError) -> Response {
    let status = error.status();
    let code = match status {
        StatusCode::NOT_FOUND => "not-found",
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::TOO_MANY_REQUESTS => "throttled",
        StatusCode::GATEWAY_TIMEOUT => "timeout",
        _ => "exception",
    };
    (status, Json(fhir::operation_outcome("error", code, &error.to_string()))).into_response()
}

type FhirResult = Result<Response, Response>;

fn ok(value: Value) -> Response {
    Json(value).into_response()
}

/// GET /fhir/metadata
async fn metadata(State(state): State<AppState>) -> Response {
    let key = response_key("/fhir/metadata", &[], None);
    if let Some(cached) = state.caches.fhir.get(&key) {
        return ok(cached);
    }
    let body = fhir::capability_statement();
    state.caches.fhir.set(key, body.clone());
    ok(body)
}

/// GET /fhir/CodeSystem — searchset of the hosted code systems.
async fn list_code_systems(State(state): State<AppState>) -> FhirResult {
    let key = response_key("/fhir/CodeSystem", &[], None);
    if let Some(cached) = state.caches.fhir.get(&key) {
        return Ok(ok(cached));
    }

    let mut entries = Vec::new();
    for system in SourceSystem::all() {
        let count = state
            .codes
            .count_source_codes(system)
            .await
            .map_err(outcome_response)?;
        entries.push(serde_json::json!({
            "resource": fhir::code_system_summary(system, count),
        }));
    }
    let target_count = state
        .codes
        .count_target_codes()
        .await
        .map_err(outcome_response)?;
    entries.push(serde_json::json!({
        "resource": {
            "resourceType": "CodeSystem",
            "id": "icd11-tm2",
            "url": fhir::TM2_SYSTEM_URI,
            "name": "ICD-11 Traditional Medicine Module 2",
            "status": "active",
            "content": "complete",
            "count": target_count,
        },
    }));

    let body = serde_json::json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": entries.len(),
        "entry": entries,
    });
    state.caches.fhir.set(key, body.clone());
    Ok(ok(body))
}

/// GET /fhir/CodeSystem/:id
async fn read_code_system(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> FhirResult {
    if id == "icd11-tm2" {
        let count = state
            .codes
            .count_target_codes()
            .await
            .map_err(outcome_response)?;
        return Ok(ok(serde_json::json!({
            "resourceType": "CodeSystem",
            "id": "icd11-tm2",
            "url": fhir::TM2_SYSTEM_URI,
            "name": "ICD-11 Traditional Medicine Module 2",
            "status": "active",
            "content": "complete",
            "count": count,
        })));
    }

    let system: SourceSystem = id.parse().map_err(|_| {
        outcome_response(AppError::NotFound(format!("CodeSystem {} not found", id)))
    })?;
    let count = state
        .codes
        .count_source_codes(system)
        .await
        .map_err(outcome_response)?;
    Ok(ok(fhir::code_system_summary(system, count)))
}

// ============================================================================
// $lookup
// ============================================================================

#[derive(Debug, Deserialize)]
struct LookupQuery {
    system: String,
    code: String,
}

/// GET /fhir/CodeSystem/$lookup?system=&code=
async fn lookup(State(state): State<AppState>, Query(query): Query<LookupQuery>) -> FhirResult {
    let key = response_key(
        "/fhir/CodeSystem/$lookup",
        &[
            ("system".to_string(), query.system.clone()),
            ("code".to_string(), query.code.clone()),
        ],
        None,
    );
    if let Some(cached) = state.caches.fhir.get(&key) {
        return Ok(ok(cached));
    }

    let body = if let Some(system) = parse_source_system(&query.system) {
        let code = state
            .codes
            .find_source(&query.code, system)
            .await
            .map_err(outcome_response)?
            .ok_or_else(|| {
                outcome_response(AppError::NotFound(format!(
                    "code {} not found in {}",
                    query.code, system
                )))
            })?;
        fhir::lookup_source(&code)
    } else if is_target_system(&query.system) {
        let code = state
            .codes
            .find_target(&query.code)
            .await
            .map_err(outcome_response)?
            .ok_or_else(|| {
                outcome_response(AppError::NotFound(format!(
                    "code {} not found in ICD-11 TM2",
                    query.code
                )))
            })?;
        fhir::lookup_target(&code)
    } else {
        return Err(outcome_response(AppError::Validation(format!(
            "unknown system '{}'",
            query.system
        ))));
    };

    state.caches.fhir.set(key, body.clone());
    Ok(ok(body))
}

/// Accept the short name or the canonical URI.
fn parse_source_system(raw: &str) -> Option<SourceSystem> {
    if let Ok(system) = raw.parse::<SourceSystem>() {
        return Some(system);
    }
    SourceSystem::all()
        .into_iter()
        .find(|system| system.code_system_uri() == raw)
}

fn is_target_system(raw: &str) -> bool {
    raw == fhir::TM2_SYSTEM_URI || raw.eq_ignore_ascii_case("icd11-tm2") || raw.eq_ignore_ascii_case("icd11")
}

// ============================================================================
// $translate
// ============================================================================

/// POST /fhir/ConceptMap/$translate
///
/// Accepts a Parameters resource or a bare `{code, system}` object. Runs the
/// same translate flow as POST /mapping, sharing its cache.
async fn translate(State(state): State<AppState>, Json(body): Json<Value>) -> FhirResult {
    let (code, system) = extract_translate_params(&body).map_err(outcome_response)?;

    let outcome = state
        .service
        .translate(&code, system)
        .await
        .map_err(outcome_response)?;

    let mapping = &outcome.mapping;
    let body = fhir::translate_result(
        mapping
            .target
            .as_ref()
            .map(|t| (t.code.as_str(), t.title.as_str())),
        mapping.equivalence,
        mapping.confidence,
        // Pipeline-produced mappings always carry this provenance.
        MappingSource::AiValidated,
    );
    Ok(ok(body))
}

fn extract_translate_params(body: &Value) -> AppResult<(String, SourceSystem)> {
    // Parameters resource shape.
    if let Some(parameters) = body.get("parameter").and_then(|p| p.as_array()) {
        let mut code = None;
        let mut system = None;
        for parameter in parameters {
            let name = parameter.get("name").and_then(|n| n.as_str());
            let value = parameter
                .get("valueCode")
                .or_else(|| parameter.get("valueString"))
                .or_else(|| parameter.get("valueUri"))
                .and_then(|v| v.as_str());
            match (name, value) {
                (Some("code"), Some(v)) => code = Some(v.to_string()),
                (Some("system"), Some(v)) => system = Some(v.to_string()),
                _ => {}
            }
        }
        let code = code.ok_or_else(|| {
            AppError::Validation("missing 'code' parameter".to_string())
        })?;
        let system_raw = system.ok_or_else(|| {
            AppError::Validation("missing 'system' parameter".to_string())
        })?;
        let system = parse_source_system(&system_raw).ok_or_else(|| {
            AppError::Validation(format!("unknown system '{}'", system_raw))
        })?;
        return Ok((code, system));
    }

    // Bare shape.
    let code = body
        .get("code")
        .and_then(|c| c.as_str())
        .ok_or_else(|| AppError::Validation("missing 'code'".to_string()))?;
    let system_raw = body
        .get("system")
        .and_then(|s| s.as_str())
        .ok_or_else(|| AppError::Validation("missing 'system'".to_string()))?;
    let system = parse_source_system(system_raw)
        .ok_or_else(|| AppError::Validation(format!("unknown system '{}'", system_raw)))?;
    Ok((code.to_string(), system))
}

// ============================================================================
// $expand
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExpandQuery {
    filter: Option<String>,
    system: Option<String>,
    count: Option<i64>,
    offset: Option<i64>,
}

/// GET /fhir/ValueSet/$expand?filter=&count=&offset=
async fn expand(State(state): State<AppState>, Query(query): Query<ExpandQuery>) -> FhirResult {
    let count = query.count.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let system = match query.system.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_source_system(raw).ok_or_else(|| {
            outcome_response(AppError::Validation(format!("unknown system '{}'", raw)))
        })?),
        None => None,
    };

    let key = response_key(
        "/fhir/ValueSet/$expand",
        &[
            ("filter".to_string(), query.filter.clone().unwrap_or_default()),
            ("system".to_string(), query.system.clone().unwrap_or_default()),
            ("count".to_string(), count.to_string()),
            ("offset".to_string(), offset.to_string()),
        ],
        None,
    );
    if let Some(cached) = state.caches.fhir.get(&key) {
        return Ok(ok(cached));
    }

    let (total, codes) = state
        .codes
        .expand_source_codes(query.filter.as_deref().filter(|f| !f.is_empty()), system, offset, count)
        .await
        .map_err(outcome_response)?;

    let body = fhir::valueset_expansion(total, offset, &codes);
    state.caches.fhir.set(key, body.clone());
    Ok(ok(body))
}
