//! REST API surface.
//!
//! Each area exposes a `create_*_router(state)`; this module assembles them
//! and applies the cross-cutting layers: request ids, audit + metrics
//! capture, rate limiting, CORS, and tracing.

pub mod admin_routes;
pub mod autocomplete_routes;
pub mod batch_routes;
pub mod fhir_routes;
pub mod health_routes;
pub mod mapping_routes;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::{derive_action, is_audited, AuditRecorder};
use crate::cache::CacheRegistry;
use crate::config::Config;
use crate::database::{AuditRepository, CodeRepository, MappingRepository};
use crate::embedding::Embedder;
use crate::error::REQUEST_ID;
use crate::jobs::JobQueue;
use crate::metrics::Metrics;
use crate::models::NewAuditRecord;
use crate::rate_limit::{self, caller_identity, RateLimitState, RateLimiter};
use crate::service::TranslationService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub codes: CodeRepository,
    pub mappings: MappingRepository,
    pub audit_repo: AuditRepository,
    pub service: Arc<TranslationService>,
    pub caches: Arc<CacheRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub jobs: Arc<JobQueue>,
    pub recorder: AuditRecorder,
    pub metrics: Arc<Metrics>,
    pub embedder: Arc<dyn Embedder>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

/// Scope a fresh request id around the handler and echo it as a header.
async fn with_request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let mut response = REQUEST_ID.scope(id, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Metrics for every request; an audit record for everything but probes,
/// captured after the response and enqueued off the response path.
async fn observe(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let actor = caller_identity(request.headers());
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let elapsed = started.elapsed();

    state
        .metrics
        .observe_request(&method, &route, status, elapsed.as_secs_f64());
    if status == 429 {
        state
            .metrics
            .rate_limited(rate_limit::classify(&method, &path).name);
    }

    if is_audited(&path) {
        let (action, resource_type) = derive_action(&method, &path);
        state.recorder.record(NewAuditRecord {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: None,
            actor: Some(actor.clone()),
            ip: Some(actor),
            user_agent,
            method: Some(method),
            path: Some(path),
            request_body: None,
            response_status: Some(status as i32),
            duration_ms: Some(elapsed.as_millis() as i64),
            metadata: None,
        });
    }
    response
}

/// Full application router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .merge(mapping_routes::create_mapping_router(state.clone()))
        .merge(batch_routes::create_batch_router(state.clone()))
        .merge(autocomplete_routes::create_autocomplete_router(state.clone()))
        .merge(fhir_routes::create_fhir_router(state.clone()))
        .merge(admin_routes::create_admin_router(state.clone()))
        .merge(health_routes::create_health_router(state.clone()))
        .layer(middleware::from_fn_with_state(
            RateLimitState {
                limiter: state.limiter.clone(),
            },
            rate_limit::enforce,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), observe))
        .layer(middleware::from_fn(with_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
