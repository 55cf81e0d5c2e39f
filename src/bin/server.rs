//! Terminology bridge REST API server.
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/tm2_bridge \
//! GEMINI_API_KEY=... \
//! cargo run --bin tm2_server
//!
//! curl -X POST http://localhost:3000/mapping \
//!   -H "Content-Type: application/json" \
//!   -d '{"code": "AAA-1", "system": "ayurveda"}'
//!
//! curl http://localhost:3000/health
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tm2_bridge::api::AppState;
use tm2_bridge::audit::AuditRecorder;
use tm2_bridge::cache::CacheRegistry;
use tm2_bridge::config::Config;
use tm2_bridge::database::{
    self, AuditRepository, CodeRepository, MappingRepository, PgTargetSearcher,
};
use tm2_bridge::embedding::GeminiEmbedder;
use tm2_bridge::jobs::{JobQueue, JobQueueConfig, PipelineItemRunner};
use tm2_bridge::llm::GeminiAdjudicator;
use tm2_bridge::metrics::Metrics;
use tm2_bridge::pipeline::MappingPipeline;
use tm2_bridge::rate_limit::RateLimiter;
use tm2_bridge::retrieval::CandidateRetriever;
use tm2_bridge::service::TranslationService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(Config::from_env());
    info!(host = %config.host, port = config.port, "starting terminology bridge");

    let pool = database::connect(&config).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database ready");

    // External model adapters; a missing key degrades the pipeline to its
    // lexical retrieval paths instead of failing startup.
    let embedder = Arc::new(GeminiEmbedder::new(
        config.gemini_api_key.clone(),
        &config.embedding_model,
        config.model_timeout(),
    ));
    let adjudicator = Arc::new(GeminiAdjudicator::new(
        config.gemini_api_key.clone(),
        &config.adjudicator_model,
        config.model_timeout(),
    ));
    if config.gemini_api_key.is_none() {
        info!("GEMINI_API_KEY not set; vector retrieval and adjudication disabled");
    }

    let codes = CodeRepository::new(pool.clone());
    let mappings = MappingRepository::new(pool.clone());
    let audit_repo = AuditRepository::new(pool.clone());
    let caches = Arc::new(CacheRegistry::new(&config.cache));
    let metrics = Arc::new(Metrics::new());

    let retriever = CandidateRetriever::new(Arc::new(PgTargetSearcher::new(pool.clone())));
    let pipeline = MappingPipeline::new(
        embedder.clone(),
        adjudicator,
        retriever,
        caches.clone(),
    );
    let service = Arc::new(TranslationService::new(
        codes.clone(),
        mappings.clone(),
        pipeline,
        caches.clone(),
        metrics.clone(),
        config.request_deadline(),
    ));

    let jobs = JobQueue::new(
        JobQueueConfig {
            max_concurrent: config.job_max_concurrent,
            item_delay: std::time::Duration::from_millis(config.job_item_delay_ms),
            retention: std::time::Duration::from_millis(config.job_retention_ms),
        },
        Arc::new(PipelineItemRunner::new(service.clone())),
    );
    JobQueue::start_retention_sweeper(jobs.clone());

    let limiter = Arc::new(RateLimiter::new());
    RateLimiter::start_sweeper(limiter.clone());

    let recorder = AuditRecorder::start(audit_repo.clone());

    let state = AppState {
        config: config.clone(),
        pool,
        codes,
        mappings,
        audit_repo,
        service,
        caches,
        limiter,
        jobs,
        recorder,
        metrics,
        embedder,
        http: reqwest::Client::new(),
        started_at: Instant::now(),
    };

    let app = tm2_bridge::create_app_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
