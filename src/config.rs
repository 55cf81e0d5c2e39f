//! Environment-driven configuration.
//!
//! Every knob has a default so the server starts with nothing but
//! DATABASE_URL and (for live model calls) GEMINI_API_KEY set.

use std::time::Duration;

/// Embedding dimension used across the store, the embedder, and the vector
/// index. Matches the `vector(768)` columns in the schema.
pub const EMBEDDING_DIM: usize = 768;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub database_url: String,
    pub database_max_connections: u32,

    /// Hard deadline for one interactive translate.
    pub request_deadline_ms: u64,

    pub job_max_concurrent: usize,
    pub job_item_delay_ms: u64,
    pub job_retention_ms: u64,

    pub embedding_dim: usize,

    /// Gemini credentials/models; absent key degrades the pipeline to the
    /// lexical retrieval paths.
    pub gemini_api_key: Option<String>,
    pub embedding_model: String,
    pub adjudicator_model: String,
    /// Inner timeout for a single model call; kept well under the request
    /// deadline so the outer 504 path is almost never hit.
    pub model_timeout_ms: u64,

    /// Upstream WHO ICD API base, used only by the readiness probe.
    pub who_icd_base_url: String,

    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub mappings_capacity: usize,
    pub mappings_ttl: Duration,
    pub embeddings_capacity: usize,
    pub embeddings_ttl: Duration,
    pub search_capacity: usize,
    pub search_ttl: Duration,
    pub fhir_capacity: usize,
    pub fhir_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mappings_capacity: 1000,
            mappings_ttl: Duration::from_secs(3600),
            embeddings_capacity: 500,
            embeddings_ttl: Duration::from_secs(86_400),
            search_capacity: 500,
            search_ttl: Duration::from_secs(300),
            fhir_capacity: 500,
            fhir_ttl: Duration::from_secs(600),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let cache = CacheConfig {
            mappings_capacity: env_parse("CACHE_MAPPINGS_CAPACITY", 1000),
            mappings_ttl: Duration::from_secs(env_parse("CACHE_MAPPINGS_TTL_SECS", 3600)),
            embeddings_capacity: env_parse("CACHE_EMBEDDINGS_CAPACITY", 500),
            embeddings_ttl: Duration::from_secs(env_parse("CACHE_EMBEDDINGS_TTL_SECS", 86_400)),
            search_capacity: env_parse("CACHE_SEARCH_CAPACITY", 500),
            search_ttl: Duration::from_secs(env_parse("CACHE_SEARCH_TTL_SECS", 300)),
            fhir_capacity: env_parse("CACHE_FHIR_CAPACITY", 500),
            fhir_ttl: Duration::from_secs(env_parse("CACHE_FHIR_TTL_SECS", 600)),
        };

        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 3000),
            database_url: env_or(
                "DATABASE_URL",
                "postgresql://localhost:5432/tm2_bridge",
            ),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            request_deadline_ms: env_parse("D_REQUEST_DEADLINE_MS", 25_000),
            job_max_concurrent: env_parse("JOB_MAX_CONCURRENT", 3),
            job_item_delay_ms: env_parse("JOB_ITEM_DELAY_MS", 500),
            job_retention_ms: env_parse("JOB_RETENTION_MS", 86_400_000),
            embedding_dim: env_parse("EMBEDDING_DIM", EMBEDDING_DIM),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-004"),
            adjudicator_model: env_or("ADJUDICATOR_MODEL", "gemini-2.0-flash"),
            model_timeout_ms: env_parse("MODEL_TIMEOUT_MS", 15_000),
            who_icd_base_url: env_or("WHO_ICD_BASE_URL", "https://id.who.int/icd"),
            cache,
        }
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cache = CacheConfig::default();
        assert_eq!(cache.mappings_ttl, Duration::from_secs(3600));
        assert_eq!(cache.embeddings_ttl, Duration::from_secs(86_400));
        assert_eq!(cache.search_ttl, Duration::from_secs(300));
        assert_eq!(cache.fhir_ttl, Duration::from_secs(600));
    }
}
