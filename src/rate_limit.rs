//! Fixed-window rate limiting.
//!
//! Buckets are keyed by `(route class, caller)` where the caller identity is
//! the first entry of the forwarded-for header, else "anonymous". Counters
//! reset when the window elapses; a background sweep discards idle buckets.
//! Single-process and best-effort only.

use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::AppError;

/// Idle time after which a bucket is discarded by the sweep.
const BUCKET_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RouteClass {
    pub name: &'static str,
    pub window: Duration,
    pub max_requests: u32,
    pub message: &'static str,
}

pub const STANDARD: RouteClass = RouteClass {
    name: "standard",
    window: Duration::from_secs(60),
    max_requests: 100,
    message: "Too many requests, please try again later",
};

pub const MAPPING: RouteClass = RouteClass {
    name: "mapping",
    window: Duration::from_secs(60),
    max_requests: 20,
    message: "Translation rate limit exceeded, please slow down",
};

pub const BATCH: RouteClass = RouteClass {
    name: "batch",
    window: Duration::from_secs(60),
    max_requests: 5,
    message: "Batch rate limit exceeded, please wait before submitting more jobs",
};

pub const SEARCH: RouteClass = RouteClass {
    name: "search",
    window: Duration::from_secs(60),
    max_requests: 200,
    message: "Search rate limit exceeded, please slow down",
};

pub const HEALTH: RouteClass = RouteClass {
    name: "health",
    window: Duration::from_secs(60),
    max_requests: 1000,
    message: "Too many requests",
};

struct Bucket {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

/// Outcome of one admission check, carrying everything the response headers
/// need.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub buckets: usize,
    pub by_class: Vec<ClassBuckets>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassBuckets {
    pub class: String,
    pub buckets: usize,
}

pub struct RateLimiter {
    buckets: DashMap<(String, &'static str), Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Read-or-init the caller's bucket, reset it if the window elapsed,
    /// increment, and decide.
    pub fn check(&self, class: &RouteClass, caller: &str) -> Decision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry((caller.to_string(), class.name))
            .or_insert_with(|| Bucket {
                window_start: now,
                count: 0,
                last_seen: now,
            });

        if now.duration_since(bucket.window_start) > class.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count += 1;
        bucket.last_seen = now;

        let reset_secs = class
            .window
            .saturating_sub(now.duration_since(bucket.window_start))
            .as_secs();
        Decision {
            allowed: bucket.count <= class.max_requests,
            limit: class.max_requests,
            remaining: class.max_requests.saturating_sub(bucket.count),
            reset_secs,
        }
    }

    /// Drop buckets untouched for longer than the idle window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_seen) <= BUCKET_IDLE);
    }

    pub fn stats(&self) -> LimiterStats {
        let mut by_class: std::collections::HashMap<&'static str, usize> =
            std::collections::HashMap::new();
        for entry in self.buckets.iter() {
            *by_class.entry(entry.key().1).or_default() += 1;
        }
        let mut by_class: Vec<ClassBuckets> = by_class
            .into_iter()
            .map(|(class, buckets)| ClassBuckets {
                class: class.to_string(),
                buckets,
            })
            .collect();
        by_class.sort_by(|a, b| a.class.cmp(&b.class));
        LimiterStats {
            buckets: self.buckets.len(),
            by_class,
        }
    }

    /// Periodic sweep task; spawned once at startup.
    pub fn start_sweeper(limiter: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_IDLE);
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        });
    }
}

/// Caller identity: first forwarded-for entry, else "anonymous". This is a
/// request-identity hook, not a security boundary.
pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Route class for a request line. Interactive translation is the most
/// expensive path and gets the tightest budget; batch admission tighter
/// still; reads and probes looser.
pub fn classify(method: &str, path: &str) -> RouteClass {
    if path.starts_with("/health") || path.starts_with("/metrics") {
        return HEALTH;
    }
    if path.starts_with("/mapping/batch") {
        return BATCH;
    }
    if (path == "/mapping" && method.eq_ignore_ascii_case("POST"))
        || path.starts_with("/fhir/ConceptMap/$translate")
    {
        return MAPPING;
    }
    if path.starts_with("/autocomplete")
        || (path == "/mapping" && method.eq_ignore_ascii_case("GET"))
        || path == "/mapping/stats"
        || path.starts_with("/fhir/ValueSet/$expand")
    {
        return SEARCH;
    }
    STANDARD
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: std::sync::Arc<RateLimiter>,
}

/// Axum middleware: classify, check, decorate with X-RateLimit headers.
pub async fn enforce(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let class = classify(request.method().as_str(), request.uri().path());
    let caller = caller_identity(request.headers());
    let decision = state.limiter.check(&class, &caller);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        AppError::RateLimited {
            message: class.message.to_string(),
            retry_after_secs: decision.reset_secs.max(1),
        }
        .into_response()
    };

    let headers = response.headers_mut();
    insert_header(headers, "X-RateLimit-Limit", decision.limit.to_string());
    insert_header(headers, "X-RateLimit-Remaining", decision.remaining.to_string());
    insert_header(headers, "X-RateLimit-Reset", decision.reset_secs.to_string());
    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: RouteClass = RouteClass {
        name: "tiny",
        window: Duration::from_secs(60),
        max_requests: 2,
        message: "limited",
    };

    #[test]
    fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new();
        let first = limiter.check(&TINY, "1.2.3.4");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = limiter.check(&TINY, "1.2.3.4");
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check(&TINY, "1.2.3.4");
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn callers_are_isolated() {
        let limiter = RateLimiter::new();
        limiter.check(&TINY, "1.2.3.4");
        limiter.check(&TINY, "1.2.3.4");
        assert!(limiter.check(&TINY, "5.6.7.8").allowed);
    }

    #[test]
    fn classes_are_isolated() {
        let limiter = RateLimiter::new();
        limiter.check(&TINY, "1.2.3.4");
        limiter.check(&TINY, "1.2.3.4");
        assert!(limiter.check(&STANDARD, "1.2.3.4").allowed);
    }

    #[test]
    fn remaining_is_strictly_decreasing_within_window() {
        let limiter = RateLimiter::new();
        let mut previous = u32::MAX;
        for _ in 0..5 {
            let decision = limiter.check(&SEARCH, "9.9.9.9");
            assert!(decision.remaining < previous);
            previous = decision.remaining;
        }
    }

    #[test]
    fn sweep_drops_no_fresh_buckets() {
        let limiter = RateLimiter::new();
        limiter.check(&TINY, "1.2.3.4");
        limiter.sweep();
        assert_eq!(limiter.stats().buckets, 1);
    }

    #[test]
    fn route_classification() {
        assert_eq!(classify("POST", "/mapping").name, "mapping");
        assert_eq!(classify("GET", "/mapping").name, "search");
        assert_eq!(classify("POST", "/mapping/batch").name, "batch");
        assert_eq!(classify("POST", "/mapping/batch/async").name, "batch");
        assert_eq!(classify("GET", "/autocomplete/source").name, "search");
        assert_eq!(classify("GET", "/health").name, "health");
        assert_eq!(classify("GET", "/metrics").name, "health");
        assert_eq!(classify("POST", "/fhir/ConceptMap/$translate").name, "mapping");
        assert_eq!(classify("GET", "/fhir/metadata").name, "standard");
        assert_eq!(classify("GET", "/admin/cache/stats").name, "standard");
    }

    #[test]
    fn caller_identity_parses_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(caller_identity(&headers), "10.0.0.1");

        let empty = HeaderMap::new();
        assert_eq!(caller_identity(&empty), "anonymous");
    }
}
