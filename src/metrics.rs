//! Prometheus metrics.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    pipeline_outcomes: IntCounterVec,
    rate_limited: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Static names and labels; construction cannot fail at runtime.
        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests served"),
            &["method", "path", "status"],
        )
        .expect("static metric opts");
        let http_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                .buckets(vec![0.005, 0.025, 0.1, 0.25, 1.0, 2.5, 10.0, 30.0]),
            &["method", "path"],
        )
        .expect("static metric opts");
        let pipeline_outcomes = IntCounterVec::new(
            Opts::new("pipeline_outcomes_total", "Mapping pipeline outcomes by route"),
            &["route"],
        )
        .expect("static metric opts");
        let rate_limited = IntCounterVec::new(
            Opts::new("rate_limited_total", "Requests rejected by the rate limiter"),
            &["class"],
        )
        .expect("static metric opts");

        let _ = registry.register(Box::new(http_requests.clone()));
        let _ = registry.register(Box::new(http_duration.clone()));
        let _ = registry.register(Box::new(pipeline_outcomes.clone()));
        let _ = registry.register(Box::new(rate_limited.clone()));

        Self {
            registry,
            http_requests,
            http_duration,
            pipeline_outcomes,
            rate_limited,
        }
    }

    pub fn observe_request(&self, method: &str, path: &str, status: u16, seconds: f64) {
        self.http_requests
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.http_duration
            .with_label_values(&[method, path])
            .observe(seconds);
    }

    pub fn pipeline_outcome(&self, route: &str) {
        self.pipeline_outcomes.with_label_values(&[route]).inc();
    }

    pub fn rate_limited(&self, class: &str) {
        self.rate_limited.with_label_values(&[class]).inc();
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        let metrics = Metrics::new();
        metrics.observe_request("POST", "/mapping", 200, 0.2);
        metrics.pipeline_outcome("high_confidence");

        let text = metrics.render();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("pipeline_outcomes_total"));
    }
}
