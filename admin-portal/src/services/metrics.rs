use crate::models::Verdict;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static GUARD_VERDICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static ALLOW_LIST_CHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Build the registry once. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;

    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;

    let verdicts_total = IntCounterVec::new(
        Opts::new(
            "guard_verdicts_total",
            "Verdicts published by admin guard reconcilers",
        ),
        &["verdict"],
    )?;

    let allow_list_checks = IntCounterVec::new(
        Opts::new(
            "allow_list_checks_total",
            "Allow-list lookups by outcome",
        ),
        &["outcome"],
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(verdicts_total.clone()))?;
    registry.register(Box::new(allow_list_checks.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = GUARD_VERDICTS_TOTAL.set(verdicts_total);
    let _ = ALLOW_LIST_CHECKS_TOTAL.set(allow_list_checks);
    Ok(())
}

pub fn record_http_request(method: &str, path: &str, status: &str, seconds: f64) {
    if let Some(counter) = HTTP_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, path, status]).inc();
    }
    if let Some(histogram) = HTTP_REQUEST_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[method, path, status])
            .observe(seconds);
    }
}

pub fn record_verdict(verdict: &Verdict) {
    if let Some(counter) = GUARD_VERDICTS_TOTAL.get() {
        counter.with_label_values(&[verdict.label()]).inc();
    }
}

pub fn record_allow_list_check(outcome: &str) {
    if let Some(counter) = ALLOW_LIST_CHECKS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Prometheus text exposition of every registered metric. Empty until
/// `init_metrics` has run.
pub fn get_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
