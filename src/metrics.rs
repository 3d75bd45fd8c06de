//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Inbound federation
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_activities_received_total", "Activities accepted at an inbox endpoint"),
        &["activity_type", "inbox"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_activities_processed_total", "Inbound activity processing outcomes"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_signature_failures_total", "HTTP signature verification failures"),
        &["reason"]
    ).expect("metric can be created");

    // Outbound federation
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_deliveries_total", "Outbound delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fediport_delivery_duration_seconds",
            "Outbound delivery request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref QUEUE_JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_queue_jobs_total", "Queue job state transitions"),
        &["queue", "state"]
    ).expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fediport_queue_jobs", "Jobs stored per queue and state, read at scrape time"),
        &["queue", "state"]
    ).expect("metric can be created");
    pub static ref QUEUE_WORKERS_BUSY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fediport_queue_workers_busy", "Jobs currently executing per queue"),
        &["queue"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fediport_errors_total", "Total number of errors returned to HTTP clients"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_PROCESSED.clone()))
        .expect("ACTIVITIES_PROCESSED can be registered");
    REGISTRY
        .register(Box::new(SIGNATURE_FAILURES.clone()))
        .expect("SIGNATURE_FAILURES can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(QUEUE_JOBS_TOTAL.clone()))
        .expect("QUEUE_JOBS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(QUEUE_DEPTH.clone()))
        .expect("QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(QUEUE_WORKERS_BUSY.clone()))
        .expect("QUEUE_WORKERS_BUSY can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
