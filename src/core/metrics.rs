//! Prometheus metrics for monitoring the proxy.
//!
//! A single process-wide registry, initialized on first use.

use crate::core::error::{AppError, Result};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Proxied calls by method, backend and status
    pub request_count: IntCounterVec,

    /// Proxied call duration in seconds, headers through end of body
    pub request_duration: HistogramVec,

    /// Calls currently in flight by backend
    pub active_requests: IntGaugeVec,

    /// Failed or timed out backend calls by backend and reason
    pub upstream_failures: IntCounterVec,

    /// Connected live-update subscribers
    pub sse_subscribers: IntGauge,

    /// Events dropped because a subscriber queue was full
    pub sse_dropped_events: IntCounter,

    /// Failed `/models` fetches by backend
    pub model_fetch_failures: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry. Subsequent calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llmsee_requests_total",
            "Total number of proxied requests",
            &["method", "backend", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llmsee_request_duration_seconds",
            "Proxied request duration in seconds",
            &["method", "backend"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 600.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_int_gauge_vec!(
            "llmsee_active_requests",
            "Number of proxied requests in flight",
            &["backend"]
        )
        .expect("Failed to register active_requests metric");

        let upstream_failures = register_int_counter_vec!(
            "llmsee_upstream_failures_total",
            "Backend calls that failed before completing",
            &["backend", "reason"]
        )
        .expect("Failed to register upstream_failures metric");

        let sse_subscribers = register_int_gauge!(
            "llmsee_sse_subscribers",
            "Connected live-update subscribers"
        )
        .expect("Failed to register sse_subscribers metric");

        let sse_dropped_events = register_int_counter!(
            "llmsee_sse_dropped_events_total",
            "Events dropped for a saturated subscriber"
        )
        .expect("Failed to register sse_dropped_events metric");

        let model_fetch_failures = register_int_counter_vec!(
            "llmsee_model_fetch_failures_total",
            "Failed model list fetches",
            &["backend"]
        )
        .expect("Failed to register model_fetch_failures metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            upstream_failures,
            sse_subscribers,
            sse_dropped_events,
            model_fetch_failures,
        }
    })
}

/// Get the global metrics instance, initializing it if needed.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Prometheus text exposition for `GET /metrics`.
pub async fn metrics_handler() -> Result<Response> {
    init_metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}
