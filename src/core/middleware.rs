//! HTTP middleware for CORS and request metrics.

use crate::core::metrics::get_metrics;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Extension set on proxied responses so metrics can be labelled by backend.
#[derive(Clone, Debug)]
pub struct BackendName(pub String);

const CORS_HEADERS: [(header::HeaderName, &str); 4] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true"),
    (
        header::ACCESS_CONTROL_ALLOW_METHODS,
        "GET, POST, PUT, DELETE, OPTIONS",
    ),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
];

/// Permissive CORS for browser dashboards.
///
/// `OPTIONS` is answered with 204 without reaching any handler; every other
/// response gets the same headers.
pub async fn cors_middleware(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        let mut preflight = Response::new(Body::empty());
        *preflight.status_mut() = StatusCode::NO_CONTENT;
        preflight
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Records count and latency of proxied calls.
    ///
    /// Only responses carrying a [`BackendName`] extension are counted, so
    /// the log, event and metrics endpoints stay out of the numbers. For
    /// streaming responses the duration covers time to headers.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let method = request.method().to_string();
        let start = Instant::now();

        let response = next.run(request).await;

        if let Some(BackendName(backend)) = response.extensions().get::<BackendName>() {
            let metrics = get_metrics();
            let status_code = response.status().as_u16().to_string();

            metrics
                .request_count
                .with_label_values(&[&method, backend, &status_code])
                .inc();
            metrics
                .request_duration
                .with_label_values(&[&method, backend])
                .observe(start.elapsed().as_secs_f64());
        }

        response
    }
}
