//! HTTP layer of the proxy server.
//!
//! This module contains the passthrough proxy engine, request routing,
//! stream reconstruction for auditing, and the log and live update
//! endpoints.

pub mod audit;
pub mod events;
pub mod handlers;
pub mod logs;
pub mod proxy;
pub mod routing;
pub mod streaming;

// Re-export commonly used types
pub use audit::{AuditBody, AuditTrail, PendingAudit};
pub use handlers::{create_http_client, AppState};
pub use proxy::handle_proxy;
pub use routing::ProxyRequest;
pub use streaming::reconstruct_stream_body;

use crate::core::metrics::metrics_handler;
use crate::core::middleware::{cors_middleware, MetricsMiddleware};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the application router.
///
/// Anything not matched by the server's own routes is proxied.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .route("/log", get(logs::list_logs))
        .route("/log/detail", get(logs::log_detail))
        .route("/ui/sse", get(events::sse_handler))
        .route(
            "/v1/models",
            get(handlers::list_models).fallback(proxy::handle_proxy),
        )
        .fallback(proxy::handle_proxy)
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(cors_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
