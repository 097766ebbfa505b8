//! Shared application state and the server's own small endpoints.

use crate::api::audit::AuditTrail;
use crate::core::config::{AppConfig, UNIFIED_BACKEND_ID};
use crate::core::database::AuditLog;
use crate::services::{EventHub, ModelCatalog, ProviderRegistry};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub registry: ProviderRegistry,
    pub http_client: reqwest::Client,
    pub audit_store: Arc<dyn AuditLog>,
    pub audit: AuditTrail,
    pub hub: Arc<EventHub>,
    pub models: ModelCatalog,
}

impl AppState {
    pub fn new(config: AppConfig, audit_store: Arc<dyn AuditLog>) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_config(&config);
        let http_client = create_http_client()?;
        let hub = Arc::new(EventHub::new(config.subscriber_queue_capacity));
        let audit = AuditTrail::new(Arc::clone(&audit_store), Arc::clone(&hub));

        Ok(Self {
            config,
            registry,
            http_client,
            audit_store,
            audit,
            hub,
            models: ModelCatalog::new(),
        })
    }
}

/// HTTP client for backend calls.
///
/// No client-wide timeout: each call carries its own deadline.
pub fn create_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .build()
}

/// Landing page listing the proxy's base URLs.
pub async fn index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let listen_addr = state.config.listen_addr();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&listen_addr);

    let link = |id: &str| format!("<div><a href=\"http://{host}/{id}\">http://{host}/{id}</a></div>");

    let mut page = String::from(
        "<html><head><title>LLMSee</title><style>body{font-family:monospace;background-color:black;\
         color:white;padding:10px}a,a:visited{color:yellow}</style></head><body>",
    );
    page.push_str(&format!("<div>LLMSee {} Ready</div>", env!("CARGO_PKG_VERSION")));
    page.push_str("<div style=\"margin-top:15px\">API Base URL:</div>");
    page.push_str(&link(UNIFIED_BACKEND_ID));
    page.push_str("<div style=\"margin-top:15px\">Individual Provider URLs:</div>");
    for backend in state.registry.iter() {
        page.push_str(&link(&backend.id));
    }
    page.push_str("<div style=\"margin-top:15px\">Live updates:</div>");
    page.push_str(&format!("<div>http://{host}/ui/sse</div>"));
    page.push_str("</body></html>");

    Html(page)
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /v1/models`: the aggregated, backend-prefixed model list.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state
        .models
        .get_or_build(
            &state.registry,
            &state.http_client,
            Duration::from_secs(state.config.model_list_timeout_secs),
        )
        .await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        snapshot,
    )
        .into_response()
}
