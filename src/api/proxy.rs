//! Passthrough proxy engine.
//!
//! Every request that is not served by one of the server's own routes is
//! resolved to a backend, audited, forwarded, and relayed back. Streaming
//! responses are passed through chunk by chunk while a copy is kept for the
//! audit record.

use crate::api::audit::{AuditBody, PendingAudit, CLIENT_CLOSED_REQUEST};
use crate::api::handlers::AppState;
use crate::api::routing::{self, ProxyRequest};
use crate::api::streaming::is_event_stream;
use crate::core::config::BackendConfig;
use crate::core::database::LogRecord;
use crate::core::decoder;
use crate::core::dialect::apply_quirks;
use crate::core::error::{AppError, Result};
use crate::core::header_policy::{
    headers_to_json, rewrite_request_headers, should_forward_response_header,
};
use crate::core::metrics::get_metrics;
use crate::core::middleware::BackendName;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use chrono::{SecondsFormat, Utc};
use futures::stream::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Fallback handler for all backend traffic.
pub async fn handle_proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match proxy_request(state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy_request(state: Arc<AppState>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let body = read_body_limited(&parts.headers, body, state.config.max_request_body_bytes).await?;

    let mut req = routing::resolve(parts.method, &parts.uri, parts.headers, body, &state.registry)?;
    let backend = state
        .registry
        .get(&req.backend_id)
        .cloned()
        .ok_or_else(|| AppError::UnknownBackend(req.backend_id.clone()))?;

    if let (Some(quirks), Some(parsed)) = (backend.active_quirks(), req.parsed_body.as_mut()) {
        if apply_quirks(parsed, quirks) {
            req.reserialize_body()?;
        }
    }

    let target_url = target_url(&backend.base_url, &req.sub_path, req.query.as_deref());
    let audit = state.audit.begin(pending_record(&req, &target_url)).await;

    dispatch(&state, &backend, req, target_url, audit).await
}

/// Read the request body, refusing anything larger than `limit`.
///
/// A declared `Content-Length` over the limit is rejected before reading.
async fn read_body_limited(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(AppError::PayloadTooLarge { limit });
    }

    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| AppError::InvalidRequest(format!("failed to read request body: {}", e)))?;
        if buf.len() + chunk.len() > limit {
            return Err(AppError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// `base_url + "/" + sub_path`, plus the raw query when present.
pub fn target_url(base_url: &str, sub_path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/{}", base_url, sub_path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn pending_record(req: &ProxyRequest, target_url: &str) -> LogRecord {
    let user_agent = req
        .headers
        .get(header::USER_AGENT)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    LogRecord {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        backend: req.backend_id.clone(),
        method: req.method.to_string(),
        model: req.model.clone(),
        target_url: target_url.to_string(),
        request_headers: headers_to_json(
            req.headers
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_bytes())),
        ),
        request_body: String::from_utf8_lossy(&req.body).into_owned(),
        request_body_size: req.body.len() as i64,
        user_agent,
        ..Default::default()
    }
}

/// Record a failed call, count it, and hand back the error for the client.
fn fail(audit: Option<PendingAudit>, backend: &str, reason: &str, err: AppError) -> AppError {
    get_metrics()
        .upstream_failures
        .with_label_values(&[backend, reason])
        .inc();
    tracing::warn!(backend = %backend, reason = %reason, "Upstream call failed: {}", err);

    if let Some(audit) = audit {
        audit.detach(
            i64::from(err.status_code().as_u16()),
            String::new(),
            AuditBody::Text(err.to_string()),
        );
    }
    err
}

/// Tracks an in-flight call on the active requests gauge.
struct ActiveRequest {
    backend: String,
}

impl ActiveRequest {
    fn new(backend: &str) -> Self {
        get_metrics()
            .active_requests
            .with_label_values(&[backend])
            .inc();
        Self {
            backend: backend.to_string(),
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        get_metrics()
            .active_requests
            .with_label_values(&[&self.backend])
            .dec();
    }
}

async fn dispatch(
    state: &AppState,
    backend: &BackendConfig,
    req: ProxyRequest,
    target_url: String,
    audit: Option<PendingAudit>,
) -> Result<Response> {
    let active = ActiveRequest::new(&backend.id);
    let timeout_secs = state.config.request_timeout_secs;
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let wants_stream = req.wants_stream();

    let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
        .map_err(|_| AppError::InvalidRequest(format!("unsupported method {}", req.method)))?;
    let mut outbound = state.http_client.request(method, &target_url);
    for (name, value) in &rewrite_request_headers(&req.headers, backend) {
        outbound = outbound.header(name.as_str(), value.as_bytes());
    }
    if !req.body.is_empty() {
        outbound = outbound.body(req.body);
    }

    tracing::debug!(backend = %backend.id, url = %target_url, stream = wants_stream, "Forwarding request");

    let upstream = match timeout_at(deadline, outbound.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(fail(audit, &backend.id, "request", AppError::Request(e))),
        Err(_) => {
            let err = AppError::UpstreamTimeout { timeout_secs };
            return Err(fail(audit, &backend.id, "timeout", err));
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let audit_headers = headers_to_json(
        upstream
            .headers()
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_bytes())),
    );
    let client_headers = forwardable_response_headers(upstream.headers());
    let encoding = upstream
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let upstream_is_stream = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_event_stream);

    let body = if wants_stream || upstream_is_stream {
        let relay = Relay {
            upstream: Box::pin(upstream.bytes_stream()),
            deadline,
            timeout_secs,
            chunks: Vec::new(),
            audit,
            status: i64::from(status.as_u16()),
            headers: audit_headers,
            encoding,
            backend: backend.id.clone(),
            _active: active,
        };
        Body::from_stream(relay.into_stream())
    } else {
        let raw = match timeout_at(deadline, upstream.bytes()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(fail(audit, &backend.id, "body", AppError::Request(e))),
            Err(_) => {
                let err = AppError::UpstreamTimeout { timeout_secs };
                return Err(fail(audit, &backend.id, "timeout", err));
            }
        };

        let decoded = match decoder::decode(&raw, &encoding) {
            Ok(decoded) => decoded,
            Err(e) => return Err(fail(audit, &backend.id, "decode", AppError::Decode(e))),
        };

        if let Some(audit) = audit {
            audit.detach(
                i64::from(status.as_u16()),
                audit_headers,
                AuditBody::Text(String::from_utf8_lossy(&decoded).into_owned()),
            );
        }
        drop(active);
        Body::from(raw)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = client_headers;
    response
        .extensions_mut()
        .insert(BackendName(backend.id.clone()));
    Ok(response)
}

/// Convert backend response headers, dropping the ones the proxy owns.
fn forwardable_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !should_forward_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

type UpstreamStream =
    std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send + 'static>>;

/// State of a streamed response relay.
///
/// Each upstream chunk is yielded to the client as soon as it arrives and
/// a copy is kept. The audit record is completed when the upstream ends,
/// fails or times out; if the client disconnects first the relay is dropped
/// and the record is closed with status 499.
struct Relay {
    upstream: UpstreamStream,
    deadline: Instant,
    timeout_secs: u64,
    chunks: Vec<Bytes>,
    audit: Option<PendingAudit>,
    status: i64,
    headers: String,
    encoding: String,
    backend: String,
    _active: ActiveRequest,
}

impl Relay {
    fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(Some(self), |relay| async move {
            let mut relay = relay?;
            match timeout_at(relay.deadline, relay.upstream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    relay.chunks.push(chunk.clone());
                    Some((Ok(chunk), Some(relay)))
                }
                Ok(None) => {
                    let status = relay.status;
                    relay.finish(status);
                    None
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(backend = %relay.backend, "Upstream stream error: {}", e);
                    relay.fail("stream", StatusCode::BAD_GATEWAY);
                    Some((Err(std::io::Error::other(e)), None))
                }
                Err(_) => {
                    tracing::warn!(
                        backend = %relay.backend,
                        "Upstream stream timed out after {}s",
                        relay.timeout_secs
                    );
                    relay.fail("timeout", StatusCode::GATEWAY_TIMEOUT);
                    let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timeout");
                    Some((Err(err), None))
                }
            }
        })
    }

    fn fail(&mut self, reason: &str, status: StatusCode) {
        get_metrics()
            .upstream_failures
            .with_label_values(&[&self.backend, reason])
            .inc();
        self.finish(i64::from(status.as_u16()));
    }

    /// Complete the audit record with the reconstructed body so far.
    fn finish(&mut self, status: i64) {
        if let Some(audit) = self.audit.take() {
            let body = AuditBody::Stream {
                chunks: std::mem::take(&mut self.chunks),
                encoding: std::mem::take(&mut self.encoding),
            };
            audit.detach(status, std::mem::take(&mut self.headers), body);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(audit) = self.audit.take() {
            tracing::debug!(backend = %self.backend, "Client disconnect detected, stream cancelled");
            let body = AuditBody::Stream {
                chunks: std::mem::take(&mut self.chunks),
                encoding: std::mem::take(&mut self.encoding),
            };
            audit.detach(CLIENT_CLOSED_REQUEST, std::mem::take(&mut self.headers), body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        assert_eq!(
            target_url("http://localhost:11434/v1", "chat/completions", None),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            target_url("http://b/v1", "models", Some("a=1&b=2")),
            "http://b/v1/models?a=1&b=2"
        );
        assert_eq!(target_url("http://b", "", Some("")), "http://b/");
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("11"));
        let result = read_body_limited(&headers, Body::from("tiny"), 10).await;
        assert!(matches!(result, Err(AppError::PayloadTooLarge { limit: 10 })));
    }

    #[tokio::test]
    async fn test_actual_length_over_limit_is_rejected() {
        let result = read_body_limited(&HeaderMap::new(), Body::from("x".repeat(11)), 10).await;
        assert!(matches!(result, Err(AppError::PayloadTooLarge { .. })));

        let body = read_body_limited(&HeaderMap::new(), Body::from("x".repeat(10)), 10)
            .await
            .unwrap();
        assert_eq!(body.len(), 10);
    }

    #[test]
    fn test_forwardable_response_headers() {
        let mut upstream = reqwest::header::HeaderMap::new();
        upstream.insert("content-type", "application/json".parse().unwrap());
        upstream.insert("access-control-allow-origin", "https://x".parse().unwrap());
        upstream.insert("transfer-encoding", "chunked".parse().unwrap());
        upstream.insert("x-request-id", "abc".parse().unwrap());
        upstream.insert("content-length", "42".parse().unwrap());

        let out = forwardable_response_headers(&upstream);
        assert_eq!(out.len(), 3);
        assert_eq!(out["content-type"], "application/json");
        assert_eq!(out["x-request-id"], "abc");
        assert_eq!(out["content-length"], "42");
    }
}
