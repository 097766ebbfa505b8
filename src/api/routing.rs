//! Resolution of an inbound request into a backend call.
//!
//! Direct routes name the backend in the first path segment. The unified
//! `v1` endpoint names it inside the body: `"model": "backend:model"`.

use crate::core::config::UNIFIED_BACKEND_ID;
use crate::core::error::{AppError, Result};
use crate::services::provider_registry::ProviderRegistry;
use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use serde_json::Value;

/// A request bound to a specific backend.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub backend_id: String,
    pub sub_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Body as it will be forwarded
    pub body: Bytes,
    /// `body` parsed as JSON, when it is JSON
    pub parsed_body: Option<Value>,
    pub model: String,
}

impl ProxyRequest {
    /// Whether the client asked for a streamed response.
    pub fn wants_stream(&self) -> bool {
        let query_flag = self
            .query
            .as_deref()
            .map(|q| q.split('&').any(|pair| pair == "stream=true"))
            .unwrap_or(false);
        let body_flag = self
            .parsed_body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        query_flag || body_flag
    }

    /// Replace the body with the serialized form of `parsed_body`.
    pub fn reserialize_body(&mut self) -> Result<()> {
        if let Some(parsed) = &self.parsed_body {
            self.body = Bytes::from(serde_json::to_vec(parsed)?);
        }
        Ok(())
    }
}

/// Split a path into its leading segment and the remainder.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    trimmed.split_once('/').unwrap_or((trimmed, ""))
}

/// Split a unified model name on its first `:`.
pub fn parse_unified_model(model: &str) -> Option<(&str, &str)> {
    model.split_once(':')
}

fn body_model(parsed: Option<&Value>) -> Option<&str> {
    parsed.and_then(|b| b.get("model")).and_then(Value::as_str)
}

/// Resolve the target backend and sub-path for a request.
pub fn resolve(
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
    registry: &ProviderRegistry,
) -> Result<ProxyRequest> {
    let (segment, rest) = split_path(uri.path());
    let mut parsed_body = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(&body).ok()
    };

    let mut backend_id = segment.to_string();
    let mut model = body_model(parsed_body.as_ref()).unwrap_or_default().to_string();
    let mut body = body;

    if segment == UNIFIED_BACKEND_ID && method != Method::GET && method != Method::HEAD {
        let parsed = parsed_body
            .as_mut()
            .ok_or_else(|| AppError::InvalidRequest("body must be a JSON object".to_string()))?;
        let qualified = body_model(Some(&*parsed))
            .ok_or_else(|| AppError::InvalidRequest("missing \"model\" field".to_string()))?
            .to_string();
        let (id, bare) = parse_unified_model(&qualified).ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "model \"{}\" must be in the form backend:model",
                qualified
            ))
        })?;

        backend_id = id.to_string();
        model = bare.to_string();
        parsed["model"] = Value::String(model.clone());
        body = Bytes::from(serde_json::to_vec(parsed)?);
    }

    if !registry.contains(&backend_id) {
        return Err(AppError::UnknownBackend(backend_id));
    }

    Ok(ProxyRequest {
        method,
        backend_id,
        sub_path: rest.to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
        parsed_body,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BackendConfig;
    use proptest::prelude::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::from_backends(["ollama", "openai", "off"].iter().map(|id| BackendConfig {
            id: id.to_string(),
            base_url: format!("http://{id}"),
            enabled: Some(*id != "off"),
            ..Default::default()
        }))
    }

    fn post(path: &str, body: &str) -> Result<ProxyRequest> {
        resolve(
            Method::POST,
            &path.parse().unwrap(),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
            &registry(),
        )
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/ollama/chat/completions"), ("ollama", "chat/completions"));
        assert_eq!(split_path("/ollama"), ("ollama", ""));
        assert_eq!(split_path("/ollama/"), ("ollama", ""));
        assert_eq!(split_path("/"), ("", ""));
    }

    #[test]
    fn test_direct_route() {
        let req = post("/openai/chat/completions?x=1", r#"{"model":"gpt-4o"}"#).unwrap();
        assert_eq!(req.backend_id, "openai");
        assert_eq!(req.sub_path, "chat/completions");
        assert_eq!(req.query.as_deref(), Some("x=1"));
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(&req.body[..], br#"{"model":"gpt-4o"}"#);
    }

    #[test]
    fn test_direct_route_non_json_body() {
        let req = post("/openai/audio", "raw bytes").unwrap();
        assert_eq!(req.model, "");
        assert!(req.parsed_body.is_none());
    }

    #[test]
    fn test_unified_route_rewrites_model() {
        let req = post("/v1/chat/completions", r#"{"model":"ollama:llama3:8b","stream":true}"#)
            .unwrap();
        assert_eq!(req.backend_id, "ollama");
        assert_eq!(req.model, "llama3:8b");
        assert_eq!(req.sub_path, "chat/completions");
        let forwarded: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(forwarded["model"], "llama3:8b");
        assert_eq!(forwarded["stream"], true);
        assert!(req.wants_stream());
    }

    #[test]
    fn test_unified_route_errors() {
        assert!(matches!(
            post("/v1/chat/completions", "not json"),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            post("/v1/chat/completions", r#"{"messages":[]}"#),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            post("/v1/chat/completions", r#"{"model":42}"#),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            post("/v1/chat/completions", r#"{"model":"llama3"}"#),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            post("/v1/chat/completions", r#"{"model":"nope:llama3"}"#),
            Err(AppError::UnknownBackend(ref id)) if id == "nope"
        ));
    }

    #[test]
    fn test_disabled_backend_is_unknown() {
        assert!(matches!(
            post("/off/chat/completions", "{}"),
            Err(AppError::UnknownBackend(_))
        ));
        assert!(matches!(
            post("/v1/chat/completions", r#"{"model":"off:m"}"#),
            Err(AppError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_get_on_unified_endpoint_is_not_resolvable() {
        let result = resolve(
            Method::GET,
            &"/v1/embeddings".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            &registry(),
        );
        assert!(matches!(result, Err(AppError::UnknownBackend(ref id)) if id == "v1"));
    }

    #[test]
    fn test_stream_flag_from_query() {
        let req = post("/openai/chat/completions?stream=true", "{}").unwrap();
        assert!(req.wants_stream());
        let req = post("/openai/chat/completions?stream=false", r#"{"stream":false}"#).unwrap();
        assert!(!req.wants_stream());
    }

    proptest! {
        #[test]
        fn prop_unified_split_on_first_colon(
            backend in "[a-z][a-z0-9-]{0,11}",
            model in "[a-zA-Z0-9:._/-]{1,24}",
        ) {
            let qualified = format!("{}:{}", backend, model);
            let (id, bare) = parse_unified_model(&qualified).unwrap();
            prop_assert_eq!(id, backend.as_str());
            prop_assert_eq!(bare, model.as_str());
        }

        #[test]
        fn prop_unified_resolution_yields_body_backend(model in "[a-zA-Z0-9:._-]{1,24}") {
            let body = serde_json::json!({"model": format!("openai:{}", model)}).to_string();
            let req = post("/v1/chat/completions", &body).unwrap();
            prop_assert_eq!(req.backend_id, "openai");
            prop_assert_eq!(req.model, model);
        }
    }
}
