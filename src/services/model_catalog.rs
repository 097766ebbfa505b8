//! Aggregated model list across all backends.
//!
//! The list is assembled on first request by asking every backend for its
//! models concurrently, then served from memory for the life of the process.

use crate::core::config::BackendConfig;
use crate::core::decoder;
use crate::core::header_policy::rewrite_request_headers;
use crate::core::metrics::get_metrics;
use crate::services::provider_registry::ProviderRegistry;
use anyhow::{anyhow, Context};
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

/// Cached `{object: "list", data: [...]}` document.
#[derive(Default)]
pub struct ModelCatalog {
    snapshot: RwLock<Option<Bytes>>,
    build_gate: Mutex<()>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached document, if it has been built.
    pub fn peek(&self) -> Option<Bytes> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return the cached document, building it on first use.
    ///
    /// Concurrent first callers wait on a single build and all receive the
    /// same bytes. Whatever the first build merged is served from then on,
    /// even if every backend failed.
    pub async fn get_or_build(
        &self,
        registry: &ProviderRegistry,
        client: &reqwest::Client,
        fetch_timeout: Duration,
    ) -> Bytes {
        if let Some(snapshot) = self.peek() {
            return snapshot;
        }

        let _gate = self.build_gate.lock().await;
        if let Some(snapshot) = self.peek() {
            return snapshot;
        }

        let models = collect_models(registry, client, fetch_timeout).await;
        let snapshot = Bytes::from(
            serde_json::to_vec(&json!({ "object": "list", "data": models }))
                .unwrap_or_else(|_| br#"{"object":"list","data":[]}"#.to_vec()),
        );

        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        tracing::info!("Model list cached ({} bytes)", snapshot.len());
        snapshot
    }
}

/// Gather models from every backend, sorted by id. Failed backends are
/// logged and skipped.
async fn collect_models(
    registry: &ProviderRegistry,
    client: &reqwest::Client,
    fetch_timeout: Duration,
) -> Vec<Value> {
    let mut models = Vec::new();
    let mut tasks = Vec::new();

    for backend in registry.iter() {
        match &backend.models {
            Some(fixed) => models.extend(static_models(&backend.id, fixed)),
            None => {
                let backend = Arc::clone(backend);
                let client = client.clone();
                tasks.push(tokio::spawn(async move {
                    let result = tokio::time::timeout(fetch_timeout, fetch_models(&client, &backend))
                        .await
                        .map_err(|_| anyhow!("timed out after {}s", fetch_timeout.as_secs()))
                        .and_then(|r| r);
                    (backend, result)
                }));
            }
        }
    }

    for joined in join_all(tasks).await {
        match joined {
            Ok((_, Ok(list))) => models.extend(list),
            Ok((backend, Err(e))) => {
                get_metrics()
                    .model_fetch_failures
                    .with_label_values(&[&backend.id])
                    .inc();
                tracing::warn!(backend = %backend.id, "Error fetching models: {:#}", e);
            }
            Err(e) => {
                tracing::error!("Model fetch task failed: {}", e);
            }
        }
    }

    models.sort_by(|a, b| model_id(a).cmp(model_id(b)));
    models
}

fn model_id(model: &Value) -> &str {
    model.get("id").and_then(Value::as_str).unwrap_or_default()
}

fn static_models(backend_id: &str, models: &[String]) -> Vec<Value> {
    models
        .iter()
        .map(|m| {
            json!({
                "id": format!("{}:{}", backend_id, m),
                "object": "model",
                "owned_by": backend_id,
            })
        })
        .collect()
}

async fn fetch_models(client: &reqwest::Client, backend: &BackendConfig) -> anyhow::Result<Vec<Value>> {
    let url = format!("{}/models", backend.base_url);
    let headers = rewrite_request_headers(&HeaderMap::new(), backend);

    let mut request = client.get(&url);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_bytes());
    }

    let response = request.send().await.context("request failed")?;
    let status = response.status();
    let encoding = response
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.bytes().await.context("failed to read body")?;

    if !status.is_success() {
        return Err(anyhow!("backend returned {}", status));
    }

    let body = decoder::decode(&body, &encoding)?;
    let parsed: Value = serde_json::from_slice(&body).context("could not parse response")?;
    Ok(prefix_models(&backend.id, parsed))
}

/// Keep object entries of `data` that have a string `id`, prefixing `id` and
/// `name` with the backend id.
pub fn prefix_models(backend_id: &str, document: Value) -> Vec<Value> {
    let Value::Object(mut document) = document else {
        return Vec::new();
    };
    let Some(Value::Array(data)) = document.remove("data") else {
        return Vec::new();
    };

    data.into_iter()
        .filter_map(|item| {
            let Value::Object(mut obj) = item else {
                return None;
            };
            let id = obj.get("id")?.as_str()?.to_string();
            obj.insert("id".to_string(), Value::String(format!("{}:{}", backend_id, id)));
            if let Some(name) = obj.get("name").and_then(Value::as_str).map(str::to_string) {
                obj.insert("name".to_string(), Value::String(format!("{}:{}", backend_id, name)));
            }
            Some(Value::Object(obj))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(id: &str, base_url: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_prefix_models_filters_and_prefixes() {
        let doc = json!({
            "object": "list",
            "data": [
                {"id": "llama3", "name": "Llama 3", "object": "model"},
                {"id": 42},
                "bare string",
                {"name": "no id"},
                {"id": "qwen"}
            ]
        });

        let models = prefix_models("ollama", doc);
        assert_eq!(
            models,
            vec![
                json!({"id": "ollama:llama3", "name": "ollama:Llama 3", "object": "model"}),
                json!({"id": "ollama:qwen"}),
            ]
        );
    }

    #[test]
    fn test_prefix_models_without_data() {
        assert!(prefix_models("x", json!({"models": []})).is_empty());
        assert!(prefix_models("x", json!([1, 2])).is_empty());
    }

    #[test]
    fn test_static_models() {
        let models = static_models("local", &["a".to_string()]);
        assert_eq!(
            models,
            vec![json!({"id": "local:a", "object": "model", "owned_by": "local"})]
        );
    }

    #[tokio::test]
    async fn test_build_merges_sorts_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer sk-z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "zeta"}, {"id": "alpha"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut remote = backend("remote", &format!("{}/v1", server.uri()));
        remote.api_key = Some("sk-z".to_string());
        let mut fixed = backend("fixed", "http://unused");
        fixed.models = Some(vec!["m1".to_string()]);
        let registry = ProviderRegistry::from_backends(vec![remote, fixed]);

        let catalog = ModelCatalog::new();
        assert!(catalog.peek().is_none());

        let client = reqwest::Client::new();
        let first = catalog
            .get_or_build(&registry, &client, Duration::from_secs(5))
            .await;
        let doc: Value = serde_json::from_slice(&first).unwrap();
        let ids: Vec<&str> = doc["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(model_id)
            .collect();
        assert_eq!(doc["object"], "list");
        assert_eq!(ids, vec!["fixed:m1", "remote:alpha", "remote:zeta"]);

        // Served from cache; the mock expects exactly one call.
        let second = catalog
            .get_or_build(&registry, &client, Duration::from_secs(5))
            .await;
        assert_eq!(first, second);
        assert_eq!(catalog.peek(), Some(first));
    }

    #[tokio::test]
    async fn test_failed_backend_is_skipped() {
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "m"}]})))
            .mount(&good)
            .await;
        let bad = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;

        let registry = ProviderRegistry::from_backends(vec![
            backend("good", &good.uri()),
            backend("bad", &bad.uri()),
        ]);

        let catalog = ModelCatalog::new();
        let snapshot = catalog
            .get_or_build(&registry, &reqwest::Client::new(), Duration::from_secs(5))
            .await;
        let doc: Value = serde_json::from_slice(&snapshot).unwrap();
        assert_eq!(doc["data"], json!([{"id": "good:m"}]));
        assert!(catalog.peek().is_some());
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"id": "late"}]}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&slow)
            .await;

        let mut fixed = backend("fixed", "http://unused");
        fixed.models = Some(vec!["m".to_string()]);
        let registry = ProviderRegistry::from_backends(vec![backend("slow", &slow.uri()), fixed]);

        let catalog = ModelCatalog::new();
        let snapshot = catalog
            .get_or_build(&registry, &reqwest::Client::new(), Duration::from_millis(200))
            .await;
        let doc: Value = serde_json::from_slice(&snapshot).unwrap();
        assert_eq!(doc["data"].as_array().unwrap().len(), 1);
        assert_eq!(doc["data"][0]["id"], "fixed:m");
    }

    #[tokio::test]
    async fn test_empty_first_build_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "m"}]})))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::from_backends(vec![backend("ollama", &server.uri())]);
        let catalog = ModelCatalog::new();
        let client = reqwest::Client::new();

        let first = catalog
            .get_or_build(&registry, &client, Duration::from_secs(2))
            .await;
        let doc: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(doc, json!({"object": "list", "data": []}));
        assert_eq!(catalog.peek(), Some(first.clone()));

        // The backend has recovered, but the snapshot stays as first built.
        let second = catalog
            .get_or_build(&registry, &client, Duration::from_secs(2))
            .await;
        assert_eq!(first, second);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
