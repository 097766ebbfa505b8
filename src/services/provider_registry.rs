//! Read-only table of backends the proxy can forward to.
//!
//! Built once from configuration. Disabled backends and backends whose id
//! collides with a server route are left out, so they are never resolvable.

use crate::core::config::{AppConfig, BackendConfig, RESERVED_BACKEND_IDS};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable backend lookup keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    backends: BTreeMap<String, Arc<BackendConfig>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_backends(config.providers.values().cloned())
    }

    pub fn from_backends(backends: impl IntoIterator<Item = BackendConfig>) -> Self {
        let mut table = BTreeMap::new();
        for backend in backends {
            if !backend.is_enabled() {
                tracing::debug!(backend = %backend.id, "Backend disabled, skipping");
                continue;
            }
            if RESERVED_BACKEND_IDS.contains(&backend.id.as_str()) {
                tracing::warn!(backend = %backend.id, "Backend id is reserved, skipping");
                continue;
            }
            if backend.base_url.is_empty() {
                tracing::warn!(backend = %backend.id, "Backend has no base URL, skipping");
                continue;
            }
            table.insert(backend.id.clone(), Arc::new(backend));
        }
        Self { backends: table }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BackendConfig>> {
        self.backends.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// Backends in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendConfig>> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Log the configured backends at startup.
    pub fn log_backends(&self) {
        tracing::info!("Loaded {} backends", self.backends.len());
        for backend in self.backends.values() {
            tracing::info!(
                "  - {} -> {} (static key: {}, fixed models: {})",
                backend.id,
                backend.base_url,
                backend.credential().is_some(),
                backend.models.as_ref().map_or(0, Vec::len)
            );
        }
    }
}
