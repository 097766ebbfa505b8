//! Shared state services behind the HTTP layer.
//!
//! - Backend registry
//! - Aggregated model list cache
//! - Live update broadcast hub

pub mod event_hub;
pub mod model_catalog;
pub mod provider_registry;

// Re-export commonly used types
pub use event_hub::{BroadcastEvent, EventHub, EventType, Subscription};
pub use model_catalog::ModelCatalog;
pub use provider_registry::ProviderRegistry;
