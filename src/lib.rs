//! LLMSee - a transparent, auditing reverse proxy for LLM APIs
//!
//! The proxy sits in front of any number of OpenAI-compatible backends and
//! provides:
//!
//! - **Passthrough routing**: `/{backend}/...` forwards to a configured backend
//! - **Unified endpoint**: `/v1/...` picks the backend from `"model": "backend:model"`
//! - **Aggregated model list**: `/v1/models` merges every backend's models
//! - **Auditing**: every call is stored in SQLite, with streamed responses
//!   reconstructed into a single readable document
//! - **Live updates**: `/ui/sse` pushes audit inserts and updates to dashboards
//!
//! # Architecture
//!
//! - [`core`]: configuration, storage, errors, decoding, metrics, middleware
//! - [`services`]: backend registry, model cache, event hub
//! - [`api`]: HTTP handlers and the proxy engine
//!
//! # Configuration
//!
//! A JSON file (`llmsee.json`) found via `-c`, `LLMSEE_CONFIGFILE` or the OS
//! config directory. Environment overrides:
//! - `LLMSEE_HOST`: bind address (default: localhost)
//! - `LLMSEE_PORT`: port (default: 5050)
//! - `LLMSEE_DATABASEFILE`: audit database path
//! - `LLMSEE_LOCALHOST`: host of the default `ollama` backend

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppConfig, AppError, AuditLog, LogRecord, Result, SqliteAuditLog};
pub use services::{EventHub, ModelCatalog, ProviderRegistry};
