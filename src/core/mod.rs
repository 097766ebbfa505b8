//! Core functionality for the proxy server.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Audit storage
//! - Error handling and content decoding
//! - Metrics, logging and HTTP middleware

pub mod config;
pub mod database;
pub mod decoder;
pub mod dialect;
pub mod error;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod middleware;

// Re-export commonly used types
pub use config::{AppConfig, BackendConfig, BodyQuirks};
pub use database::{AuditLog, LogPage, LogRecord, LogSummary, SqliteAuditLog};
pub use decoder::{decode, ContentEncoding, DecodeError};
pub use error::{AppError, Result};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{cors_middleware, BackendName, MetricsMiddleware};
