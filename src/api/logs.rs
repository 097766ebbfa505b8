//! Read access to the audit log.

use crate::api::handlers::AppState;
use crate::core::database::{LogPage, LogRecord};
use crate::core::error::{AppError, Result};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    pub id: Option<String>,
}

/// `GET /log?page=N`: newest-first summaries. A missing or malformed page
/// means page 1; out-of-range pages are clamped.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<LogPage>> {
    let page = query
        .page
        .and_then(|p| p.trim().parse::<i64>().ok())
        .unwrap_or(1);

    let logs = state.audit_store.list(page, state.config.page_size).await?;
    Ok(Json(logs))
}

/// `GET /log/detail?id=N`: one full record.
pub async fn log_detail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DetailQuery>,
) -> Result<Json<LogRecord>> {
    let id = query
        .id
        .and_then(|id| id.trim().parse::<i64>().ok())
        .filter(|id| *id >= 0)
        .ok_or(AppError::InvalidLogId)?;

    state
        .audit_store
        .detail(id)
        .await?
        .map(Json)
        .ok_or(AppError::LogNotFound(id))
}
