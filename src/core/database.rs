//! Audit log persistence.
//!
//! Every proxied call is recorded in a SQLite `logs` table: inserted with
//! sentinel response fields before dispatch, updated once when the call
//! reaches a terminal state. Records are never deleted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Response status of a record whose call has not finished yet.
pub const PENDING_STATUS: i64 = -1;

/// Duration of a record whose call has not finished yet.
pub const PENDING_DURATION: i64 = -1;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        provider TEXT NOT NULL,
        method TEXT NOT NULL,
        model TEXT NOT NULL,
        target_url TEXT NOT NULL,
        request_headers TEXT NOT NULL DEFAULT '',
        request_body TEXT NOT NULL DEFAULT '',
        response_status INTEGER NOT NULL DEFAULT -1,
        response_headers TEXT NOT NULL DEFAULT '',
        response_body TEXT NOT NULL DEFAULT '',
        useragent TEXT NOT NULL DEFAULT '',
        duration_ms INTEGER NOT NULL DEFAULT -1
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_timestamp ON logs(timestamp)",
];

/// One audited call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LogRecord {
    pub id: i64,
    /// RFC 3339, UTC
    pub timestamp: String,
    #[serde(rename = "provider")]
    #[sqlx(rename = "provider")]
    pub backend: String,
    pub method: String,
    pub model: String,
    pub target_url: String,
    /// JSON object of header name to list of values
    pub request_headers: String,
    pub request_body: String,
    pub request_body_size: i64,
    pub response_status: i64,
    pub response_headers: String,
    pub response_body: String,
    pub response_body_size: i64,
    #[serde(rename = "useragent")]
    #[sqlx(rename = "useragent")]
    pub user_agent: String,
    pub duration_ms: i64,
}

impl Default for LogRecord {
    fn default() -> Self {
        Self {
            id: 0,
            timestamp: String::new(),
            backend: String::new(),
            method: String::new(),
            model: String::new(),
            target_url: String::new(),
            request_headers: String::new(),
            request_body: String::new(),
            request_body_size: 0,
            response_status: PENDING_STATUS,
            response_headers: String::new(),
            response_body: String::new(),
            response_body_size: 0,
            user_agent: String::new(),
            duration_ms: PENDING_DURATION,
        }
    }
}

impl LogRecord {
    pub fn is_pending(&self) -> bool {
        self.response_status == PENDING_STATUS
    }
}

/// Row of the paged `/log` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LogSummary {
    pub id: i64,
    pub timestamp: String,
    pub provider: String,
    pub method: String,
    pub model: String,
    pub request_body_size: i64,
    pub response_body_size: i64,
    pub response_status: i64,
    pub useragent: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub logs: Vec<LogSummary>,
    pub total_pages: i64,
    pub current_page: i64,
    pub total_logs: i64,
}

/// Clamp a requested page number into `[1, total_pages]`.
pub fn clamp_page(requested: i64, total_pages: i64) -> i64 {
    requested.clamp(1, total_pages.max(1))
}

/// Number of pages needed for `total` rows.
pub fn page_count(total: i64, page_size: u32) -> i64 {
    let page_size = i64::from(page_size.max(1));
    (total + page_size - 1) / page_size
}

/// Storage for audit records.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Store a pending record and return its assigned id.
    async fn insert(&self, record: &LogRecord) -> Result<i64, sqlx::Error>;

    /// Write the terminal response fields of an existing record.
    async fn update(&self, record: &LogRecord) -> Result<(), sqlx::Error>;

    /// Newest-first page of summaries; `page` is clamped into range.
    async fn list(&self, page: i64, page_size: u32) -> Result<LogPage, sqlx::Error>;

    async fn detail(&self, id: i64) -> Result<Option<LogRecord>, sqlx::Error>;
}

/// SQLite-backed [`AuditLog`].
#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn connect(path: &Path) -> Result<Self, sqlx::Error> {
        tracing::info!("Database file {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a fresh database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn insert(&self, record: &LogRecord) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO logs (
                timestamp, provider, method, model, target_url,
                request_headers, request_body, response_status,
                response_headers, response_body, useragent, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.timestamp)
        .bind(&record.backend)
        .bind(&record.method)
        .bind(&record.model)
        .bind(&record.target_url)
        .bind(&record.request_headers)
        .bind(&record.request_body)
        .bind(record.response_status)
        .bind(&record.response_headers)
        .bind(&record.response_body)
        .bind(&record.user_agent)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update(&self, record: &LogRecord) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE logs SET
                response_status = ?,
                response_headers = ?,
                response_body = ?,
                duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(record.response_status)
        .bind(&record.response_headers)
        .bind(&record.response_body)
        .bind(record.duration_ms)
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn list(&self, page: i64, page_size: u32) -> Result<LogPage, sqlx::Error> {
        let total_logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;

        let total_pages = page_count(total_logs, page_size);
        let current_page = clamp_page(page, total_pages);
        let limit = i64::from(page_size.max(1));
        let offset = (current_page - 1) * limit;

        let logs = sqlx::query_as::<_, LogSummary>(
            r#"
            SELECT
                id,
                timestamp,
                provider,
                method,
                model,
                length(CAST(request_body AS BLOB)) AS request_body_size,
                length(CAST(response_body AS BLOB)) AS response_body_size,
                response_status,
                useragent,
                duration_ms
            FROM logs
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(LogPage {
            logs,
            total_pages,
            current_page,
            total_logs,
        })
    }

    async fn detail(&self, id: i64) -> Result<Option<LogRecord>, sqlx::Error> {
        sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT
                id, timestamp, provider, method, model, target_url,
                request_headers, request_body,
                length(CAST(request_body AS BLOB)) AS request_body_size,
                response_status, response_headers, response_body,
                length(CAST(response_body AS BLOB)) AS response_body_size,
                useragent, duration_ms
            FROM logs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }
}
