//! Audit writer: one synchronous row per terminal outcome, written before
//! the caller sees a response. Redaction happens here, not in callers, so a
//! forgotten call site cannot leak.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;
use uuid::Uuid;

pub mod redact;

#[derive(Debug)]
pub enum AuditError {
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Timeout => write!(f, "audit write timed out"),
            AuditError::Sqlx(err) => write!(f, "audit sql error: {}", err),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<sqlx::Error> for AuditError {
    fn from(value: sqlx::Error) -> Self {
        AuditError::Sqlx(value)
    }
}

/// Everything the writer needs to persist one terminal outcome. `inputs`
/// and `outputs` are the raw payloads; the writer derives the redacted
/// copies itself.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub request_id: Uuid,
    pub external_user_id: String,
    pub role: String,
    pub tool_name: String,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub decision: String,
    pub rule_ids: Vec<String>,
    pub constraints: serde_json::Value,
    pub latency_ms: i64,
    pub row_count: Option<i64>,
    pub error: Option<String>,
}

/// A persisted audit row, as re-read for request-id rendezvous.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub log_id: String,
    pub request_id: Uuid,
    pub tool_name: String,
    pub decision: String,
    pub rule_ids: Vec<String>,
    pub constraints: serde_json::Value,
    pub outputs_redacted: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditWriter {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl AuditWriter {
    pub fn new(pool: sqlx::PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, AuditError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(4).connect(db_url),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;

        Ok(Self::new(pool, write_timeout))
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, AuditError> {
        let writer = Self::connect(db_url, write_timeout).await?;
        writer.migrate().await?;
        Ok(writer)
    }

    pub async fn migrate(&self) -> Result<(), AuditError> {
        tokio::time::timeout(Duration::from_secs(30), migrate(&self.pool))
            .await
            .map_err(|_| AuditError::Timeout)??;
        Ok(())
    }

    /// Persist one terminal outcome. SQL query text inside `inputs` is kept
    /// verbatim in the redacted copy (the query is the evidence); every
    /// other string field goes through the PII scrubber.
    pub async fn record(&self, event: &AuditEvent) -> Result<String, AuditError> {
        let log_id = Ulid::new().to_string();

        // Only run_sql keeps its query text in the clear; a doc-search query
        // string is ordinary user input and goes through the scrubber.
        let preserve: &[&str] = if event.tool_name == "run_sql" {
            &["query"]
        } else {
            &[]
        };
        let inputs_redacted = redact::redact_value_preserving(&event.inputs, preserve);
        let outputs_redacted = redact::redact_value(&event.outputs);
        let error_redacted = event.error.as_deref().map(redact::redact_text);

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO internal.audit_logs (log_id, request_id, external_user_id, user_role, tool_name, inputs, inputs_redacted, outputs, outputs_redacted, decision, rule_ids, constraints, latency_ms, row_count, error_message) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            )
            .bind(&log_id)
            .bind(event.request_id)
            .bind(&event.external_user_id)
            .bind(&event.role)
            .bind(&event.tool_name)
            .bind(&event.inputs)
            .bind(&inputs_redacted)
            .bind(&event.outputs)
            .bind(&outputs_redacted)
            .bind(&event.decision)
            .bind(&event.rule_ids)
            .bind(&event.constraints)
            .bind(event.latency_ms)
            .bind(event.row_count)
            .bind(&error_redacted)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;

        Ok(log_id)
    }

    /// Most recent audit row for a request id, if any. Used to answer a
    /// duplicate arrival after the first caller already finished.
    pub async fn find_by_request_id(
        &self,
        request_id: Uuid,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT log_id, request_id, tool_name, decision, rule_ids, constraints, outputs_redacted, error_message, created_at FROM internal.audit_logs WHERE request_id = $1 ORDER BY created_at DESC, log_id DESC LIMIT 1",
            )
            .bind(request_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| AuditError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(AuditRecord {
            log_id: row.try_get("log_id")?,
            request_id: row.try_get("request_id")?,
            tool_name: row.try_get("tool_name")?,
            decision: row.try_get("decision")?,
            rule_ids: row.try_get("rule_ids")?,
            constraints: row.try_get("constraints")?,
            outputs_redacted: row.try_get("outputs_redacted")?,
            error: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
