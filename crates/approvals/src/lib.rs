//! Approval persistence and state machine. Rows live in
//! `internal.approval_requests`; transitions out of `pending` go through an
//! optimistic compare-and-set on the status column, so concurrent approver
//! submissions serialize in the database and the loser sees the recorded
//! outcome instead of overwriting it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use datagate_contracts::ApprovalStatus;

pub mod token;

#[derive(Debug)]
pub enum ApprovalError {
    Timeout,
    NotFound,
    Corrupt(String),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalError::Timeout => write!(f, "approval store operation timed out"),
            ApprovalError::NotFound => write!(f, "approval request not found"),
            ApprovalError::Corrupt(detail) => write!(f, "approval row is corrupt: {}", detail),
            ApprovalError::Sqlx(err) => write!(f, "approval sql error: {}", err),
        }
    }
}

impl std::error::Error for ApprovalError {}

impl From<sqlx::Error> for ApprovalError {
    fn from(value: sqlx::Error) -> Self {
        ApprovalError::Sqlx(value)
    }
}

/// Full approval row.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub external_user_id: String,
    pub role: String,
    pub tool_name: String,
    pub frozen_inputs: serde_json::Value,
    pub frozen_decision_input: serde_json::Value,
    pub reason: String,
    pub rule_ids: Vec<String>,
    pub status: ApprovalStatus,
    pub approver_external_id: Option<String>,
    pub approver_decision: Option<String>,
    pub approver_reason: Option<String>,
    pub signed_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

pub struct NewApproval<'a> {
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub external_user_id: &'a str,
    pub role: &'a str,
    pub tool_name: &'a str,
    pub frozen_inputs: &'a serde_json::Value,
    pub frozen_decision_input: &'a serde_json::Value,
    pub reason: &'a str,
    pub rule_ids: &'a [String],
    pub signed_token: &'a str,
    pub token_expires_at: DateTime<Utc>,
}

/// Result of a terminal-transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecideOutcome {
    Applied,
    /// The row was already terminal; the recorded status is returned so
    /// re-submission is idempotent.
    AlreadyDecided(ApprovalStatus),
}

#[derive(Clone)]
pub struct ApprovalStore {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl ApprovalStore {
    pub fn new(pool: sqlx::PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub async fn create(&self, approval: &NewApproval<'_>) -> Result<(), ApprovalError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO internal.approval_requests (approval_id, request_id, external_user_id, user_role, tool_name, frozen_inputs, frozen_decision_input, reason, rule_ids, status, signed_token, token_expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11)",
            )
            .bind(approval.approval_id)
            .bind(approval.request_id)
            .bind(approval.external_user_id)
            .bind(approval.role)
            .bind(approval.tool_name)
            .bind(approval.frozen_inputs)
            .bind(approval.frozen_decision_input)
            .bind(approval.reason)
            .bind(approval.rule_ids)
            .bind(approval.signed_token)
            .bind(approval.token_expires_at)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| ApprovalError::Timeout)??;

        Ok(())
    }

    pub async fn fetch(&self, approval_id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT approval_id, request_id, external_user_id, user_role, tool_name, frozen_inputs, frozen_decision_input, reason, rule_ids, status, approver_external_id, approver_decision, approver_reason, signed_token, token_expires_at, created_at, decided_at FROM internal.approval_requests WHERE approval_id = $1",
            )
            .bind(approval_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| ApprovalError::Timeout)??;

        row.map(decode_row).ok_or(ApprovalError::NotFound)?
    }

    /// Attempt the `pending -> approved|denied` transition. Terminal rows
    /// are left untouched and reported back.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        approver_external_id: &str,
        approver_decision: &str,
        approver_reason: Option<&str>,
    ) -> Result<DecideOutcome, ApprovalError> {
        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "UPDATE internal.approval_requests SET status = $2, approver_external_id = $3, approver_decision = $4, approver_reason = $5, decided_at = now() WHERE approval_id = $1 AND status = 'pending'",
            )
            .bind(approval_id)
            .bind(status.as_str())
            .bind(approver_external_id)
            .bind(approver_decision)
            .bind(approver_reason)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| ApprovalError::Timeout)??;

        if result.rows_affected() == 1 {
            return Ok(DecideOutcome::Applied);
        }

        let current = self.fetch(approval_id).await?;
        Ok(DecideOutcome::AlreadyDecided(current.status))
    }

    /// Latest approval row created for a request id, if any. Serves
    /// duplicate tool-call arrivals that need the pending approval's id and
    /// expiry back.
    pub async fn find_by_request_id(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, ApprovalError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT approval_id, request_id, external_user_id, user_role, tool_name, frozen_inputs, frozen_decision_input, reason, rule_ids, status, approver_external_id, approver_decision, approver_reason, signed_token, token_expires_at, created_at, decided_at FROM internal.approval_requests WHERE request_id = $1 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(request_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| ApprovalError::Timeout)??;

        row.map(decode_row).transpose()
    }

    /// Expire pending rows whose token has lapsed, returning them so the
    /// caller can write the `approval.expired` audit entries.
    pub async fn sweep(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "UPDATE internal.approval_requests SET status = 'expired', decided_at = now() WHERE status = 'pending' AND token_expires_at < now() RETURNING approval_id, request_id, external_user_id, user_role, tool_name, frozen_inputs, frozen_decision_input, reason, rule_ids, status, approver_external_id, approver_decision, approver_reason, signed_token, token_expires_at, created_at, decided_at",
            )
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| ApprovalError::Timeout)??;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row(row: PgRow) -> Result<ApprovalRequest, ApprovalError> {
    let status_raw: String = row.try_get("status")?;
    let status = ApprovalStatus::parse(&status_raw)
        .ok_or_else(|| ApprovalError::Corrupt(format!("unknown status {}", status_raw)))?;

    Ok(ApprovalRequest {
        approval_id: row.try_get("approval_id")?,
        request_id: row.try_get("request_id")?,
        external_user_id: row.try_get("external_user_id")?,
        role: row.try_get("user_role")?,
        tool_name: row.try_get("tool_name")?,
        frozen_inputs: row.try_get("frozen_inputs")?,
        frozen_decision_input: row.try_get("frozen_decision_input")?,
        reason: row.try_get("reason")?,
        rule_ids: row.try_get("rule_ids")?,
        status,
        approver_external_id: row.try_get("approver_external_id")?,
        approver_decision: row.try_get("approver_decision")?,
        approver_reason: row.try_get("approver_reason")?,
        signed_token: row.try_get("signed_token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        created_at: row.try_get("created_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}
