//! DB-backed approval state machine tests. Skipped unless
//! `DATAGATE_TEST_DB_URL` (or `DATABASE_URL`) points at a Postgres with the
//! migrations applied; each test works on its own UUIDs so a shared
//! database stays usable.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use datagate_approvals::{ApprovalStore, DecideOutcome, NewApproval};
use datagate_contracts::ApprovalStatus;

fn test_db_url() -> Option<String> {
    std::env::var("DATAGATE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn connect_store() -> Option<ApprovalStore> {
    let db_url = test_db_url()?;
    let pool = sqlx::PgPool::connect(&db_url)
        .await
        .expect("test database should be reachable");
    datagate_audit::migrate(&pool)
        .await
        .expect("migrations should apply");
    Some(ApprovalStore::new(pool, Duration::from_secs(2)))
}

fn new_approval<'a>(
    approval_id: Uuid,
    request_id: Uuid,
    frozen: &'a serde_json::Value,
    rule_ids: &'a [String],
    expires_in: TimeDelta,
) -> NewApproval<'a> {
    NewApproval {
        approval_id,
        request_id,
        external_user_id: "U006ANALYST",
        role: "data_analyst",
        tool_name: "run_sql",
        frozen_inputs: frozen,
        frozen_decision_input: frozen,
        reason: "Access to raw schema requires admin approval",
        rule_ids,
        signed_token: "v1.0.deadbeef",
        token_expires_at: Utc::now() + expires_in,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decide_is_idempotent_after_terminal_status() {
    let Some(store) = connect_store().await else {
        eprintln!("skipping approval store test; set DATAGATE_TEST_DB_URL to enable");
        return;
    };

    let approval_id = Uuid::new_v4();
    let frozen = serde_json::json!({"query": "SELECT 1"});
    let rule_ids = vec!["approval.sensitive_schema".to_string()];
    store
        .create(&new_approval(
            approval_id,
            Uuid::new_v4(),
            &frozen,
            &rule_ids,
            TimeDelta::hours(1),
        ))
        .await
        .expect("create should succeed");

    let first = store
        .decide(approval_id, ApprovalStatus::Approved, "U007ADMIN", "approve", None)
        .await
        .expect("first decide should succeed");
    assert_eq!(first, DecideOutcome::Applied);

    let second = store
        .decide(approval_id, ApprovalStatus::Denied, "U007ADMIN", "deny", Some("late"))
        .await
        .expect("second decide should succeed");
    assert_eq!(
        second,
        DecideOutcome::AlreadyDecided(ApprovalStatus::Approved)
    );

    let row = store.fetch(approval_id).await.expect("fetch should succeed");
    assert_eq!(row.status, ApprovalStatus::Approved);
    assert_eq!(row.approver_external_id.as_deref(), Some("U007ADMIN"));
    assert!(row.decided_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_expires_only_lapsed_pending_rows() {
    let Some(store) = connect_store().await else {
        eprintln!("skipping approval store test; set DATAGATE_TEST_DB_URL to enable");
        return;
    };

    let lapsed_id = Uuid::new_v4();
    let fresh_id = Uuid::new_v4();
    let frozen = serde_json::json!({"query": "SELECT 1"});
    let rule_ids = vec!["approval.sensitive_schema".to_string()];

    store
        .create(&new_approval(
            lapsed_id,
            Uuid::new_v4(),
            &frozen,
            &rule_ids,
            TimeDelta::seconds(-5),
        ))
        .await
        .expect("create lapsed row");
    store
        .create(&new_approval(
            fresh_id,
            Uuid::new_v4(),
            &frozen,
            &rule_ids,
            TimeDelta::hours(1),
        ))
        .await
        .expect("create fresh row");

    let expired = store.sweep().await.expect("sweep should succeed");
    assert!(expired.iter().any(|r| r.approval_id == lapsed_id));
    assert!(!expired.iter().any(|r| r.approval_id == fresh_id));

    let lapsed = store.fetch(lapsed_id).await.expect("fetch lapsed");
    assert_eq!(lapsed.status, ApprovalStatus::Expired);

    let fresh = store.fetch(fresh_id).await.expect("fetch fresh");
    assert_eq!(fresh.status, ApprovalStatus::Pending);

    // An expired row is terminal; a late approval reports it back.
    let late = store
        .decide(lapsed_id, ApprovalStatus::Approved, "U007ADMIN", "approve", None)
        .await
        .expect("late decide should succeed");
    assert_eq!(late, DecideOutcome::AlreadyDecided(ApprovalStatus::Expired));
}
