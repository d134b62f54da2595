//! HTTP surface and request orchestration. Per call:
//! Received → Analyzed → Decided → (Executed | Suspended | Refused) →
//! Logged → Responded, with the audit write strictly before the response.
//! Only a malformed envelope or an unknown identity escape auditing — there
//! is no authenticated subject to log.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use datagate_approvals::{ApprovalStore, DecideOutcome, token};
use datagate_audit::{AuditError, AuditEvent, AuditRecord, AuditWriter};
use datagate_contracts::{
    ApprovalStatus, Constraints, Decision, DecisionInput, Identity, Role, ToolCallEnvelope,
    ToolName,
};
use datagate_executor::{ExecError, Executor, ExecutorConfig, ToolInputs, parse_inputs};
use datagate_policy::{BundleHandle, PolicyBundle, evaluate, evaluate_without_approval};
use datagate_sqlscan::{QueryFacts, analyze};

use crate::config::{GatewayConfig, StartupError};
use crate::identity::IdentityStore;
use crate::metrics;
use crate::rendezvous::{Claim, Rendezvous, SharedOutcome, wait};

const RULE_ANALYZER_PARSE_ERROR: &str = "analyzer.parse_error";
const RULE_APPROVAL_EXPIRED: &str = "approval.expired";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub policy: BundleHandle,
    pub audit: AuditWriter,
    pub approvals: ApprovalStore,
    executor: Executor,
    identities: IdentityStore,
    rendezvous: Rendezvous,
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn json_error(status: StatusCode, code: &str, message: String) -> ApiError {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message,
        }),
    )
}

pub async fn build(config: GatewayConfig) -> Result<(Router, AppState), StartupError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max_connections)
        .acquire_timeout(config.pool_acquire_timeout)
        .connect(&config.db_url)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to connect to the database".to_string(),
        })?;

    datagate_audit::migrate(&pool).await.map_err(|err| StartupError {
        code: "ERR_DB_MIGRATE",
        message: format!("failed to apply migrations: {}", err),
    })?;

    let policy = match config.policy_bundle_path.as_deref() {
        Some(path) => BundleHandle::load(path).map_err(|err| StartupError {
            code: "policy.bundle_invalid",
            message: err.message,
        })?,
        None => BundleHandle::new(PolicyBundle::builtin()),
    };

    let audit = AuditWriter::new(pool.clone(), config.audit_write_timeout);
    let approvals = ApprovalStore::new(pool.clone(), config.audit_write_timeout);
    let executor = Executor::new(
        pool.clone(),
        ExecutorConfig {
            statement_timeout: config.statement_timeout,
            call_timeout: config.executor_timeout,
            default_max_rows: config.max_rows,
            privileged_max_rows: config.max_rows_privileged,
            chart_dir: config.chart_dir.clone(),
        },
    );
    let identities = IdentityStore::new(pool);

    let state = AppState {
        config,
        policy,
        audit,
        approvals,
        executor,
        identities,
        rendezvous: Rendezvous::new(),
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/v1/tool_calls", post(handle_tool_call))
        .route("/v1/approvals/callback", post(handle_approval_callback))
        .with_state(state.clone());

    Ok((router, state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint() -> Result<([(&'static str, String); 1], Vec<u8>), ApiError> {
    let (buffer, content_type) = metrics::render().map_err(|err| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal.metrics",
            err.to_string(),
        )
    })?;
    Ok(([("content-type", content_type)], buffer))
}

fn decision_body(
    reason: &str,
    rule_ids: &[String],
    constraints: &Constraints,
) -> serde_json::Value {
    serde_json::json!({
        "reason": reason,
        "rule_ids": rule_ids,
        "constraints": constraints,
    })
}

async fn handle_tool_call(
    State(state): State<AppState>,
    req: Result<Json<ToolCallEnvelope>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let result = tool_call_inner(&state, req).await;
    let status = match &result {
        Ok((status, _)) => status.as_u16(),
        Err((status, _)) => status.as_u16(),
    };
    metrics::observe_http_request("/v1/tool_calls", status);
    result
}

async fn tool_call_inner(
    state: &AppState,
    req: Result<Json<ToolCallEnvelope>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let Json(envelope) = req.map_err(|err| {
        json_error(
            StatusCode::BAD_REQUEST,
            "envelope.malformed",
            format!("invalid tool-call envelope: {}", err),
        )
    })?;

    let Some(tool) = ToolName::parse(&envelope.tool_name) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "envelope.malformed",
            format!("unknown tool {}", envelope.tool_name),
        ));
    };

    let inputs = parse_inputs(tool, &envelope.inputs).map_err(|err| {
        json_error(StatusCode::BAD_REQUEST, "envelope.malformed", err.to_string())
    })?;

    let identity = state
        .identities
        .find(&envelope.external_user_id)
        .await
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.db_error",
                format!("identity lookup failed: {}", err),
            )
        })?
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "identity.unknown",
                format!("unknown identity {}", envelope.external_user_id),
            )
        })?;

    // Concurrent arrivals with the same request_id collapse onto one
    // execution; stragglers after completion are answered from the log.
    let guard = match state.rendezvous.claim(envelope.request_id) {
        Claim::Owner(guard) => guard,
        Claim::Follower(receiver) => {
            if let Some(outcome) = wait(receiver).await {
                let status = StatusCode::from_u16(outcome.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok((status, Json(outcome.body)));
            }
            return respond_from_audit_log(state, envelope.request_id).await;
        }
    };

    if let Some(record) = state
        .audit
        .find_by_request_id(envelope.request_id)
        .await
        .map_err(audit_read_error)?
    {
        let response = reconstruct_response(state, &record).await?;
        return Ok(finish(guard, response));
    }

    let response = process_tool_call(state, &envelope, tool, identity, inputs).await?;
    Ok(finish(guard, response))
}

fn finish(guard: crate::rendezvous::CompletionGuard, response: ApiResponse) -> ApiResponse {
    guard.complete(SharedOutcome {
        status: response.0.as_u16(),
        body: response.1.0.clone(),
    });
    response
}

async fn respond_from_audit_log(
    state: &AppState,
    request_id: Uuid,
) -> Result<ApiResponse, ApiError> {
    let record = state
        .audit
        .find_by_request_id(request_id)
        .await
        .map_err(audit_read_error)?
        .ok_or_else(|| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.rendezvous_lost",
                "duplicate request lost its owner before an outcome was recorded".to_string(),
            )
        })?;
    reconstruct_response(state, &record).await
}

fn audit_read_error(err: AuditError) -> ApiError {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal.db_error",
        format!("audit log read failed: {}", err),
    )
}

/// Rebuild a client response from the persisted audit row. Duplicates see
/// the redacted output copy, which is also what the first caller saw for
/// masked columns.
async fn reconstruct_response(
    state: &AppState,
    record: &AuditRecord,
) -> Result<ApiResponse, ApiError> {
    let reason = record.error.clone().unwrap_or_default();
    let decision = decision_body(
        &reason,
        &record.rule_ids,
        &serde_json::from_value(record.constraints.clone()).unwrap_or_default(),
    );

    let body = match record.decision.as_str() {
        "ALLOW" => serde_json::json!({
            "status": "allow",
            "request_id": record.request_id,
            "decision": decision,
            "result": record.outputs_redacted,
        }),
        "REQUIRE_APPROVAL" => {
            let approval = state
                .approvals
                .find_by_request_id(record.request_id)
                .await
                .map_err(|err| {
                    json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal.db_error",
                        err.to_string(),
                    )
                })?;
            match approval {
                Some(approval) => serde_json::json!({
                    "status": "pending",
                    "request_id": record.request_id,
                    "decision": decision,
                    "approval_id": approval.approval_id,
                    "expires_at": approval.token_expires_at,
                }),
                None => serde_json::json!({
                    "status": "pending",
                    "request_id": record.request_id,
                    "decision": decision,
                }),
            }
        }
        _ => serde_json::json!({
            "status": "deny",
            "request_id": record.request_id,
            "decision": decision,
        }),
    };

    Ok((StatusCode::OK, Json(body)))
}

async fn process_tool_call(
    state: &AppState,
    envelope: &ToolCallEnvelope,
    tool: ToolName,
    identity: Identity,
    inputs: ToolInputs,
) -> Result<ApiResponse, ApiError> {
    let started = Instant::now();
    let role = identity.role;
    let region = identity.region;

    // Analyzed: SQL calls contribute structural facts to the decision
    // input; a parse failure is a terminal DENY.
    let facts: Option<QueryFacts> = match &inputs {
        ToolInputs::RunSql(sql) => match analyze(&sql.query) {
            Ok(facts) => Some(facts),
            Err(err) => {
                let reason = format!("query could not be analyzed: {}", err.message);
                let rule_ids = vec![RULE_ANALYZER_PARSE_ERROR.to_string()];
                write_audit(
                    state,
                    AuditEvent {
                        request_id: envelope.request_id,
                        external_user_id: identity.external_user_id.clone(),
                        role: role.as_str().to_string(),
                        tool_name: tool.as_str().to_string(),
                        inputs: envelope.inputs.clone(),
                        outputs: serde_json::json!({}),
                        decision: Decision::Deny.as_str().to_string(),
                        rule_ids: rule_ids.clone(),
                        constraints: serde_json::json!({}),
                        latency_ms: started.elapsed().as_millis() as i64,
                        row_count: None,
                        error: Some(reason.clone()),
                    },
                )
                .await?;
                metrics::observe_decision(Decision::Deny.as_str());

                return Ok((
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "status": "deny",
                        "request_id": envelope.request_id,
                        "decision": decision_body(&reason, &rule_ids, &Constraints::default()),
                    })),
                ));
            }
        },
        _ => None,
    };

    let decision_input = build_decision_input(&identity, tool, &inputs, facts.as_ref());

    // Decided.
    let bundle = state.policy.current();
    let verdict = evaluate(&bundle, &decision_input);
    metrics::observe_decision(verdict.decision.as_str());

    tracing::info!(
        request_id = %envelope.request_id,
        external_user_id = %identity.external_user_id,
        role = %role.as_str(),
        tool = %tool.as_str(),
        decision = %verdict.decision.as_str(),
        rule_ids = ?verdict.rule_ids,
        "gateway.tool_call"
    );

    match verdict.decision {
        Decision::Deny => {
            write_audit(
                state,
                AuditEvent {
                    request_id: envelope.request_id,
                    external_user_id: identity.external_user_id.clone(),
                    role: role.as_str().to_string(),
                    tool_name: tool.as_str().to_string(),
                    inputs: envelope.inputs.clone(),
                    outputs: serde_json::json!({}),
                    decision: Decision::Deny.as_str().to_string(),
                    rule_ids: verdict.rule_ids.clone(),
                    constraints: serde_json::json!({}),
                    latency_ms: started.elapsed().as_millis() as i64,
                    row_count: None,
                    error: Some(verdict.reason.clone()),
                },
            )
            .await?;

            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "deny",
                    "request_id": envelope.request_id,
                    "decision": decision_body(&verdict.reason, &verdict.rule_ids, &Constraints::default()),
                })),
            ))
        }
        Decision::RequireApproval => {
            suspend_for_approval(state, envelope, tool, &identity, &decision_input, &verdict, started)
                .await
        }
        Decision::Allow => {
            execute_and_respond(
                state,
                envelope.request_id,
                &envelope.inputs,
                tool,
                &identity,
                &inputs,
                facts.as_ref(),
                &verdict.rule_ids,
                &verdict.constraints,
                &verdict.reason,
                started,
            )
            .await
        }
    }
}

fn build_decision_input(
    identity: &Identity,
    tool: ToolName,
    inputs: &ToolInputs,
    facts: Option<&QueryFacts>,
) -> DecisionInput {
    let mut input = DecisionInput::for_tool(
        identity.role.as_str(),
        identity.region.map(|r| r.as_str()),
        tool,
    );

    if let (ToolInputs::RunSql(sql), Some(facts)) = (inputs, facts) {
        input.tables = facts.tables.clone();
        input.columns = facts.columns.clone();
        input.query_type = Some(facts.query_type);
        input.has_limit = facts.has_limit;
        input.is_aggregate = facts.is_aggregate;
        input.row_count = sql.row_count;
    }

    input
}

#[allow(clippy::too_many_arguments)]
async fn suspend_for_approval(
    state: &AppState,
    envelope: &ToolCallEnvelope,
    tool: ToolName,
    identity: &Identity,
    decision_input: &DecisionInput,
    verdict: &datagate_contracts::DecisionOutput,
    started: Instant,
) -> Result<ApiResponse, ApiError> {
    let approval_id = Uuid::new_v4();
    let expires_at = Utc::now()
        + TimeDelta::from_std(state.config.approval_ttl).unwrap_or(TimeDelta::hours(24));
    let signed_token = token::mint(
        state.config.approval_token_secret.as_bytes(),
        approval_id,
        Role::Admin.as_str(),
        expires_at,
    );

    let frozen_decision_input = serde_json::to_value(decision_input).map_err(|err| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal.error",
            err.to_string(),
        )
    })?;

    state
        .approvals
        .create(&datagate_approvals::NewApproval {
            approval_id,
            request_id: envelope.request_id,
            external_user_id: &identity.external_user_id,
            role: identity.role.as_str(),
            tool_name: tool.as_str(),
            frozen_inputs: &envelope.inputs,
            frozen_decision_input: &frozen_decision_input,
            reason: &verdict.reason,
            rule_ids: &verdict.rule_ids,
            signed_token: &signed_token,
            token_expires_at: expires_at,
        })
        .await
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.db_error",
                format!("failed to persist approval request: {}", err),
            )
        })?;

    write_audit(
        state,
        AuditEvent {
            request_id: envelope.request_id,
            external_user_id: identity.external_user_id.clone(),
            role: identity.role.as_str().to_string(),
            tool_name: tool.as_str().to_string(),
            inputs: envelope.inputs.clone(),
            outputs: serde_json::json!({
                "approval_id": approval_id,
                "approval_type": verdict.constraints.approval_type,
            }),
            decision: Decision::RequireApproval.as_str().to_string(),
            rule_ids: verdict.rule_ids.clone(),
            constraints: serde_json::to_value(&verdict.constraints)
                .unwrap_or_else(|_| serde_json::json!({})),
            latency_ms: started.elapsed().as_millis() as i64,
            row_count: None,
            error: None,
        },
    )
    .await?;

    metrics::observe_approval("pending");
    tracing::info!(
        request_id = %envelope.request_id,
        approval_id = %approval_id,
        reason = %verdict.reason,
        "gateway.approval_pending"
    );

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "pending",
            "request_id": envelope.request_id,
            "decision": decision_body(&verdict.reason, &verdict.rule_ids, &verdict.constraints),
            "approval_id": approval_id,
            "expires_at": expires_at,
        })),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn execute_and_respond(
    state: &AppState,
    request_id: Uuid,
    raw_inputs: &serde_json::Value,
    tool: ToolName,
    identity: &Identity,
    inputs: &ToolInputs,
    facts: Option<&QueryFacts>,
    rule_ids: &[String],
    constraints: &Constraints,
    reason: &str,
    started: Instant,
) -> Result<ApiResponse, ApiError> {
    let executed = state
        .executor
        .execute(request_id, identity.role, identity.region, inputs, facts, constraints)
        .await;

    let constraints_json =
        serde_json::to_value(constraints).unwrap_or_else(|_| serde_json::json!({}));

    match executed {
        Ok(output) => {
            metrics::observe_tool_call(tool.as_str(), "success");
            metrics::observe_executor_latency(
                tool.as_str(),
                std::time::Duration::from_millis(output.latency_ms.max(0) as u64),
            );

            write_audit(
                state,
                AuditEvent {
                    request_id,
                    external_user_id: identity.external_user_id.clone(),
                    role: identity.role.as_str().to_string(),
                    tool_name: tool.as_str().to_string(),
                    inputs: raw_inputs.clone(),
                    outputs: output.output.clone(),
                    decision: Decision::Allow.as_str().to_string(),
                    rule_ids: rule_ids.to_vec(),
                    constraints: constraints_json,
                    latency_ms: output.latency_ms,
                    row_count: output.row_count,
                    error: None,
                },
            )
            .await?;

            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "allow",
                    "request_id": request_id,
                    "decision": decision_body(reason, rule_ids, constraints),
                    "result": output.output,
                })),
            ))
        }
        Err(err) => {
            metrics::observe_tool_call(tool.as_str(), "error");
            let (status, code) = map_exec_error(&err);

            write_audit(
                state,
                AuditEvent {
                    request_id,
                    external_user_id: identity.external_user_id.clone(),
                    role: identity.role.as_str().to_string(),
                    tool_name: tool.as_str().to_string(),
                    inputs: raw_inputs.clone(),
                    outputs: serde_json::json!({}),
                    decision: Decision::Allow.as_str().to_string(),
                    rule_ids: rule_ids.to_vec(),
                    constraints: constraints_json,
                    latency_ms: started.elapsed().as_millis() as i64,
                    row_count: None,
                    error: Some(format!("{}: {}", code, err)),
                },
            )
            .await?;

            tracing::warn!(
                request_id = %request_id,
                tool = %tool.as_str(),
                error_code = %code,
                "gateway.execution_failed"
            );

            Err(json_error(status, code, err.to_string()))
        }
    }
}

fn map_exec_error(err: &ExecError) -> (StatusCode, &'static str) {
    match err {
        ExecError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "executor.timeout"),
        ExecError::PoolExhausted => (StatusCode::SERVICE_UNAVAILABLE, "executor.pool_exhausted"),
        ExecError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "executor.db_error"),
        ExecError::BadInputs(_) => (StatusCode::BAD_REQUEST, "envelope.malformed"),
        ExecError::Artifact(_) => (StatusCode::INTERNAL_SERVER_ERROR, "executor.artifact_error"),
    }
}

/// Persist one audit row; a failure aborts the request with
/// `audit.write_failed` and the tool result is withheld.
async fn write_audit(state: &AppState, event: AuditEvent) -> Result<(), ApiError> {
    state.audit.record(&event).await.map_err(|err| {
        metrics::inc_audit_write_failure();
        tracing::error!(
            request_id = %event.request_id,
            error = %err,
            "gateway.audit_write_failed"
        );
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "audit.write_failed",
            "audit write failed; the result has been withheld".to_string(),
        )
    })?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApprovalCallbackRequest {
    approval_id: Uuid,
    approver_external_id: String,
    decision: String,
    #[serde(default)]
    reason: Option<String>,
    token: String,
}

async fn handle_approval_callback(
    State(state): State<AppState>,
    req: Result<Json<ApprovalCallbackRequest>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let result = approval_callback_inner(&state, req).await;
    let status = match &result {
        Ok((status, _)) => status.as_u16(),
        Err((status, _)) => status.as_u16(),
    };
    metrics::observe_http_request("/v1/approvals/callback", status);
    result
}

async fn approval_callback_inner(
    state: &AppState,
    req: Result<Json<ApprovalCallbackRequest>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let Json(req) = req.map_err(|err| {
        json_error(
            StatusCode::BAD_REQUEST,
            "envelope.malformed",
            format!("invalid approval callback: {}", err),
        )
    })?;

    let approve = match req.decision.as_str() {
        "approve" => true,
        "deny" => false,
        other => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "envelope.malformed",
                format!("decision must be approve or deny, not {}", other),
            ));
        }
    };

    let row = state.approvals.fetch(req.approval_id).await.map_err(|err| {
        match err {
            datagate_approvals::ApprovalError::NotFound => json_error(
                StatusCode::NOT_FOUND,
                "approval.token_invalid",
                "unknown approval request".to_string(),
            ),
            other => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.db_error",
                other.to_string(),
            ),
        }
    })?;

    let approver = state
        .identities
        .find(&req.approver_external_id)
        .await
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.db_error",
                format!("identity lookup failed: {}", err),
            )
        })?
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "identity.unknown",
                format!("unknown identity {}", req.approver_external_id),
            )
        })?;

    if let Err(err) = token::verify(
        state.config.approval_token_secret.as_bytes(),
        &req.token,
        req.approval_id,
        Role::Admin.as_str(),
        Utc::now(),
    ) {
        let code = match err {
            token::TokenError::Invalid => "approval.token_invalid",
            token::TokenError::Expired => "approval.token_expired",
        };
        audit_approval_failure(state, &row, &approver, code).await?;
        return Err(json_error(StatusCode::UNAUTHORIZED, code, err.to_string()));
    }

    if approver.role != Role::Admin {
        audit_approval_failure(state, &row, &approver, "approval.not_admin").await?;
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "approval.not_admin",
            format!("approver role {} may not approve", approver.role.as_str()),
        ));
    }

    if approver.external_user_id == row.external_user_id {
        audit_approval_failure(state, &row, &approver, "approval.self_approval").await?;
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "approval.self_approval",
            "requester and approver must be distinct".to_string(),
        ));
    }

    let target_status = if approve {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Denied
    };

    let outcome = state
        .approvals
        .decide(
            req.approval_id,
            target_status,
            &approver.external_user_id,
            &req.decision,
            req.reason.as_deref(),
        )
        .await
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.db_error",
                err.to_string(),
            )
        })?;

    if let DecideOutcome::AlreadyDecided(status) = outcome {
        // Idempotent re-entry: the first submission already audited and,
        // if approved, executed. Report the recorded outcome.
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "already_decided",
                "outcome": status.as_str(),
            })),
        ));
    }

    tracing::info!(
        approval_id = %req.approval_id,
        request_id = %row.request_id,
        approver = %approver.external_user_id,
        decision = %req.decision,
        "gateway.approval_decided"
    );

    if !approve {
        write_audit(
            state,
            AuditEvent {
                request_id: row.request_id,
                external_user_id: row.external_user_id.clone(),
                role: row.role.clone(),
                tool_name: row.tool_name.clone(),
                inputs: row.frozen_inputs.clone(),
                outputs: serde_json::json!({
                    "approval_id": row.approval_id,
                    "approver_external_id": approver.external_user_id,
                    "approver_reason": req.reason,
                }),
                decision: Decision::Deny.as_str().to_string(),
                rule_ids: row.rule_ids.clone(),
                constraints: serde_json::json!({}),
                latency_ms: 0,
                row_count: None,
                error: Some("approval.denied".to_string()),
            },
        )
        .await?;
        metrics::observe_approval("denied");

        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "outcome": "denied" })),
        ));
    }

    metrics::observe_approval("approved");
    resume_approved(state, &row, &approver).await
}

/// Approval granted: audit the grant, then push the FROZEN decision input
/// back through the gating layers under the current bundle. Approval never
/// widens — a bundle that has tightened since suspension denies here.
async fn resume_approved(
    state: &AppState,
    row: &datagate_approvals::ApprovalRequest,
    approver: &Identity,
) -> Result<ApiResponse, ApiError> {
    write_audit(
        state,
        AuditEvent {
            request_id: row.request_id,
            external_user_id: row.external_user_id.clone(),
            role: row.role.clone(),
            tool_name: row.tool_name.clone(),
            inputs: row.frozen_inputs.clone(),
            outputs: serde_json::json!({
                "approval_id": row.approval_id,
                "approver_external_id": approver.external_user_id,
                "approval_outcome": "approved",
            }),
            decision: Decision::Allow.as_str().to_string(),
            rule_ids: row.rule_ids.clone(),
            constraints: serde_json::json!({}),
            latency_ms: 0,
            row_count: None,
            error: None,
        },
    )
    .await?;

    let frozen: DecisionInput =
        serde_json::from_value(row.frozen_decision_input.clone()).map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.error",
                format!("frozen decision input is unreadable: {}", err),
            )
        })?;

    let bundle = state.policy.current();
    let verdict = evaluate_without_approval(&bundle, &frozen);

    if verdict.decision != Decision::Allow {
        write_audit(
            state,
            AuditEvent {
                request_id: row.request_id,
                external_user_id: row.external_user_id.clone(),
                role: row.role.clone(),
                tool_name: row.tool_name.clone(),
                inputs: row.frozen_inputs.clone(),
                outputs: serde_json::json!({}),
                decision: Decision::Deny.as_str().to_string(),
                rule_ids: verdict.rule_ids.clone(),
                constraints: serde_json::json!({}),
                latency_ms: 0,
                row_count: None,
                error: Some(format!("post-approval re-evaluation denied: {}", verdict.reason)),
            },
        )
        .await?;

        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "outcome": "denied",
                "decision": decision_body(&verdict.reason, &verdict.rule_ids, &Constraints::default()),
            })),
        ));
    }

    let Some(tool) = ToolName::parse(&row.tool_name) else {
        return Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal.error",
            format!("approval row carries unknown tool {}", row.tool_name),
        ));
    };

    // Captured-at-request role and region drive execution.
    let requester = Identity {
        external_user_id: row.external_user_id.clone(),
        display_name: String::new(),
        role: Role::parse(&row.role).unwrap_or(Role::Intern),
        region: frozen
            .region
            .as_deref()
            .and_then(datagate_contracts::Region::parse),
    };

    let inputs = parse_inputs(tool, &row.frozen_inputs).map_err(|err| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal.error",
            format!("frozen inputs are unreadable: {}", err),
        )
    })?;

    let facts = match &inputs {
        ToolInputs::RunSql(sql) => Some(analyze(&sql.query).map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal.error",
                format!("frozen query no longer analyzes: {}", err.message),
            )
        })?),
        _ => None,
    };

    let started = Instant::now();
    let response = execute_and_respond(
        state,
        row.request_id,
        &row.frozen_inputs,
        tool,
        &requester,
        &inputs,
        facts.as_ref(),
        &verdict.rule_ids,
        &verdict.constraints,
        &row.reason,
        started,
    )
    .await?;

    let (status, Json(body)) = response;
    Ok((
        status,
        Json(serde_json::json!({
            "status": "ok",
            "outcome": "approved",
            "result": body.get("result").cloned().unwrap_or(serde_json::Value::Null),
        })),
    ))
}

async fn audit_approval_failure(
    state: &AppState,
    row: &datagate_approvals::ApprovalRequest,
    approver: &Identity,
    code: &str,
) -> Result<(), ApiError> {
    write_audit(
        state,
        AuditEvent {
            request_id: row.request_id,
            external_user_id: row.external_user_id.clone(),
            role: row.role.clone(),
            tool_name: row.tool_name.clone(),
            inputs: row.frozen_inputs.clone(),
            outputs: serde_json::json!({
                "approval_id": row.approval_id,
                "attempted_by": approver.external_user_id,
            }),
            decision: Decision::Deny.as_str().to_string(),
            rule_ids: row.rule_ids.clone(),
            constraints: serde_json::json!({}),
            latency_ms: 0,
            row_count: None,
            error: Some(code.to_string()),
        },
    )
    .await
}

/// Periodic lazy expiry of lapsed approvals, each recorded in the audit
/// log before the next sweep tick.
pub async fn run_approval_sweeper(state: AppState) {
    let mut interval = tokio::time::interval(state.config.approval_sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let expired = match state.approvals.sweep().await {
            Ok(expired) => expired,
            Err(err) => {
                tracing::warn!(error = %err, "gateway.approval_sweep_failed");
                continue;
            }
        };

        for row in expired {
            metrics::observe_approval("expired");
            tracing::info!(
                approval_id = %row.approval_id,
                request_id = %row.request_id,
                "gateway.approval_expired"
            );

            let event = AuditEvent {
                request_id: row.request_id,
                external_user_id: row.external_user_id.clone(),
                role: row.role.clone(),
                tool_name: row.tool_name.clone(),
                inputs: row.frozen_inputs.clone(),
                outputs: serde_json::json!({ "approval_id": row.approval_id }),
                decision: Decision::Deny.as_str().to_string(),
                rule_ids: row.rule_ids.clone(),
                constraints: serde_json::json!({}),
                latency_ms: 0,
                row_count: None,
                error: Some(RULE_APPROVAL_EXPIRED.to_string()),
            };
            if let Err(err) = state.audit.record(&event).await {
                tracing::error!(
                    approval_id = %row.approval_id,
                    error = %err,
                    "gateway.approval_expiry_audit_failed"
                );
            }
        }
    }
}

/// SIGHUP-triggered policy bundle reload. An invalid replacement bundle is
/// rejected and the active one keeps serving.
#[cfg(unix)]
pub async fn run_bundle_reloader(state: AppState) {
    use tokio::signal::unix::{SignalKind, signal};

    let Some(path) = state.config.policy_bundle_path.clone() else {
        return;
    };

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "gateway.sighup_listener_failed");
            return;
        }
    };

    while hangups.recv().await.is_some() {
        match state.policy.reload(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "gateway.policy_bundle_reloaded"),
            Err(err) => {
                tracing::warn!(error = %err, "gateway.policy_bundle_reload_rejected")
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn run_bundle_reloader(_state: AppState) {}
