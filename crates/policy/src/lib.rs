//! Policy engine: five declarative layers aggregated into one verdict.
//!
//! Every layer is a pure function of a [`DecisionInput`]; for a fixed bundle
//! the engine returns the same decision, rule IDs and constraints every
//! time. Aggregation denies on the first failing layer in
//! rbac → tables → columns order; approval can only escalate an ALLOW to
//! REQUIRE_APPROVAL, never rescue a DENY.

use datagate_contracts::{Constraints, Decision, DecisionInput, DecisionOutput};

pub mod bundle;
mod layers;

pub use bundle::{BundleError, BundleHandle, PolicyBundle};

/// Stable identifiers for matched policy branches, emitted for audit.
pub mod rules {
    pub const RBAC_INVALID_ROLE: &str = "rbac.invalid_role";
    pub const RBAC_TOOL_DENIED: &str = "rbac.tool_denied";

    pub const TABLES_SCHEMA_ALLOWED: &str = "tables.schema_allowed";
    pub const TABLES_SCHEMA_DENIED: &str = "tables.schema_denied";
    pub const TABLES_TABLE_BLOCKED: &str = "tables.table_blocked";
    pub const TABLES_QUERY_TYPE_DENIED: &str = "tables.query_type_denied";
    pub const TABLES_LIMIT_REQUIRED: &str = "tables.limit_required";

    pub const COLUMNS_PII_ACCESS: &str = "columns.pii_access";
    pub const COLUMNS_PII_MASKED: &str = "columns.pii_masked";
    pub const COLUMNS_PII_DENIED: &str = "columns.pii_denied";
    pub const COLUMNS_FINANCIAL_DENIED: &str = "columns.financial_denied";

    pub const ROWS_SALES_REGION_FILTER: &str = "rows.sales_region_filter";

    pub const APPROVAL_SENSITIVE_SCHEMA: &str = "approval.sensitive_schema";
    pub const APPROVAL_LARGE_DATA: &str = "approval.large_data";
    pub const APPROVAL_ADMIN_PII: &str = "approval.admin_pii";
}

/// Outcome of one gating layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct LayerOutcome {
    pub allow: bool,
    pub deny_reason: Option<String>,
    pub rule_ids: Vec<String>,
    pub constraints: Constraints,
}

impl LayerOutcome {
    fn pass() -> Self {
        Self {
            allow: true,
            ..Self::default()
        }
    }

    fn deny(rule_id: &str, reason: String) -> Self {
        Self {
            allow: false,
            deny_reason: Some(reason),
            rule_ids: vec![rule_id.to_string()],
            constraints: Constraints::default(),
        }
    }
}

/// Outcome of the approval layer, which signals independently of allow/deny.
#[derive(Debug, Clone, Default)]
pub(crate) struct ApprovalOutcome {
    pub required: bool,
    pub reason: Option<String>,
    pub rule_ids: Vec<String>,
    pub constraints: Constraints,
}

/// Evaluate the full bundle, approval layer included.
pub fn evaluate(bundle: &PolicyBundle, input: &DecisionInput) -> DecisionOutput {
    evaluate_inner(bundle, input, true)
}

/// Evaluate the bundle minus the approval layer. Used when resuming an
/// approved request: approval must not widen what the gating layers grant,
/// so the frozen input is pushed back through rbac/tables/columns/rows under
/// whatever bundle is current.
pub fn evaluate_without_approval(bundle: &PolicyBundle, input: &DecisionInput) -> DecisionOutput {
    evaluate_inner(bundle, input, false)
}

fn evaluate_inner(
    bundle: &PolicyBundle,
    input: &DecisionInput,
    with_approval: bool,
) -> DecisionOutput {
    let mut rule_ids = Vec::new();
    let mut constraints = Constraints::default();

    for layer in [
        layers::rbac(&bundle.rbac, input),
        layers::tables(&bundle.tables, input),
        layers::columns(&bundle.columns, input),
    ] {
        rule_ids.extend(layer.rule_ids);
        if !layer.allow {
            return DecisionOutput {
                decision: Decision::Deny,
                reason: layer
                    .deny_reason
                    .unwrap_or_else(|| "denied by policy".to_string()),
                rule_ids,
                constraints: Constraints::default(),
            };
        }
        constraints.merge(layer.constraints);
    }

    let rows = layers::rows(&bundle.rows, input);
    rule_ids.extend(rows.rule_ids);
    constraints.merge(rows.constraints);

    if with_approval {
        let approval = layers::approval(&bundle.approval, &bundle.columns, input);
        if approval.required {
            rule_ids.extend(approval.rule_ids);
            constraints.merge(approval.constraints);
            return DecisionOutput {
                decision: Decision::RequireApproval,
                reason: approval
                    .reason
                    .unwrap_or_else(|| "approval required".to_string()),
                rule_ids,
                constraints,
            };
        }
    }

    DecisionOutput {
        decision: Decision::Allow,
        reason: String::new(),
        rule_ids,
        constraints,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagate_contracts::{QueryType, TableRef, ToolName};

    fn bundle() -> PolicyBundle {
        PolicyBundle::builtin()
    }

    fn sql_input(
        role: &str,
        region: Option<&str>,
        tables: Vec<TableRef>,
        columns: Vec<&str>,
        has_limit: bool,
    ) -> DecisionInput {
        DecisionInput {
            role: role.to_string(),
            region: region.map(|r| r.to_string()),
            tool: ToolName::RunSql.as_str().to_string(),
            tables,
            columns: columns.into_iter().map(|c| c.to_string()).collect(),
            query_type: Some(QueryType::Select),
            has_limit,
            is_aggregate: false,
            row_count: None,
        }
    }

    #[test]
    fn intern_running_sql_is_denied_by_rbac() {
        // Role=intern, tool=run_sql, query=SELECT 1.
        let input = sql_input("intern", None, Vec::new(), Vec::new(), false);
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::Deny);
        assert_eq!(out.rule_ids, vec![rules::RBAC_TOOL_DENIED.to_string()]);
        assert!(out.reason.contains("intern"));
        assert!(out.reason.contains("run_sql"));
        assert!(out.constraints.is_empty());
    }

    #[test]
    fn unknown_role_fails_closed() {
        let input = sql_input("contractor", None, Vec::new(), Vec::new(), true);
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert_eq!(out.rule_ids, vec![rules::RBAC_INVALID_ROLE.to_string()]);
    }

    #[test]
    fn marketing_reading_raw_fails_at_tables_before_columns() {
        // SELECT email FROM raw.customers LIMIT 10 — the schema denial wins
        // even though email is a PII column.
        let input = sql_input(
            "marketing",
            None,
            vec![TableRef::qualified("raw", "customers")],
            vec!["email"],
            true,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::TABLES_SCHEMA_DENIED.to_string()));
        assert!(!out.rule_ids.contains(&rules::COLUMNS_PII_MASKED.to_string()));
    }

    #[test]
    fn sales_query_gets_region_filter_constraint() {
        // SELECT region, mrr FROM reporting.customers WHERE status='active' LIMIT 100.
        let input = sql_input(
            "sales",
            Some("NA"),
            vec![TableRef::qualified("reporting", "customers")],
            vec!["region", "mrr", "status"],
            true,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::Allow);
        assert_eq!(out.constraints.region_filter.as_deref(), Some("NA"));
        assert!(out.rule_ids.contains(&rules::ROWS_SALES_REGION_FILTER.to_string()));
    }

    #[test]
    fn sales_selecting_email_is_masked_and_region_filtered() {
        // SELECT email, mrr FROM reporting.customers LIMIT 10 as EMEA sales.
        let input = sql_input(
            "sales",
            Some("EMEA"),
            vec![TableRef::qualified("reporting", "customers")],
            vec!["email", "mrr"],
            true,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::Allow);
        assert_eq!(out.constraints.masked_columns, vec!["email".to_string()]);
        assert!(out.rule_ids.contains(&rules::COLUMNS_PII_MASKED.to_string()));
        assert!(out.rule_ids.contains(&rules::ROWS_SALES_REGION_FILTER.to_string()));
    }

    #[test]
    fn non_aggregate_select_without_limit_is_denied_for_marketing() {
        // SELECT * FROM reporting.daily_kpis with no LIMIT.
        let input = sql_input(
            "marketing",
            None,
            vec![TableRef::qualified("reporting", "daily_kpis")],
            Vec::new(),
            false,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::TABLES_LIMIT_REQUIRED.to_string()));
    }

    #[test]
    fn aggregate_select_without_limit_passes() {
        let mut input = sql_input(
            "marketing",
            None,
            vec![TableRef::qualified("reporting", "daily_kpis")],
            vec!["revenue"],
            false,
        );
        input.is_aggregate = true;
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Allow);
    }

    #[test]
    fn analyst_touching_raw_requires_approval() {
        let input = sql_input(
            "data_analyst",
            None,
            vec![TableRef::qualified("raw", "customers")],
            Vec::new(),
            true,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::RequireApproval);
        assert_eq!(out.reason, "Access to raw schema requires admin approval");
        assert!(out.rule_ids.contains(&rules::APPROVAL_SENSITIVE_SCHEMA.to_string()));
        assert_eq!(
            out.constraints.approval_type.as_deref(),
            Some("sensitive_schema")
        );
    }

    #[test]
    fn approval_layer_is_skipped_on_resume() {
        let input = sql_input(
            "data_analyst",
            None,
            vec![TableRef::qualified("raw", "customers")],
            Vec::new(),
            true,
        );
        let out = evaluate_without_approval(&bundle(), &input);
        assert_eq!(out.decision, Decision::Allow);
    }

    #[test]
    fn declared_large_row_count_requires_approval() {
        let mut input = sql_input(
            "data_analyst",
            None,
            vec![TableRef::qualified("reporting", "customers")],
            Vec::new(),
            true,
        );
        input.row_count = Some(5_000);
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::RequireApproval);
        assert!(out.rule_ids.contains(&rules::APPROVAL_LARGE_DATA.to_string()));
    }

    #[test]
    fn admin_pii_query_requires_approval() {
        let input = sql_input(
            "admin",
            None,
            vec![TableRef::qualified("raw", "customers")],
            vec!["ssn"],
            true,
        );
        let out = evaluate(&bundle(), &input);

        assert_eq!(out.decision, Decision::RequireApproval);
        assert!(out.rule_ids.contains(&rules::APPROVAL_ADMIN_PII.to_string()));
        // Admin access to raw is not itself approval-worthy.
        assert!(!out.rule_ids.contains(&rules::APPROVAL_SENSITIVE_SCHEMA.to_string()));
    }

    #[test]
    fn intern_pii_reference_is_denied_outright() {
        let mut input = DecisionInput::for_tool("intern", None, ToolName::SearchDocs);
        input.columns = vec!["email".to_string()];
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::COLUMNS_PII_DENIED.to_string()));
    }

    #[test]
    fn unqualified_table_fails_closed() {
        let input = sql_input(
            "data_analyst",
            None,
            vec![TableRef::unqualified("customers")],
            Vec::new(),
            true,
        );
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::TABLES_SCHEMA_DENIED.to_string()));
    }

    #[test]
    fn marketing_blocked_table_is_denied() {
        let input = sql_input(
            "marketing",
            None,
            vec![TableRef::qualified("reporting", "user_sessions")],
            Vec::new(),
            true,
        );
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::TABLES_TABLE_BLOCKED.to_string()));
    }

    #[test]
    fn ddl_is_admin_only() {
        let mut input = sql_input(
            "data_analyst",
            None,
            vec![TableRef::qualified("reporting", "customers")],
            Vec::new(),
            true,
        );
        input.query_type = Some(QueryType::Ddl);
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::TABLES_QUERY_TYPE_DENIED.to_string()));

        let mut admin = input.clone();
        admin.role = "admin".to_string();
        admin.tables = vec![TableRef::qualified("reporting", "customers")];
        let out = evaluate(&bundle(), &admin);
        assert_eq!(out.decision, Decision::Allow);
    }

    #[test]
    fn financial_columns_require_privileged_role() {
        let input = sql_input(
            "sales",
            Some("NA"),
            vec![TableRef::qualified("reporting", "customers")],
            vec!["bank_account"],
            true,
        );
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Deny);
        assert!(out.rule_ids.contains(&rules::COLUMNS_FINANCIAL_DENIED.to_string()));

        let mut analyst = input.clone();
        analyst.role = "data_analyst".to_string();
        analyst.region = None;
        let out = evaluate(&bundle(), &analyst);
        assert_eq!(out.decision, Decision::Allow);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let input = sql_input(
            "sales",
            Some("NA"),
            vec![TableRef::qualified("reporting", "customers")],
            vec!["email", "mrr", "phone"],
            true,
        );
        let bundle = bundle();
        let first = evaluate(&bundle, &input);
        for _ in 0..16 {
            assert_eq!(evaluate(&bundle, &input), first);
        }
    }

    #[test]
    fn allow_with_no_matching_layers_has_empty_constraints() {
        let input = DecisionInput::for_tool("intern", None, ToolName::SearchDocs);
        let out = evaluate(&bundle(), &input);
        assert_eq!(out.decision, Decision::Allow);
        assert!(out.constraints.is_empty());
        assert!(out.rule_ids.is_empty());
    }
}
