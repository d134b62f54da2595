use datagate_contracts::{Constraints, DecisionInput, QueryType};

use crate::bundle::{ApprovalConfig, ColumnsConfig, RbacConfig, RowsConfig, TablesConfig};
use crate::{ApprovalOutcome, LayerOutcome, rules};

const RUN_SQL: &str = "run_sql";

pub(crate) fn rbac(config: &RbacConfig, input: &DecisionInput) -> LayerOutcome {
    let Some(allowed) = config.roles.get(&input.role) else {
        return LayerOutcome::deny(
            rules::RBAC_INVALID_ROLE,
            format!("role {} is not recognized", input.role),
        );
    };

    if !allowed.iter().any(|t| *t == input.tool) {
        return LayerOutcome::deny(
            rules::RBAC_TOOL_DENIED,
            format!("role {} may not call tool {}", input.role, input.tool),
        );
    }

    LayerOutcome::pass()
}

pub(crate) fn tables(config: &TablesConfig, input: &DecisionInput) -> LayerOutcome {
    if input.tool != RUN_SQL {
        return LayerOutcome::pass();
    }

    if let Some(query_type) = input.query_type
        && query_type != QueryType::Select
        && !config.ddl_roles.iter().any(|r| *r == input.role)
    {
        return LayerOutcome::deny(
            rules::TABLES_QUERY_TYPE_DENIED,
            format!(
                "role {} may only run SELECT statements, not {}",
                input.role,
                query_type.as_str()
            ),
        );
    }

    let allowed_schemas = config
        .schema_allow
        .get(&input.role)
        .map(|v| v.as_slice())
        .unwrap_or(&[]);

    for table in &input.tables {
        let Some(schema) = table.schema.as_deref() else {
            return LayerOutcome::deny(
                rules::TABLES_SCHEMA_DENIED,
                format!(
                    "table {} is not schema-qualified; unqualified references are outside every allowed schema",
                    table.table
                ),
            );
        };

        if !allowed_schemas.iter().any(|s| s == schema) {
            return LayerOutcome::deny(
                rules::TABLES_SCHEMA_DENIED,
                format!("role {} may not access schema {}", input.role, schema),
            );
        }

        let qualified = format!("{}.{}", schema, table.table);
        if let Some(blocked) = config.blocked_tables.get(&input.role)
            && blocked.iter().any(|b| *b == qualified)
        {
            return LayerOutcome::deny(
                rules::TABLES_TABLE_BLOCKED,
                format!("role {} is blocked from table {}", input.role, qualified),
            );
        }
    }

    if input.query_type == Some(QueryType::Select)
        && !input.is_aggregate
        && !input.has_limit
        && !config.limit_exempt_roles.iter().any(|r| *r == input.role)
    {
        return LayerOutcome::deny(
            rules::TABLES_LIMIT_REQUIRED,
            format!(
                "role {} must put an explicit LIMIT on non-aggregate SELECT statements",
                input.role
            ),
        );
    }

    let mut outcome = LayerOutcome::pass();
    if !input.tables.is_empty() {
        outcome.rule_ids.push(rules::TABLES_SCHEMA_ALLOWED.to_string());
    }
    outcome
}

pub(crate) fn columns(config: &ColumnsConfig, input: &DecisionInput) -> LayerOutcome {
    let pii_hit = intersect_folded(&input.columns, &config.pii_columns);
    let financial_hit = intersect_folded(&input.columns, &config.financial_columns);

    if !financial_hit.is_empty() && !config.financial_roles.iter().any(|r| *r == input.role) {
        return LayerOutcome::deny(
            rules::COLUMNS_FINANCIAL_DENIED,
            format!(
                "role {} may not reference financial columns ({})",
                input.role,
                financial_hit.join(", ")
            ),
        );
    }

    if pii_hit.is_empty() {
        return LayerOutcome::pass();
    }

    if config.pii_allowed_roles.iter().any(|r| *r == input.role) {
        let mut outcome = LayerOutcome::pass();
        outcome.rule_ids.push(rules::COLUMNS_PII_ACCESS.to_string());
        return outcome;
    }

    if config.mask_roles.iter().any(|r| *r == input.role) {
        let mut outcome = LayerOutcome::pass();
        outcome.rule_ids.push(rules::COLUMNS_PII_MASKED.to_string());
        outcome.constraints = Constraints {
            masked_columns: pii_hit,
            ..Constraints::default()
        };
        return outcome;
    }

    LayerOutcome::deny(
        rules::COLUMNS_PII_DENIED,
        format!(
            "role {} may not reference PII columns ({})",
            input.role,
            pii_hit.join(", ")
        ),
    )
}

pub(crate) fn rows(config: &RowsConfig, input: &DecisionInput) -> LayerOutcome {
    if input.tool != RUN_SQL {
        return LayerOutcome::pass();
    }

    if config.region_filter_roles.iter().any(|r| *r == input.role)
        && let Some(region) = input.region.as_deref()
    {
        let mut outcome = LayerOutcome::pass();
        outcome
            .rule_ids
            .push(rules::ROWS_SALES_REGION_FILTER.to_string());
        outcome.constraints = Constraints {
            region_filter: Some(region.to_string()),
            ..Constraints::default()
        };
        return outcome;
    }

    LayerOutcome::pass()
}

pub(crate) fn approval(
    config: &ApprovalConfig,
    columns_config: &ColumnsConfig,
    input: &DecisionInput,
) -> ApprovalOutcome {
    let mut outcome = ApprovalOutcome::default();

    if input.tool != RUN_SQL {
        return outcome;
    }

    let is_exempt = config.exempt_roles.iter().any(|r| *r == input.role);
    let touches_sensitive = input.tables.iter().any(|t| {
        t.schema
            .as_deref()
            .map(|s| config.sensitive_schemas.iter().any(|ss| ss == s))
            .unwrap_or(false)
    });

    if touches_sensitive && !is_exempt {
        require(
            &mut outcome,
            rules::APPROVAL_SENSITIVE_SCHEMA,
            "sensitive_schema",
            "Access to raw schema requires admin approval".to_string(),
        );
    }

    if let Some(row_count) = input.row_count
        && row_count > config.large_row_threshold
    {
        require(
            &mut outcome,
            rules::APPROVAL_LARGE_DATA,
            "large_data",
            format!(
                "Declared result size {} exceeds the large-data threshold of {}",
                row_count, config.large_row_threshold
            ),
        );
    }

    if config.admin_pii_requires_approval
        && input.role == "admin"
        && !intersect_folded(&input.columns, &columns_config.pii_columns).is_empty()
    {
        require(
            &mut outcome,
            rules::APPROVAL_ADMIN_PII,
            "admin_pii",
            "Admin access to PII columns requires second-party approval".to_string(),
        );
    }

    outcome
}

fn require(outcome: &mut ApprovalOutcome, rule_id: &str, approval_type: &str, reason: String) {
    outcome.required = true;
    outcome.rule_ids.push(rule_id.to_string());
    if outcome.reason.is_none() {
        outcome.reason = Some(reason);
        outcome.constraints.approval_type = Some(approval_type.to_string());
    }
}

/// Case-folded intersection of referenced columns with a sensitive set,
/// preserving the referenced order.
fn intersect_folded(columns: &[String], sensitive: &[String]) -> Vec<String> {
    let mut hit = Vec::new();
    for column in columns {
        let folded = column.to_ascii_lowercase();
        if sensitive.iter().any(|s| *s == folded) && !hit.contains(&folded) {
            hit.push(folded);
        }
    }
    hit
}
