use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod canonical;

/// Roles the identity table may assign. Role and region are server-side
/// authoritative; nothing in a tool-call envelope can override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Intern,
    Marketing,
    Sales,
    DataAnalyst,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Intern => "intern",
            Role::Marketing => "marketing",
            Role::Sales => "sales",
            Role::DataAnalyst => "data_analyst",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intern" => Some(Role::Intern),
            "marketing" => Some(Role::Marketing),
            "sales" => Some(Role::Sales),
            "data_analyst" => Some(Role::DataAnalyst),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Region {
    Na,
    Emea,
    Apac,
    Latam,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Na => "NA",
            Region::Emea => "EMEA",
            Region::Apac => "APAC",
            Region::Latam => "LATAM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NA" => Some(Region::Na),
            "EMEA" => Some(Region::Emea),
            "APAC" => Some(Region::Apac),
            "LATAM" => Some(Region::Latam),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    RunSql,
    SearchDocs,
    ExplainMetric,
    GenerateChart,
}

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::RunSql => "run_sql",
            ToolName::SearchDocs => "search_docs",
            ToolName::ExplainMetric => "explain_metric",
            ToolName::GenerateChart => "generate_chart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run_sql" => Some(ToolName::RunSql),
            "search_docs" => Some(ToolName::SearchDocs),
            "explain_metric" => Some(ToolName::ExplainMetric),
            "generate_chart" => Some(ToolName::GenerateChart),
            _ => None,
        }
    }
}

/// Server-side identity record, keyed by the opaque external user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub external_user_id: String,
    pub display_name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

impl Identity {
    /// Sales identities must carry a region; the row-filter layer and the
    /// database RLS policies both key off it.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.role == Role::Sales && self.region.is_none() {
            return Err(IdentityError {
                external_user_id: self.external_user_id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    pub external_user_id: String,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "identity {} has role sales but no region",
            self.external_user_id
        )
    }
}

impl std::error::Error for IdentityError {}

/// Client tool-call envelope. `request_id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCallEnvelope {
    pub request_id: Uuid,
    pub external_user_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

/// Statement classification the tables layer reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Select,
    Dml,
    Ddl,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Dml => "DML",
            QueryType::Ddl => "DDL",
        }
    }
}

/// A referenced (schema, table) pair. `schema: None` means the query left
/// the reference unqualified; the policy engine treats that as outside
/// every allow-set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn qualified(schema: &str, table: &str) -> Self {
        Self {
            schema: Some(schema.to_string()),
            table: table.to_string(),
        }
    }

    pub fn unqualified(table: &str) -> Self {
        Self {
            schema: None,
            table: table.to_string(),
        }
    }
}

/// Pure description of a tool call, handed to the policy engine. The engine
/// is referentially transparent over this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub tables: Vec<TableRef>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub has_limit: bool,
    #[serde(default)]
    pub is_aggregate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

impl DecisionInput {
    pub fn for_tool(role: &str, region: Option<&str>, tool: ToolName) -> Self {
        Self {
            role: role.to_string(),
            region: region.map(|r| r.to_string()),
            tool: tool.as_str().to_string(),
            tables: Vec::new(),
            columns: Vec::new(),
            query_type: None,
            has_limit: false,
            is_aggregate: false,
            row_count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
            Decision::RequireApproval => "REQUIRE_APPROVAL",
        }
    }
}

/// Machine-readable rewrite directives emitted by the policy layers. Keys
/// are disjoint by construction, so a union is a field-wise merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<i64>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.masked_columns.is_empty()
            && self.region_filter.is_none()
            && self.approval_type.is_none()
            && self.max_rows.is_none()
    }

    pub fn merge(&mut self, other: Constraints) {
        if !other.masked_columns.is_empty() {
            self.masked_columns.extend(other.masked_columns);
            self.masked_columns.sort();
            self.masked_columns.dedup();
        }
        if other.region_filter.is_some() {
            self.region_filter = other.region_filter;
        }
        if other.approval_type.is_some() {
            self.approval_type = other.approval_type;
        }
        if other.max_rows.is_some() {
            self.max_rows = other.max_rows;
        }
    }
}

/// Aggregated verdict from the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub decision: Decision,
    pub reason: String,
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub constraints: Constraints,
}

impl DecisionOutput {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: String::new(),
            rule_ids: Vec::new(),
            constraints: Constraints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }
}
