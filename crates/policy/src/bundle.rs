//! Declarative policy bundle: five JSON rule files loaded at startup and
//! swapped atomically on reload. An invalid bundle never replaces a valid
//! one.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BundleError {}

fn invalid(message: String) -> BundleError {
    BundleError {
        code: "policy.bundle_invalid",
        message,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RbacConfig {
    /// role -> tools the role may call.
    pub roles: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TablesConfig {
    /// role -> schemas the role may reference.
    pub schema_allow: BTreeMap<String, Vec<String>>,
    /// role -> fully qualified tables blocked despite the schema allow-set.
    #[serde(default)]
    pub blocked_tables: BTreeMap<String, Vec<String>>,
    /// Roles allowed to run DDL/DML.
    pub ddl_roles: Vec<String>,
    /// Roles exempt from the explicit-LIMIT requirement.
    pub limit_exempt_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnsConfig {
    pub pii_columns: Vec<String>,
    pub financial_columns: Vec<String>,
    /// Roles that read PII in the clear.
    pub pii_allowed_roles: Vec<String>,
    /// Roles whose PII reads are allowed with masking.
    pub mask_roles: Vec<String>,
    pub financial_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowsConfig {
    /// Roles whose region becomes a mandatory row filter.
    pub region_filter_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalConfig {
    pub sensitive_schemas: Vec<String>,
    /// Roles that reach sensitive schemas without approval.
    pub exempt_roles: Vec<String>,
    pub large_row_threshold: i64,
    pub admin_pii_requires_approval: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyBundle {
    pub rbac: RbacConfig,
    pub tables: TablesConfig,
    pub columns: ColumnsConfig,
    pub rows: RowsConfig,
    pub approval: ApprovalConfig,
}

impl PolicyBundle {
    /// Load and validate the five rule files from a bundle directory.
    pub fn load(dir: &Path) -> Result<Self, BundleError> {
        let bundle = Self {
            rbac: load_file(dir, "rbac.json")?,
            tables: load_file(dir, "tables.json")?,
            columns: load_file(dir, "columns.json")?,
            rows: load_file(dir, "rows.json")?,
            approval: load_file(dir, "approval.json")?,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    /// The compiled-in defaults, kept in lockstep with the JSON shipped
    /// under `bundle/`.
    pub fn builtin() -> Self {
        let read_tools = vec!["search_docs".to_string(), "explain_metric".to_string()];
        let full_tools = vec![
            "search_docs".to_string(),
            "explain_metric".to_string(),
            "run_sql".to_string(),
            "generate_chart".to_string(),
        ];

        let bundle = Self {
            rbac: RbacConfig {
                roles: BTreeMap::from([
                    ("intern".to_string(), read_tools),
                    ("marketing".to_string(), full_tools.clone()),
                    ("sales".to_string(), full_tools.clone()),
                    ("data_analyst".to_string(), full_tools.clone()),
                    ("admin".to_string(), full_tools),
                ]),
            },
            tables: TablesConfig {
                schema_allow: BTreeMap::from([
                    ("intern".to_string(), Vec::new()),
                    ("marketing".to_string(), vec!["reporting".to_string()]),
                    ("sales".to_string(), vec!["reporting".to_string()]),
                    (
                        "data_analyst".to_string(),
                        vec!["reporting".to_string(), "refined".to_string()],
                    ),
                    (
                        "admin".to_string(),
                        vec![
                            "reporting".to_string(),
                            "refined".to_string(),
                            "raw".to_string(),
                            "internal".to_string(),
                        ],
                    ),
                ]),
                blocked_tables: BTreeMap::from([(
                    "marketing".to_string(),
                    vec!["reporting.user_sessions".to_string()],
                )]),
                ddl_roles: vec!["admin".to_string()],
                limit_exempt_roles: vec!["data_analyst".to_string(), "admin".to_string()],
            },
            columns: ColumnsConfig {
                pii_columns: vec![
                    "email".to_string(),
                    "phone".to_string(),
                    "address".to_string(),
                    "address_line1".to_string(),
                    "address_line2".to_string(),
                    "contact_name".to_string(),
                    "card_last_four".to_string(),
                    "ssn".to_string(),
                    "tax_id".to_string(),
                ],
                financial_columns: vec![
                    "payment_method".to_string(),
                    "bank_account".to_string(),
                    "routing_number".to_string(),
                ],
                pii_allowed_roles: vec!["admin".to_string(), "data_analyst".to_string()],
                mask_roles: vec!["sales".to_string(), "marketing".to_string()],
                financial_roles: vec![
                    "admin".to_string(),
                    "data_analyst".to_string(),
                    "finance".to_string(),
                ],
            },
            rows: RowsConfig {
                region_filter_roles: vec!["sales".to_string()],
            },
            approval: ApprovalConfig {
                sensitive_schemas: vec!["raw".to_string()],
                exempt_roles: vec!["admin".to_string()],
                large_row_threshold: 1_000,
                admin_pii_requires_approval: true,
            },
        };

        debug_assert!(bundle.validate().is_ok());
        bundle
    }

    fn validate(&self) -> Result<(), BundleError> {
        if self.rbac.roles.is_empty() {
            return Err(invalid("rbac.json must define at least one role".to_string()));
        }

        for (role, tools) in &self.rbac.roles {
            for tool in tools {
                if datagate_contracts::ToolName::parse(tool).is_none() {
                    return Err(invalid(format!(
                        "rbac.json grants role {} the unknown tool {}",
                        role, tool
                    )));
                }
            }
        }

        for (role, blocked) in &self.tables.blocked_tables {
            for table in blocked {
                if !table.contains('.') {
                    return Err(invalid(format!(
                        "tables.json blocked table {} for role {} must be schema-qualified",
                        table, role
                    )));
                }
            }
        }

        if self.approval.large_row_threshold <= 0 {
            return Err(invalid(
                "approval.json large_row_threshold must be positive".to_string(),
            ));
        }

        for set in [
            &self.columns.pii_columns,
            &self.columns.financial_columns,
        ] {
            for column in set {
                if column.chars().any(|c| c.is_ascii_uppercase()) {
                    return Err(invalid(format!(
                        "columns.json sensitive column {} must be lowercase (matching is case-folded)",
                        column
                    )));
                }
            }
        }

        Ok(())
    }
}

fn load_file<T: for<'de> Deserialize<'de>>(dir: &Path, name: &str) -> Result<T, BundleError> {
    let path = dir.join(name);
    let contents = std::fs::read_to_string(&path)
        .map_err(|_| invalid(format!("failed to read rule file {}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|err| invalid(format!("rule file {} is invalid: {}", name, err)))
}

/// Shared handle to the active bundle. Reads clone the inner `Arc`; reload
/// parses and validates before swapping, so readers never observe a
/// half-loaded bundle.
#[derive(Clone)]
pub struct BundleHandle {
    inner: Arc<RwLock<Arc<PolicyBundle>>>,
}

impl BundleHandle {
    pub fn new(bundle: PolicyBundle) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(bundle))),
        }
    }

    pub fn load(dir: &Path) -> Result<Self, BundleError> {
        Ok(Self::new(PolicyBundle::load(dir)?))
    }

    pub fn current(&self) -> Arc<PolicyBundle> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn reload(&self, dir: &Path) -> Result<(), BundleError> {
        let bundle = Arc::new(PolicyBundle::load(dir)?);
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = bundle;
        Ok(())
    }
}
