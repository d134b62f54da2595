//! Tool executor: applies the policy engine's constraints, opens a scoped
//! database transaction with per-request context variables, and dispatches
//! to the concrete tool handler under a wall-clock deadline.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sqlx::Row;
use uuid::Uuid;

use datagate_contracts::{Constraints, QueryType, Region, Role, ToolName};
use datagate_sqlscan::QueryFacts;

pub mod chart;
pub mod constraints;

#[derive(Debug)]
pub enum ExecError {
    Timeout,
    PoolExhausted,
    Db(String),
    BadInputs(String),
    Artifact(String),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Timeout => write!(f, "tool execution exceeded its deadline"),
            ExecError::PoolExhausted => write!(f, "database connection pool is exhausted"),
            ExecError::Db(detail) => write!(f, "database error: {}", detail),
            ExecError::BadInputs(detail) => write!(f, "invalid tool inputs: {}", detail),
            ExecError::Artifact(detail) => write!(f, "failed to write chart artifact: {}", detail),
        }
    }
}

impl std::error::Error for ExecError {}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSqlInputs {
    pub query: String,
    /// Declared expected result size; feeds the large-data approval rule.
    #[serde(default)]
    pub row_count: Option<i64>,
}

fn default_k() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchDocsInputs {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplainMetricInputs {
    pub metric_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChartColumns {
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateChartInputs {
    pub chart_type: String,
    #[serde(default)]
    pub title: Option<String>,
    pub data: Vec<serde_json::Value>,
    pub columns: ChartColumns,
}

#[derive(Debug, Clone)]
pub enum ToolInputs {
    RunSql(RunSqlInputs),
    SearchDocs(SearchDocsInputs),
    ExplainMetric(ExplainMetricInputs),
    GenerateChart(GenerateChartInputs),
}

/// Parse and shape-check the opaque envelope inputs for a tool. Called
/// before policy evaluation, so a malformed payload never reaches the
/// engine or the audit log as an executed call.
pub fn parse_inputs(tool: ToolName, value: &serde_json::Value) -> Result<ToolInputs, ExecError> {
    let bad = |err: serde_json::Error| ExecError::BadInputs(err.to_string());
    match tool {
        ToolName::RunSql => Ok(ToolInputs::RunSql(
            serde_json::from_value(value.clone()).map_err(bad)?,
        )),
        ToolName::SearchDocs => {
            let inputs: SearchDocsInputs = serde_json::from_value(value.clone()).map_err(bad)?;
            if inputs.k < 1 || inputs.k > 50 {
                return Err(ExecError::BadInputs("k must be between 1 and 50".to_string()));
            }
            Ok(ToolInputs::SearchDocs(inputs))
        }
        ToolName::ExplainMetric => Ok(ToolInputs::ExplainMetric(
            serde_json::from_value(value.clone()).map_err(bad)?,
        )),
        ToolName::GenerateChart => {
            let inputs: GenerateChartInputs = serde_json::from_value(value.clone()).map_err(bad)?;
            if !chart::is_supported_chart_type(&inputs.chart_type) {
                return Err(ExecError::BadInputs(format!(
                    "unsupported chart_type {}",
                    inputs.chart_type
                )));
            }
            Ok(ToolInputs::GenerateChart(inputs))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub statement_timeout: Duration,
    pub call_timeout: Duration,
    pub default_max_rows: i64,
    pub privileged_max_rows: i64,
    pub chart_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: serde_json::Value,
    pub row_count: Option<i64>,
    pub latency_ms: i64,
}

#[derive(Clone)]
pub struct Executor {
    pool: sqlx::PgPool,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(pool: sqlx::PgPool, config: ExecutorConfig) -> Self {
        Self { pool, config }
    }

    /// Run one tool call under the configured deadline. The caller has
    /// already parsed inputs and obtained an ALLOW (or approved) decision.
    pub async fn execute(
        &self,
        request_id: Uuid,
        role: Role,
        region: Option<Region>,
        inputs: &ToolInputs,
        facts: Option<&QueryFacts>,
        constraints: &Constraints,
    ) -> Result<ToolOutput, ExecError> {
        let started = Instant::now();

        let dispatch = async {
            match inputs {
                ToolInputs::RunSql(inputs) => {
                    let facts = facts.ok_or_else(|| {
                        ExecError::BadInputs("run_sql requires analyzed query facts".to_string())
                    })?;
                    self.run_sql(role, region, inputs, facts, constraints).await
                }
                ToolInputs::SearchDocs(inputs) => self.search_docs(role, inputs).await,
                ToolInputs::ExplainMetric(inputs) => self.explain_metric(inputs).await,
                ToolInputs::GenerateChart(inputs) => self.generate_chart(request_id, inputs),
            }
        };

        let (output, row_count) = tokio::time::timeout(self.config.call_timeout, dispatch)
            .await
            .map_err(|_| ExecError::Timeout)??;

        Ok(ToolOutput {
            output,
            row_count,
            latency_ms: started.elapsed().as_millis() as i64,
        })
    }

    fn row_cap(&self, role: Role, constraints: &Constraints) -> i64 {
        if let Some(max_rows) = constraints.max_rows {
            return max_rows;
        }
        match role {
            Role::DataAnalyst | Role::Admin => self.config.privileged_max_rows,
            _ => self.config.default_max_rows,
        }
    }

    async fn run_sql(
        &self,
        role: Role,
        region: Option<Region>,
        inputs: &RunSqlInputs,
        facts: &QueryFacts,
        constraints: &Constraints,
    ) -> Result<(serde_json::Value, Option<i64>), ExecError> {
        let cap = self.row_cap(role, constraints);

        let mut query = inputs.query.clone();
        if let Some(region_filter) = constraints.region_filter.as_deref() {
            query = constraints::apply_region_filter(&query, &facts.tables, region_filter)
                .map_err(|err| ExecError::BadInputs(err.message))?;
        }
        // Redundant net behind the policy engine; roles exempt from the
        // LIMIT rule are capped by the wrapper below instead.
        if facts.query_type == QueryType::Select
            && !facts.has_limit
            && !facts.is_aggregate
            && !matches!(role, Role::DataAnalyst | Role::Admin)
        {
            query = constraints::ensure_limit(&query, cap);
        }

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        self.set_session_context(&mut tx, role, region).await?;

        if facts.query_type == QueryType::Select {
            let wrapped = format!(
                "SELECT row_to_json(q)::text AS row_json FROM ({}) q LIMIT {}",
                query.trim_end().trim_end_matches(';'),
                cap + 1
            );

            let raw_rows = sqlx::query(&wrapped)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_db_err)?;
            tx.commit().await.map_err(map_db_err)?;

            let mut rows = Vec::with_capacity(raw_rows.len());
            for raw in &raw_rows {
                let encoded: String = raw.try_get("row_json").map_err(map_db_err)?;
                let value = serde_json::from_str(&encoded)
                    .map_err(|err| ExecError::Db(format!("undecodable result row: {}", err)))?;
                rows.push(value);
            }

            let truncated = rows.len() as i64 > cap;
            if truncated {
                rows.truncate(cap as usize);
            }

            constraints::mask_rows(&mut rows, &constraints.masked_columns);

            let columns = rows
                .first()
                .and_then(|row| row.as_object())
                .map(|obj| obj.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let row_count = rows.len() as i64;

            Ok((
                serde_json::json!({
                    "columns": columns,
                    "rows": rows,
                    "row_count": row_count,
                    "truncated": truncated,
                }),
                Some(row_count),
            ))
        } else {
            // Admin-only DDL/DML path; the policy engine has already gated
            // the statement kind.
            let result = sqlx::query(&query)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
            tx.commit().await.map_err(map_db_err)?;

            let affected = result.rows_affected() as i64;
            Ok((
                serde_json::json!({
                    "command": facts.query_type.as_str(),
                    "rows_affected": affected,
                }),
                Some(affected),
            ))
        }
    }

    /// Session context the database RLS policies consult. Role is always
    /// set; leaving it NULL would make the sales policy vacuously pass.
    async fn set_session_context(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        role: Role,
        region: Option<Region>,
    ) -> Result<(), ExecError> {
        sqlx::query("SELECT set_config('app.user_role', $1, true)")
            .bind(role.as_str())
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;

        if let Some(region) = region {
            sqlx::query("SELECT set_config('app.user_region', $1, true)")
                .bind(region.as_str())
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
        }

        let timeout = format!("{}ms", self.config.statement_timeout.as_millis());
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout)
            .execute(&mut **tx)
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    async fn search_docs(
        &self,
        role: Role,
        inputs: &SearchDocsInputs,
    ) -> Result<(serde_json::Value, Option<i64>), ExecError> {
        let tags = acl_tags_for(role);

        let rows = sqlx::query(
            "SELECT d.doc_id::text AS doc_id, d.title, d.doc_type, dc.content FROM internal.doc_chunks dc JOIN internal.documents d ON dc.doc_id = d.doc_id WHERE dc.content ILIKE '%' || $1 || '%' AND d.acl_tags && $2 ORDER BY length(dc.content) ASC, dc.chunk_id ASC LIMIT $3",
        )
        .bind(&inputs.query)
        .bind(&tags)
        .bind(inputs.k)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let content: String = row.try_get("content").map_err(map_db_err)?;
            let snippet: String = content.chars().take(500).collect();
            let score = (inputs.query.len() as f64 / content.len().max(1) as f64).min(1.0);
            hits.push(serde_json::json!({
                "doc_id": row.try_get::<String, _>("doc_id").map_err(map_db_err)?,
                "title": row.try_get::<String, _>("title").map_err(map_db_err)?,
                "section": row.try_get::<Option<String>, _>("doc_type").map_err(map_db_err)?,
                "snippet": snippet,
                "score": score,
            }));
        }

        let count = hits.len() as i64;
        Ok((
            serde_json::json!({ "results": hits, "result_count": count }),
            Some(count),
        ))
    }

    async fn explain_metric(
        &self,
        inputs: &ExplainMetricInputs,
    ) -> Result<(serde_json::Value, Option<i64>), ExecError> {
        let row = sqlx::query(
            "SELECT name, display_name, description, owner, formula, sql_template, dimensions, tags FROM internal.metrics WHERE LOWER(name) = LOWER($1) OR display_name ILIKE '%' || $1 || '%' ORDER BY (LOWER(name) = LOWER($1)) DESC LIMIT 1",
        )
        .bind(&inputs.metric_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        let Some(row) = row else {
            return Ok((
                serde_json::json!({ "found": false, "metric_name": inputs.metric_name }),
                Some(0),
            ));
        };

        let metric = serde_json::json!({
            "name": row.try_get::<String, _>("name").map_err(map_db_err)?,
            "display_name": row.try_get::<String, _>("display_name").map_err(map_db_err)?,
            "description": row.try_get::<String, _>("description").map_err(map_db_err)?,
            "owner": row.try_get::<Option<String>, _>("owner").map_err(map_db_err)?,
            "formula": row.try_get::<Option<String>, _>("formula").map_err(map_db_err)?,
            "sql_template": row.try_get::<Option<String>, _>("sql_template").map_err(map_db_err)?,
            "dimensions": row.try_get::<Vec<String>, _>("dimensions").map_err(map_db_err)?,
            "tags": row.try_get::<Vec<String>, _>("tags").map_err(map_db_err)?,
        });

        Ok((serde_json::json!({ "found": true, "metric": metric }), Some(1)))
    }

    fn generate_chart(
        &self,
        request_id: Uuid,
        inputs: &GenerateChartInputs,
    ) -> Result<(serde_json::Value, Option<i64>), ExecError> {
        let spec = chart::build_spec(inputs);
        let data_hash = chart::data_hash(&inputs.data);

        std::fs::create_dir_all(&self.config.chart_dir)
            .map_err(|err| ExecError::Artifact(err.to_string()))?;
        let filename = format!(
            "chart_{}_{}.json",
            &request_id.simple().to_string()[..8],
            data_hash
        );
        let path = self.config.chart_dir.join(&filename);
        let encoded = serde_json::to_vec_pretty(&spec)
            .map_err(|err| ExecError::Artifact(err.to_string()))?;
        std::fs::write(&path, encoded).map_err(|err| ExecError::Artifact(err.to_string()))?;

        let data_points = inputs.data.len() as i64;
        Ok((
            serde_json::json!({
                "chart_type": inputs.chart_type,
                "vega_lite_spec": spec,
                "data_hash": data_hash,
                "artifact_path": path.to_string_lossy(),
                "data_points": data_points,
            }),
            Some(data_points),
        ))
    }
}

fn acl_tags_for(role: Role) -> Vec<String> {
    match role {
        Role::DataAnalyst | Role::Admin => vec![
            "public".to_string(),
            "finance_only".to_string(),
            "internal".to_string(),
        ],
        Role::Marketing => vec!["public".to_string(), "marketing_only".to_string()],
        Role::Intern | Role::Sales => vec!["public".to_string()],
    }
}

fn map_db_err(err: sqlx::Error) -> ExecError {
    match err {
        sqlx::Error::PoolTimedOut => ExecError::PoolExhausted,
        other => ExecError::Db(scrub_db_error(&other.to_string())),
    }
}

/// Database error text can echo query literals, which may hold PII. Quoted
/// spans are dropped before the message leaves the executor.
fn scrub_db_error(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_quote = false;
    for ch in message.chars() {
        match ch {
            '"' | '\'' => {
                if !in_quote {
                    out.push('?');
                }
                in_quote = !in_quote;
            }
            _ if in_quote => {}
            _ => out.push(ch),
        }
    }
    out
}
