//! Constraint application: rewrite the query before it reaches the
//! database, overwrite masked columns after. The database's own RLS rules
//! are the backstop; this layer is the primary enforcement.

use datagate_contracts::TableRef;
use datagate_sqlscan::{AnalyzeError, select_insertion_point};

/// Warehouse tables known to carry a region column. The rows layer only
/// emits a region filter; whether the filter applies to a given query is
/// decided here against this catalogue.
const REGION_TABLES: &[(&str, &str, &str)] = &[
    ("reporting", "customers", "region"),
    ("reporting", "daily_kpis", "region"),
    ("reporting", "monthly_kpis", "region"),
    ("reporting", "customer_summary", "region"),
];

pub fn region_column_for(table: &TableRef) -> Option<&'static str> {
    let schema = table.schema.as_deref()?;
    REGION_TABLES
        .iter()
        .find(|(s, t, _)| *s == schema && *t == table.table)
        .map(|(_, _, column)| *column)
}

/// Splice `<region_column> = '<region>'` into the outermost SELECT when its
/// FROM references a region-bearing table. The predicate lands before any
/// top-level GROUP BY / ORDER BY / LIMIT tail.
pub fn apply_region_filter(
    query: &str,
    tables: &[TableRef],
    region: &str,
) -> Result<String, AnalyzeError> {
    let Some(column) = tables.iter().find_map(region_column_for) else {
        return Ok(query.to_string());
    };

    let point = select_insertion_point(query)?;
    let connector = if point.has_where { "AND" } else { "WHERE" };
    let predicate = format!("{} {} = '{}'", connector, column, escape_literal(region));

    let head = query[..point.offset].trim_end();
    let tail = query[point.offset..].trim_end().trim_end_matches(';');

    if tail.is_empty() {
        Ok(format!("{} {}", head, predicate))
    } else {
        Ok(format!("{} {} {}", head, predicate, tail))
    }
}

/// Append `LIMIT <cap>` to a query that lacks one. C2 normally denies such
/// queries for the roles that need it; this is the redundant net behind it.
pub fn ensure_limit(query: &str, cap: i64) -> String {
    let trimmed = query.trim_end().trim_end_matches(';').trim_end();
    format!("{} LIMIT {}", trimmed, cap)
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Sentinel a masked column is overwritten with before the caller sees it.
pub fn sentinel_for(column: &str) -> &'static str {
    match column {
        "email" => "***@***.***",
        "phone" => "***-***-****",
        "card_last_four" => "****",
        _ => "***",
    }
}

/// Overwrite masked columns in decoded result rows, case-insensitively on
/// the output column name.
pub fn mask_rows(rows: &mut [serde_json::Value], masked_columns: &[String]) {
    if masked_columns.is_empty() {
        return;
    }

    for row in rows.iter_mut() {
        let Some(object) = row.as_object_mut() else {
            continue;
        };
        for (key, value) in object.iter_mut() {
            if let Some(masked) = masked_columns
                .iter()
                .find(|c| c.eq_ignore_ascii_case(key))
                && !value.is_null()
            {
                *value = serde_json::Value::String(sentinel_for(masked).to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporting_customers() -> Vec<TableRef> {
        vec![TableRef::qualified("reporting", "customers")]
    }

    #[test]
    fn injects_predicate_into_existing_where() {
        let query =
            "SELECT region, mrr FROM reporting.customers WHERE status = 'active' LIMIT 100";
        let rewritten =
            apply_region_filter(query, &reporting_customers(), "NA").expect("rewrite");
        assert_eq!(
            rewritten,
            "SELECT region, mrr FROM reporting.customers WHERE status = 'active' AND region = 'NA' LIMIT 100"
        );
    }

    #[test]
    fn adds_where_clause_when_absent() {
        let query = "SELECT region, mrr FROM reporting.customers LIMIT 10";
        let rewritten =
            apply_region_filter(query, &reporting_customers(), "EMEA").expect("rewrite");
        assert_eq!(
            rewritten,
            "SELECT region, mrr FROM reporting.customers WHERE region = 'EMEA' LIMIT 10"
        );
    }

    #[test]
    fn appends_predicate_when_no_tail_clause() {
        let query = "SELECT region FROM reporting.daily_kpis;";
        let tables = vec![TableRef::qualified("reporting", "daily_kpis")];
        let rewritten = apply_region_filter(query, &tables, "APAC").expect("rewrite");
        assert_eq!(
            rewritten,
            "SELECT region FROM reporting.daily_kpis WHERE region = 'APAC'"
        );
    }

    #[test]
    fn leaves_regionless_tables_alone() {
        let query = "SELECT name FROM internal.metrics LIMIT 5";
        let tables = vec![TableRef::qualified("internal", "metrics")];
        let rewritten = apply_region_filter(query, &tables, "NA").expect("rewrite");
        assert_eq!(rewritten, query);
    }

    #[test]
    fn predicate_lands_before_order_by() {
        let query = "SELECT region, mrr FROM reporting.customers ORDER BY mrr DESC LIMIT 10";
        let rewritten =
            apply_region_filter(query, &reporting_customers(), "NA").expect("rewrite");
        assert_eq!(
            rewritten,
            "SELECT region, mrr FROM reporting.customers WHERE region = 'NA' ORDER BY mrr DESC LIMIT 10"
        );
    }

    #[test]
    fn ensure_limit_strips_trailing_semicolon() {
        assert_eq!(
            ensure_limit("SELECT mrr FROM reporting.customers; ", 1000),
            "SELECT mrr FROM reporting.customers LIMIT 1000"
        );
    }

    #[test]
    fn masking_uses_per_column_sentinels() {
        let mut rows = vec![
            serde_json::json!({"email": "a@b.co", "phone": "415-555-0134", "mrr": 10}),
            serde_json::json!({"email": null, "card_last_four": "4242", "mrr": 20}),
        ];
        mask_rows(
            &mut rows,
            &[
                "email".to_string(),
                "phone".to_string(),
                "card_last_four".to_string(),
            ],
        );

        assert_eq!(rows[0]["email"], "***@***.***");
        assert_eq!(rows[0]["phone"], "***-***-****");
        assert_eq!(rows[0]["mrr"], 10);
        assert_eq!(rows[1]["email"], serde_json::Value::Null);
        assert_eq!(rows[1]["card_last_four"], "****");
    }

    #[test]
    fn masking_matches_output_columns_case_insensitively() {
        let mut rows = vec![serde_json::json!({"Email": "a@b.co"})];
        mask_rows(&mut rows, &["email".to_string()]);
        assert_eq!(rows[0]["Email"], "***@***.***");
    }
}
