//! The aggregation planner: produces the SQL for a grouped aggregation
//! annotated with the predicate-derived `is_anonymous` flag.
//!
//! Pure with respect to its inputs: identical dimensions, overrides, metrics,
//! predicate, and source table name always render the identical SQL string.

use std::collections::HashMap;

use crate::identifier::quote_ident;
use crate::metric::Metric;

/// Build the dimension projection list, substituting any accumulated
/// CASE-rewrite for a dimension that a prior `replace-with-redacted` pass
/// produced.
pub fn dimension_select_list(dimensions: &[String], overrides: &HashMap<String, String>) -> Vec<String> {
    dimensions
        .iter()
        .map(|d| match overrides.get(d) {
            Some(expr) => format!("{expr} AS {}", quote_ident(d)),
            None => quote_ident(d),
        })
        .collect()
}

/// The GROUP BY expressions paired with `dimension_select_list`: the raw
/// rewrite expression where one exists, else the plain identifier.
pub fn group_by_list(dimensions: &[String], overrides: &HashMap<String, String>) -> Vec<String> {
    dimensions
        .iter()
        .map(|d| overrides.get(d).cloned().unwrap_or_else(|| quote_ident(d)))
        .collect()
}

/// Render the full aggregation query: an inner GROUP BY aggregation wrapped
/// by an outer projection that adds `is_anonymous`.
pub fn build_aggregation_sql(
    dimensions: &[String],
    dimension_overrides: &HashMap<String, String>,
    metrics: &[Metric],
    predicate: &str,
    source_table: &str,
) -> String {
    let metric_list = metrics
        .iter()
        .map(|m| m.render(true))
        .collect::<Vec<_>>()
        .join(", ");
    let dim_select = dimension_select_list(dimensions, dimension_overrides).join(", ");
    let group_by = group_by_list(dimensions, dimension_overrides).join(", ");
    let is_anonymous = quote_ident("is_anonymous");

    format!(
        "SELECT *, NOT ({predicate}) AS {is_anonymous} FROM \
         (SELECT {metric_list}, {dim_select} FROM {table} GROUP BY {group_by}) AS aggregated",
        table = quote_ident(source_table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_config::AggregationKind;

    fn metric(alias: &str) -> Metric {
        Metric {
            column: Some("count".to_string()),
            alias: alias.to_string(),
            aggregation: AggregationKind::Sum,
            null_is_zero: false,
            expression: None,
        }
    }

    #[test]
    fn builds_plain_aggregation() {
        let sql = build_aggregation_sql(
            &["county".to_string()],
            &HashMap::new(),
            &[metric("incidence")],
            "incidence < 11",
            "source",
        );
        assert!(sql.contains("GROUP BY \"county\""));
        assert!(sql.contains("sum(\"count\") AS \"incidence\""));
        assert!(sql.contains("NOT (incidence < 11) AS \"is_anonymous\""));
    }

    #[test]
    fn applies_dimension_override() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "county".to_string(),
            "CASE WHEN \"county\" = 'x' THEN 'redacted' ELSE \"county\" END".to_string(),
        );
        let sql = build_aggregation_sql(
            &["county".to_string()],
            &overrides,
            &[metric("incidence")],
            "incidence < 11",
            "source",
        );
        assert!(sql.contains("CASE WHEN \"county\" = 'x' THEN 'redacted' ELSE \"county\" END AS \"county\""));
    }

    #[test]
    fn is_deterministic() {
        let a = build_aggregation_sql(
            &["county".to_string()],
            &HashMap::new(),
            &[metric("incidence")],
            "incidence < 11",
            "source",
        );
        let b = build_aggregation_sql(
            &["county".to_string()],
            &HashMap::new(),
            &[metric("incidence")],
            "incidence < 11",
            "source",
        );
        assert_eq!(a, b);
    }
}
