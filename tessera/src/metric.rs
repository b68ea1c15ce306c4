//! Metric resolution: turning configured metrics into the expressions used
//! by the initial aggregation and by every subsequent re-aggregation the
//! suppression kernel performs.

use crate::identifier::quote_ident;
use crate::pipeline_config::{AggregationKind, MetricConfig};

#[derive(Debug, Clone)]
pub struct Metric {
    pub column: Option<String>,
    pub alias: String,
    pub aggregation: AggregationKind,
    pub null_is_zero: bool,
    pub expression: Option<String>,
}

impl Metric {
    /// Render this metric's aggregation expression, e.g. `sum("incidence") AS "incidence"`.
    pub fn render(&self, include_alias: bool) -> String {
        let body = if let Some(expr) = &self.expression {
            expr.clone()
        } else {
            let operand = match &self.column {
                Some(col) => {
                    let quoted = quote_ident(col);
                    if self.null_is_zero {
                        format!("coalesce({quoted}, 0)")
                    } else {
                        quoted
                    }
                }
                None => "*".to_string(),
            };

            match self.aggregation {
                AggregationKind::CountDistinct if self.column.is_none() => {
                    tracing::warn!(
                        alias = %self.alias,
                        "count_distinct without a column; downgrading to count"
                    );
                    "count(*)".to_string()
                }
                AggregationKind::CountDistinct => format!("count(distinct {operand})"),
                AggregationKind::Sum => format!("sum({operand})"),
                AggregationKind::Avg => format!("avg({operand})"),
                AggregationKind::Count => format!("count({operand})"),
                AggregationKind::Min => format!("min({operand})"),
                AggregationKind::Max => format!("max({operand})"),
                AggregationKind::AnyValue => format!("any_value({operand})"),
                AggregationKind::ArrayAgg => format!("array_agg({operand})"),
            }
        };

        if include_alias {
            format!("{body} AS {}", quote_ident(&self.alias))
        } else {
            body
        }
    }

    fn from_config(cfg: &MetricConfig, index: usize) -> Self {
        let alias = cfg
            .alias
            .clone()
            .unwrap_or_else(|| format!("m_{index}"));
        Self {
            column: cfg.column.clone(),
            alias,
            aggregation: cfg.aggregation,
            null_is_zero: cfg.null_is_zero,
            expression: cfg.expression.clone(),
        }
    }

    /// The re-aggregation form used whenever this metric is summed across an
    /// already-aggregated cell table (subsequent phase, peer building,
    /// redaction-context windows): always `sum(alias)`, regardless of the
    /// metric's original aggregation kind.
    fn as_subsequent_sum(&self) -> Self {
        Self {
            column: Some(self.alias.clone()),
            alias: self.alias.clone(),
            aggregation: AggregationKind::Sum,
            null_is_zero: false,
            expression: None,
        }
    }
}

/// Resolved metric set: the expressions to use for the initial
/// row-level aggregation, and the expressions to use for every subsequent
/// re-aggregation against the cell table.
pub struct ResolvedMetrics {
    pub initial: Vec<Metric>,
    pub subsequent: Vec<Metric>,
}

/// Resolve a dataset's configured metrics into initial/subsequent phase
/// metric lists.
///
/// A lone metric marked only `is_initial` is the common shorthand: it gets
/// an auto-derived `sum(alias)` twin appended for the re-aggregation phase,
/// so the author doesn't have to hand-write it. Beyond that one shorthand,
/// phase membership follows exactly what each metric declares — a metric
/// explicitly marked `is_subsequent` keeps its own column and aggregation
/// kind verbatim (e.g. `any_value` for a value that's already uniform per
/// group), since it is itself the re-aggregation form the author authored,
/// not a candidate for automatic rewriting. An empty phase falls back to
/// the other phase's metrics, with a warning, rather than emitting no
/// metrics at all.
pub fn resolve_metrics(configs: &[MetricConfig]) -> ResolvedMetrics {
    let mut metrics: Vec<Metric> = configs
        .iter()
        .enumerate()
        .map(|(i, cfg)| Metric::from_config(cfg, i))
        .collect();
    let mut is_initial: Vec<bool> = configs.iter().map(|c| c.is_initial).collect();
    let mut is_subsequent: Vec<bool> = configs.iter().map(|c| c.is_subsequent).collect();

    if metrics.len() == 1 && is_initial[0] && !is_subsequent[0] {
        metrics.push(metrics[0].as_subsequent_sum());
        is_initial.push(false);
        is_subsequent.push(true);
    }

    let mut initial: Vec<Metric> = metrics
        .iter()
        .zip(&is_initial)
        .filter(|(_, &f)| f)
        .map(|(m, _)| m.clone())
        .collect();

    let mut subsequent: Vec<Metric> = metrics
        .iter()
        .zip(is_initial.iter().zip(&is_subsequent))
        .filter(|(_, (&init, &sub))| !init || sub)
        .map(|(m, _)| m.clone())
        .collect();

    if initial.is_empty() {
        tracing::warn!("no initial metrics configured; using subsequent metrics as initial metrics");
        initial = subsequent.clone();
    }
    if subsequent.is_empty() {
        tracing::warn!("no subsequent metrics configured; reusing initial metrics for re-aggregation");
        subsequent = initial.clone();
    }

    ResolvedMetrics { initial, subsequent }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(column: &str, alias: &str, agg: AggregationKind) -> MetricConfig {
        MetricConfig {
            column: Some(column.to_string()),
            alias: Some(alias.to_string()),
            aggregation: agg,
            null_is_zero: false,
            expression: None,
            is_initial: false,
            is_subsequent: false,
        }
    }

    #[test]
    fn renders_plain_sum() {
        let m = Metric::from_config(&cfg("count", "incidence", AggregationKind::Sum), 0);
        assert_eq!(m.render(true), "sum(\"count\") AS \"incidence\"");
    }

    #[test]
    fn null_is_zero_wraps_in_coalesce() {
        let mut config = cfg("count", "incidence", AggregationKind::Sum);
        config.null_is_zero = true;
        let m = Metric::from_config(&config, 0);
        assert_eq!(m.render(true), "sum(coalesce(\"count\", 0)) AS \"incidence\"");
    }

    #[test]
    fn count_distinct_without_column_downgrades() {
        let config = MetricConfig {
            column: None,
            alias: Some("n".to_string()),
            aggregation: AggregationKind::CountDistinct,
            null_is_zero: false,
            expression: None,
            is_initial: false,
            is_subsequent: false,
        };
        let m = Metric::from_config(&config, 0);
        assert_eq!(m.render(true), "count(*) AS \"n\"");
    }

    #[test]
    fn single_initial_metric_duplicates_into_subsequent_sum() {
        let mut config = cfg("count", "incidence", AggregationKind::Sum);
        config.is_initial = true;
        let resolved = resolve_metrics(&[config]);
        assert_eq!(resolved.initial.len(), 1);
        assert_eq!(resolved.subsequent.len(), 1);
        assert_eq!(
            resolved.subsequent[0].render(true),
            "sum(\"incidence\") AS \"incidence\""
        );
    }

    #[test]
    fn explicit_subsequent_metric_keeps_its_own_aggregation() {
        let mut initial_incidence = cfg("count", "incidence", AggregationKind::Count);
        initial_incidence.is_initial = true;
        let mut subsequent_incidence = cfg("incidence", "incidence", AggregationKind::Sum);
        subsequent_incidence.is_initial = false;

        let initial_population = MetricConfig {
            column: Some("zip_code_population".to_string()),
            alias: Some("population".to_string()),
            aggregation: AggregationKind::AnyValue,
            null_is_zero: false,
            expression: None,
            is_initial: true,
            is_subsequent: false,
        };
        let subsequent_population = MetricConfig {
            is_initial: false,
            is_subsequent: true,
            ..initial_population.clone()
        };

        let resolved = resolve_metrics(&[
            initial_incidence,
            subsequent_incidence,
            initial_population,
            subsequent_population,
        ]);

        assert_eq!(resolved.initial.len(), 2);
        assert_eq!(resolved.subsequent.len(), 2);
        let population_subsequent = resolved
            .subsequent
            .iter()
            .find(|m| m.alias == "population")
            .unwrap();
        // Must stay `any_value`, not be forced into `sum`.
        assert_eq!(
            population_subsequent.render(true),
            "any_value(\"zip_code_population\") AS \"population\""
        );
    }

    #[test]
    fn auto_assigns_alias_when_missing() {
        let config = MetricConfig {
            column: Some("x".to_string()),
            alias: None,
            aggregation: AggregationKind::Sum,
            null_is_zero: false,
            expression: None,
            is_initial: false,
            is_subsequent: false,
        };
        let m = Metric::from_config(&config, 2);
        assert_eq!(m.alias, "m_2");
    }
}
