//! Output materialization: turns aggregated rows into cells, runs the
//! suppression kernel, and, for `replace-with-redacted`, rewrites the
//! target dimension's values before the final re-aggregation.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::aggregation::build_aggregation_sql;
use crate::cell::Cell;
use crate::error::Result;
use crate::identifier::{quote_ident, render_json_literal};
use crate::kernel::{enumerate_subsets_descending, single_axis_subset, run_fixed_point, KernelConfig};
use crate::pipeline_config::{MarkRedactedParams, ReplaceWithRedactedParams};
use crate::query_result::QueryResult;
use crate::substrate::Substrate;

/// Build the initial cell set from an aggregated query result.
pub fn cells_from_rows(
    result: &QueryResult,
    dimensions: &[String],
    metric_aliases: &[String],
    redaction_predicate: &str,
) -> Vec<Cell> {
    result
        .rows
        .iter()
        .map(|row| {
            let is_anonymous = row
                .get("is_anonymous")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let dims: BTreeMap<String, Value> = dimensions
                .iter()
                .map(|d| (d.clone(), row.get(d).cloned().unwrap_or(Value::Null)))
                .collect();
            let metrics: BTreeMap<String, Value> = metric_aliases
                .iter()
                .map(|m| (m.clone(), row.get(m).cloned().unwrap_or(Value::Null)))
                .collect();

            let mut cell = Cell {
                dimensions: dims,
                metrics,
                is_anonymous,
                is_redacted: !is_anonymous,
                redaction_reason: None,
                peer_group: None,
                redacted_peers: None,
            };
            if !is_anonymous {
                cell.push_reason(&format!(
                    "value meets redaction criteria '{redaction_predicate}'"
                ));
            }
            cell
        })
        .collect()
}

/// `mark-redacted`: run the subset-enumerated fixed-point loop directly
/// over the already-aggregated cells.
pub fn mark_redacted(
    cells: &mut [Cell],
    dataset_name: &str,
    dimensions: &[String],
    primary_metric_alias: &str,
    threshold: f64,
    params: &MarkRedactedParams,
    divergence_cap_multiplier: usize,
) -> Result<()> {
    let config = KernelConfig {
        dimensions,
        target: &params.redacted_dimension,
        non_summable: &params.non_summable_dimensions,
        primary_metric_alias,
        threshold,
        first_order_only: params.first_order_only,
        redaction_order_dimensions: &[],
        divergence_cap_multiplier,
    };
    let other_dims = config.other_dims();
    let subsets = enumerate_subsets_descending(&other_dims);
    run_fixed_point(cells, &config, &subsets, dataset_name)
}

/// `replace-with-redacted`: run the single-axis peer loop to decide which
/// target-dimension values must be masked, then re-aggregate with those
/// values rewritten to the masking token.
#[allow(clippy::too_many_arguments)]
pub fn replace_with_redacted(
    substrate: &Substrate,
    dataset_name: &str,
    source_table: &str,
    dimensions: &[String],
    all_metric_renders: &[crate::metric::Metric],
    redaction_predicate: &str,
    primary_metric_alias: &str,
    threshold: f64,
    params: &ReplaceWithRedactedParams,
    redaction_order_dimensions: &[String],
    divergence_cap_multiplier: usize,
) -> Result<Vec<Cell>> {
    let metric_aliases: Vec<String> = all_metric_renders.iter().map(|m| m.alias.clone()).collect();

    let initial_sql = build_aggregation_sql(
        dimensions,
        &HashMap::new(),
        all_metric_renders,
        redaction_predicate,
        source_table,
    );
    let initial_result = substrate.query(&initial_sql)?;
    let mut cells = cells_from_rows(&initial_result, dimensions, &metric_aliases, redaction_predicate);

    let config = KernelConfig {
        dimensions,
        target: &params.redacted_dimension,
        non_summable: &params.non_summable_dimensions,
        primary_metric_alias,
        threshold,
        first_order_only: params.first_order_only,
        redaction_order_dimensions,
        divergence_cap_multiplier,
    };
    let other_dims = config.other_dims();
    let subsets = single_axis_subset(&other_dims);
    run_fixed_point(&mut cells, &config, &subsets, dataset_name)?;

    // Held-fixed dimensions for this strategy: the peer axis plus every
    // `non_summable` dimension, which must never be collapsed across when
    // grouping masked values by coordinate (mirrors the kernel's own
    // partition key).
    let held_dims: Vec<String> = other_dims
        .iter()
        .chain(params.non_summable_dimensions.iter())
        .cloned()
        .collect();

    // Collect, per held-dims coordinate, the target-dimension values that
    // must be masked.
    let mut by_coordinate: BTreeMap<Vec<String>, Vec<Value>> = BTreeMap::new();
    for cell in &cells {
        if !cell.is_redacted {
            continue;
        }
        let key: Vec<String> = held_dims
            .iter()
            .map(|d| cell.dimension(d).to_string())
            .collect();
        by_coordinate
            .entry(key)
            .or_default()
            .push(cell.dimension(&params.redacted_dimension).clone());
    }

    if by_coordinate.is_empty() {
        return Ok(cells);
    }

    let case_expr = build_case_override(
        &params.redacted_dimension,
        &held_dims,
        &cells,
        &by_coordinate,
        &params.masking_value,
    );

    let mut overrides: HashMap<String, String> = HashMap::new();
    overrides.insert(params.redacted_dimension.clone(), case_expr);

    let rewritten_sql = build_aggregation_sql(
        dimensions,
        &overrides,
        all_metric_renders,
        redaction_predicate,
        source_table,
    );
    let rewritten_result = substrate.query(&rewritten_sql)?;
    let mut final_cells =
        cells_from_rows(&rewritten_result, dimensions, &metric_aliases, redaction_predicate);

    for cell in &mut final_cells {
        let masked = cell
            .dimension(&params.redacted_dimension)
            .as_str()
            .map(|v| v == params.masking_value)
            .unwrap_or(false);
        if masked {
            cell.is_redacted = true;
            cell.push_reason(&format!(
                "target dimension value replaced with '{}'",
                params.masking_value
            ));
        }
    }

    tracing::info!(
        dataset = dataset_name,
        masked_coordinates = by_coordinate.len(),
        "replace-with-redacted rewrote target dimension values"
    );

    Ok(final_cells)
}

fn build_case_override(
    target: &str,
    other_dims: &[String],
    cells: &[Cell],
    by_coordinate: &BTreeMap<Vec<String>, Vec<Value>>,
    masking_value: &str,
) -> String {
    let mut whens = Vec::new();

    // Recover actual (non-stringified) dimension values for each coordinate
    // by finding one representative cell.
    for (key, masked_values) in by_coordinate {
        let representative = cells.iter().find(|c| {
            other_dims
                .iter()
                .map(|d| c.dimension(d).to_string())
                .collect::<Vec<_>>()
                == *key
        });
        let Some(representative) = representative else {
            continue;
        };

        let mut conditions: Vec<String> = other_dims
            .iter()
            .map(|d| {
                format!(
                    "{} = {}",
                    quote_ident(d),
                    render_json_literal(representative.dimension(d))
                )
            })
            .collect();

        let value_list = masked_values
            .iter()
            .map(render_json_literal)
            .collect::<Vec<_>>()
            .join(", ");
        conditions.push(format!("{} IN ({value_list})", quote_ident(target)));

        whens.push(format!(
            "WHEN {} THEN {}",
            conditions.join(" AND "),
            render_json_literal(&Value::String(masking_value.to_string()))
        ));
    }

    format!(
        "CASE {} ELSE {} END",
        whens.join(" "),
        quote_ident(target)
    )
}
