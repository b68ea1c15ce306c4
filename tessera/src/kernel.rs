//! The suppression kernel: the fixed-point loop that decides which cells
//! must be flagged `is_redacted` so that no peer subtraction, along any
//! dimensional subset, can reconstruct a non-anonymous cell.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::cell::{cmp_json_nulls_last, Cell};
use crate::error::{Result, TesseraError};

/// The pure per-row decision rule. See the module-level kernel loop for how
/// the window inputs are computed.
#[allow(clippy::too_many_arguments)]
pub fn should_redact_along_axis(
    is_anonymous: bool,
    previous_cell_redacted: Option<bool>,
    previous_cell_is_anonymous: Option<bool>,
    run_sum_by_axis: f64,
    incidence: f64,
    masked_value_count: u64,
    minimum_threshold: f64,
    first_order_only: bool,
) -> bool {
    if !is_anonymous {
        return true;
    }
    match previous_cell_redacted {
        None => return false,
        Some(false) => return false,
        Some(true) => {}
    }

    let remainder = run_sum_by_axis - incidence;
    if remainder >= minimum_threshold {
        if first_order_only {
            previous_cell_is_anonymous == Some(false) && masked_value_count < 2
        } else {
            masked_value_count < 2
        }
    } else {
        true
    }
}

/// Every non-empty subset of `other_dims`, sorted by cardinality descending
/// (ties broken by the dataset's declared dimension order), plus the empty
/// subset representing the coarsest, whole-table axis.
pub fn enumerate_subsets_descending(other_dims: &[String]) -> Vec<Vec<String>> {
    let n = other_dims.len();
    let mut subsets: Vec<Vec<String>> = (0u32..(1u32 << n))
        .map(|mask| {
            (0..n)
                .filter(|bit| mask & (1 << bit) != 0)
                .map(|bit| other_dims[bit].clone())
                .collect()
        })
        .collect();
    subsets.sort_by(|a, b| b.len().cmp(&a.len()));
    subsets
}

/// The single non-target-dimension grouping used by `replace-with-redacted`.
pub fn single_axis_subset(other_dims: &[String]) -> Vec<Vec<String>> {
    vec![other_dims.to_vec()]
}

pub struct KernelConfig<'a> {
    pub dimensions: &'a [String],
    pub target: &'a str,
    pub non_summable: &'a [String],
    pub primary_metric_alias: &'a str,
    pub threshold: f64,
    pub first_order_only: bool,
    pub redaction_order_dimensions: &'a [String],
    pub divergence_cap_multiplier: usize,
}

impl<'a> KernelConfig<'a> {
    /// Dimensions eligible to appear (or not) in an enumerated subset: every
    /// dimension except the target itself and the ones marked
    /// `non_summable`. `non_summable` dimensions are never droppable from a
    /// partition key — they widen the peer-subset enumeration by being held
    /// fixed in every partition, they just never vary across subsets the way
    /// an ordinary dimension does (see `partition_key`).
    pub fn other_dims(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .filter(|d| d.as_str() != self.target && !self.non_summable.contains(d))
            .cloned()
            .collect()
    }
}

/// The key a cell partitions under for a given subset: the enumerated
/// subset's dimensions plus every `non_summable` dimension, held fixed so
/// cells differing only in a non-summable value are never treated as peers.
fn partition_key(cell: &Cell, subset: &[String], non_summable: &[String]) -> Vec<Value> {
    subset
        .iter()
        .chain(non_summable.iter())
        .map(|d| cell.dimension(d).clone())
        .collect()
}

/// Run the fixed-point loop over `subsets` (already in the order they
/// should be processed) until no subset yields a new redaction in a full
/// pass, or the divergence safety cap is hit.
pub fn run_fixed_point(
    cells: &mut [Cell],
    config: &KernelConfig,
    subsets: &[Vec<String>],
    dataset_name: &str,
) -> Result<()> {
    let cap = cells.len().max(1) * subsets.len().max(1) * config.divergence_cap_multiplier.max(1);
    let mut iterations = 0usize;

    loop {
        let mut any_new_redaction_this_pass = false;

        for subset in subsets {
            loop {
                iterations += 1;
                if iterations > cap {
                    return Err(TesseraError::FixedPointDivergence {
                        dataset: dataset_name.to_string(),
                        iterations,
                    });
                }

                let newly_redacted = run_one_subset_iteration(cells, config, subset);
                if newly_redacted == 0 {
                    break;
                }
                any_new_redaction_this_pass = true;
            }
        }

        if !any_new_redaction_this_pass {
            break;
        }
    }

    Ok(())
}

/// Apply one redaction-context evaluation + update for a single subset.
/// Returns the number of cells newly marked `is_redacted` in this pass.
fn run_one_subset_iteration(cells: &mut [Cell], config: &KernelConfig, subset: &[String]) -> usize {
    // Group row indices by partition key.
    let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
    for (idx, cell) in cells.iter().enumerate() {
        let key: Vec<String> = partition_key(cell, subset, config.non_summable)
            .iter()
            .map(|v| v.to_string())
            .collect();
        groups.entry(key).or_default().push(idx);
    }

    let order_prefix: Vec<&String> = config
        .redaction_order_dimensions
        .iter()
        .filter(|d| subset.contains(d))
        .collect();

    let mut to_redact: Vec<usize> = Vec::new();

    for (_, mut indices) in groups {
        indices.sort_by(|&a, &b| {
            for dim in &order_prefix {
                let ord = cmp_json_nulls_last(cells[a].dimension(dim), cells[b].dimension(dim));
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            // is_redacted desc
            let ord = cells[b].is_redacted.cmp(&cells[a].is_redacted);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
            // target dimension asc, nulls last
            let ord = cmp_json_nulls_last(
                cells[a].dimension(config.target),
                cells[b].dimension(config.target),
            );
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
            // primary metric asc
            cells[a]
                .metric_f64(config.primary_metric_alias)
                .partial_cmp(&cells[b].metric_f64(config.primary_metric_alias))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let axis_total: f64 = indices
            .iter()
            .map(|&i| cells[i].metric_f64(config.primary_metric_alias))
            .sum();

        let mut run_sum = 0.0f64;
        let mut masked_count = 0u64;
        let mut previous_redacted: Option<bool> = None;
        let mut previous_is_anonymous: Option<bool> = None;

        for &idx in &indices {
            let incidence = cells[idx].metric_f64(config.primary_metric_alias);
            run_sum += incidence;

            let decision = should_redact_along_axis(
                cells[idx].is_anonymous,
                previous_redacted,
                previous_is_anonymous,
                run_sum,
                incidence,
                masked_count,
                config.threshold,
                config.first_order_only,
            );

            if decision && !cells[idx].is_redacted {
                to_redact.push(idx);
            }

            previous_redacted = Some(decision || cells[idx].is_redacted);
            previous_is_anonymous = Some(cells[idx].is_anonymous);
            if decision || cells[idx].is_redacted {
                masked_count += 1;
            }
        }

        if to_redact.iter().any(|i| indices.contains(i)) {
            let members: Vec<Value> = indices
                .iter()
                .map(|&i| {
                    let mut member = serde_json::Map::new();
                    member.insert(
                        "dimension_value".to_string(),
                        cells[i].dimension(config.target).clone(),
                    );
                    member.insert(
                        config.primary_metric_alias.to_string(),
                        json!(cells[i].metric_f64(config.primary_metric_alias)),
                    );
                    Value::Object(member)
                })
                .collect();
            let mut peer_group = serde_json::Map::new();
            let key_dims: Vec<&String> = subset.iter().chain(config.non_summable.iter()).collect();
            for (dim, value) in key_dims
                .into_iter()
                .zip(partition_key(&cells[indices[0]], subset, config.non_summable))
            {
                peer_group.insert(dim.clone(), value);
            }
            peer_group.insert("members".to_string(), Value::Array(members));
            let peer_group_value = Value::Object(peer_group);

            for &idx in &indices {
                if to_redact.contains(&idx) {
                    cells[idx].peer_group = Some(peer_group_value.clone());
                }
            }

            let redacted_peers_value: Value = Value::Array(
                indices
                    .iter()
                    .filter(|&&i| cells[i].is_redacted || to_redact.contains(&i))
                    .map(|&i| cells[i].dimension(config.target).clone())
                    .collect(),
            );
            for &idx in &indices {
                if to_redact.contains(&idx) {
                    cells[idx].redacted_peers = Some(redacted_peers_value.clone());
                }
            }

            // axis_total is computed for documentation/debugging symmetry with
            // the spec's window quantities; it is not itself a branch input.
            let _ = axis_total;
        }
    }

    let count = to_redact.len();
    for idx in to_redact {
        if !cells[idx].is_redacted {
            cells[idx].is_redacted = true;
            let reason = if !cells[idx].is_anonymous {
                format!("value meets redaction criteria along axis {:?}", subset)
            } else {
                format!(
                    "secondary suppression to protect peer cell(s) along axis {:?}",
                    subset
                )
            };
            cells[idx].push_reason(&reason);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_suppression_always_redacts() {
        assert!(should_redact_along_axis(
            false, Some(true), Some(true), 100.0, 3.0, 0, 11.0, false
        ));
    }

    #[test]
    fn no_redaction_when_previous_cell_not_redacted() {
        assert!(!should_redact_along_axis(
            true, Some(false), Some(false), 100.0, 50.0, 0, 11.0, false
        ));
    }

    #[test]
    fn no_redaction_on_first_row_in_partition() {
        assert!(!should_redact_along_axis(
            true, None, None, 40.0, 40.0, 0, 11.0, false
        ));
    }

    #[test]
    fn remainder_below_threshold_forces_redaction() {
        // previous cell was redacted, remainder after removing this row is
        // below threshold: removing it would leave too little to hide behind.
        assert!(should_redact_along_axis(
            true, Some(true), Some(true), 15.0, 10.0, 1, 11.0, false
        ));
    }

    #[test]
    fn sufficient_remainder_stops_after_two_masked() {
        assert!(!should_redact_along_axis(
            true, Some(true), Some(true), 120.0, 10.0, 2, 11.0, false
        ));
    }

    #[test]
    fn sufficient_remainder_continues_until_two_masked() {
        assert!(should_redact_along_axis(
            true, Some(true), Some(true), 120.0, 10.0, 1, 11.0, false
        ));
    }

    #[test]
    fn first_order_only_requires_previous_non_anonymous() {
        assert!(!should_redact_along_axis(
            true, Some(true), Some(true), 120.0, 10.0, 0, 11.0, true
        ));
        assert!(should_redact_along_axis(
            true, Some(true), Some(false), 120.0, 10.0, 0, 11.0, true
        ));
    }

    #[test]
    fn enumerate_subsets_are_sorted_descending() {
        let dims = vec!["a".to_string(), "b".to_string()];
        let subsets = enumerate_subsets_descending(&dims);
        assert_eq!(subsets[0].len(), 2);
        assert_eq!(subsets.last().unwrap().len(), 0);
    }
}
