//! Drives a pipeline document end to end: load each dataset, aggregate,
//! run its configured suppression strategies in order, and emit the
//! annotated output table.

use std::collections::HashMap;

use serde_json::Value;

use crate::aggregation::build_aggregation_sql;
use crate::cell::Cell;
use crate::engine_settings::EngineSettings;
use crate::error::{Result, TesseraError};
use crate::identifier::{quote_ident, render_json_literal};
use crate::materializer::{cells_from_rows, mark_redacted, replace_with_redacted};
use crate::metric::{resolve_metrics, Metric};
use crate::pipeline_config::{DatasetConfig, PipelineConfig, StrategyConfig};
use crate::substrate::Substrate;

pub struct Orchestrator {
    substrate: Substrate,
    settings: EngineSettings,
}

impl Orchestrator {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Ok(Self {
            substrate: Substrate::open_in_memory()?,
            settings,
        })
    }

    /// Run every dataset in the pipeline, in declaration order. A later
    /// dataset may reference an earlier one's output file as its source.
    pub fn run_pipeline(&self, pipeline: &PipelineConfig) -> Result<()> {
        for dataset in &pipeline.datasets {
            self.run_one_dataset(pipeline, dataset)?;
        }
        Ok(())
    }

    fn run_one_dataset(&self, pipeline: &PipelineConfig, dataset: &DatasetConfig) -> Result<()> {
        tracing::info!(dataset = %dataset.name, "loading dataset source");
        let source_table = format!("{}_source", dataset.name);
        match (&dataset.sql, &dataset.source_file) {
            (Some(sql), _) => self.substrate.create_table_as(&source_table, sql)?,
            (None, Some(path)) => {
                let uri = pipeline.datasource.resolve_uri(path)?;
                self.substrate.load_table_from_file(&source_table, &uri)?
            }
            (None, None) => {
                return Err(TesseraError::Config(format!(
                    "dataset '{}' has neither 'sql' nor 'source_file'",
                    dataset.name
                )))
            }
        }

        let resolved = resolve_metrics(&dataset.metrics);
        let predicate = pipeline.redaction_predicate_for(dataset)?;
        let primary_alias = resolved
            .subsequent
            .first()
            .map(|m| m.alias.clone())
            .ok_or_else(|| {
                TesseraError::Config(format!("dataset '{}' has no metrics", dataset.name))
            })?;

        let result_table = format!("{}_result", dataset.name);
        let initial_sql = build_aggregation_sql(
            &dataset.dimensions,
            &HashMap::new(),
            &resolved.initial,
            &predicate,
            &source_table,
        );
        self.substrate.create_table_as(&result_table, &initial_sql)?;

        let subsequent_aliases: Vec<String> =
            resolved.subsequent.iter().map(|m| m.alias.clone()).collect();

        let mut output_cells: Option<Vec<Cell>> = None;

        for (idx, strategy) in dataset.suppression_strategies.iter().enumerate() {
            tracing::info!(dataset = %dataset.name, strategy = strategy.name(), index = idx, "running suppression strategy");
            match strategy {
                StrategyConfig::MarkRedacted(params) => {
                    let agg_sql = build_aggregation_sql(
                        &dataset.dimensions,
                        &HashMap::new(),
                        &resolved.subsequent,
                        &predicate,
                        &result_table,
                    );
                    let rows = self.substrate.query(&agg_sql)?;
                    let mut cells =
                        cells_from_rows(&rows, &dataset.dimensions, &subsequent_aliases, &predicate);
                    mark_redacted(
                        &mut cells,
                        &dataset.name,
                        &dataset.dimensions,
                        &primary_alias,
                        pipeline.threshold as f64,
                        params,
                        self.settings.kernel.divergence_cap_multiplier,
                    )?;
                    output_cells = Some(cells);
                }
                StrategyConfig::ReplaceWithRedacted(params) => {
                    let cells = replace_with_redacted(
                        &self.substrate,
                        &dataset.name,
                        &result_table,
                        &dataset.dimensions,
                        &resolved.subsequent,
                        &predicate,
                        &primary_alias,
                        pipeline.threshold as f64,
                        params,
                        &dataset.redaction_order_dimensions,
                        self.settings.kernel.divergence_cap_multiplier,
                    )?;
                    output_cells = Some(cells);
                }
                other => {
                    return Err(TesseraError::UnimplementedStrategy(other.name().to_string()));
                }
            }
        }

        let cells = match output_cells {
            Some(cells) => cells,
            None => {
                tracing::warn!(dataset = %dataset.name, "no suppression strategy configured; emitting unsuppressed aggregation");
                let agg_sql = build_aggregation_sql(
                    &dataset.dimensions,
                    &HashMap::new(),
                    &resolved.subsequent,
                    &predicate,
                    &result_table,
                );
                let rows = self.substrate.query(&agg_sql)?;
                cells_from_rows(&rows, &dataset.dimensions, &subsequent_aliases, &predicate)
            }
        };

        let output_uri = pipeline.datasource.resolve_uri(&dataset.output_file)?;
        self.emit(
            &output_uri,
            &dataset.dimensions,
            &resolved.subsequent,
            &cells,
        )?;
        tracing::info!(dataset = %dataset.name, rows = cells.len(), output = %dataset.output_file, "dataset written");

        if !self.settings.kernel.cache_tables_in_memory {
            self.substrate
                .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&result_table)))?;
            self.substrate
                .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&source_table)))?;
        }

        Ok(())
    }

    /// Materialize the cell set as a substrate table (dimensions, metrics,
    /// and the four annotation columns) and copy it to the configured sink.
    fn emit(
        &self,
        output_file: &str,
        dimensions: &[String],
        metrics: &[Metric],
        cells: &[Cell],
    ) -> Result<()> {
        let mut column_names: Vec<String> = dimensions.to_vec();
        column_names.extend(metrics.iter().map(|m| m.alias.clone()));
        column_names.extend(
            ["is_anonymous", "is_redacted", "redaction_reason", "peer_group", "redacted_peers"]
                .map(|s| s.to_string()),
        );

        let rows_sql: Vec<String> = cells
            .iter()
            .map(|cell| {
                let mut values: Vec<String> = dimensions
                    .iter()
                    .map(|d| render_json_literal(cell.dimension(d)))
                    .collect();
                values.extend(
                    metrics
                        .iter()
                        .map(|m| render_json_literal(cell.metrics.get(&m.alias).unwrap_or(&Value::Null))),
                );
                values.push(cell.is_anonymous.to_string());
                values.push(cell.is_redacted.to_string());
                values.push(match &cell.redaction_reason {
                    Some(r) => render_json_literal(&Value::String(r.clone())),
                    None => "NULL".to_string(),
                });
                values.push(json_column_literal(&cell.peer_group));
                values.push(json_column_literal(&cell.redacted_peers));
                format!("({})", values.join(", "))
            })
            .collect();

        let select_list = column_names
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = if rows_sql.is_empty() {
            format!(
                "CREATE OR REPLACE TABLE output AS SELECT {select_list} FROM (SELECT {placeholders}) WHERE FALSE",
                placeholders = column_names
                    .iter()
                    .map(|c| format!("NULL AS {}", quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        } else {
            format!(
                "CREATE OR REPLACE TABLE output AS SELECT * FROM (VALUES {}) AS t({select_list})",
                rows_sql.join(", "),
            )
        };

        self.substrate.execute(&sql)?;
        self.substrate.write_table_to_file("output", output_file)
    }
}

fn json_column_literal(value: &Option<Value>) -> String {
    match value {
        Some(v) => render_json_literal(&Value::String(v.to_string())),
        None => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_config::{
        AggregationKind, ConnectionType, DataSourceConfig, DatasetConfig, MarkRedactedParams,
        MetricConfig, StrategyConfig,
    };
    use tempfile::tempdir;

    fn write_csv(dir: &std::path::Path, name: &str, contents: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn runs_a_small_mark_redacted_pipeline_end_to_end() {
        let dir = tempdir().unwrap();
        let source = write_csv(
            dir.path(),
            "source.csv",
            "sex,count\nM,20\nF,3\n",
        );
        let output = dir.path().join("output.csv").to_string_lossy().to_string();

        let pipeline = PipelineConfig {
            datasource: DataSourceConfig {
                connection_type: ConnectionType::File,
                parameters: HashMap::new(),
            },
            threshold: 11,
            allow_zeroes: true,
            redaction_expression: None,
            datasets: vec![DatasetConfig {
                name: "library".to_string(),
                dimensions: vec!["sex".to_string()],
                unit_level_id: None,
                metrics: vec![MetricConfig {
                    column: Some("count".to_string()),
                    alias: Some("incidence".to_string()),
                    aggregation: AggregationKind::Sum,
                    null_is_zero: false,
                    expression: None,
                    is_initial: true,
                    is_subsequent: false,
                }],
                sql: None,
                source_file: Some(source),
                output_file: output.clone(),
                redaction_order_dimensions: vec![],
                suppression_strategies: vec![StrategyConfig::MarkRedacted(MarkRedactedParams {
                    redacted_dimension: "sex".to_string(),
                    non_summable_dimensions: vec![],
                    first_order_only: false,
                })],
            }],
        };

        let orchestrator = Orchestrator::new(EngineSettings::default()).unwrap();
        orchestrator.run_pipeline(&pipeline).unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.contains("is_redacted"));
        // Both rows must be redacted: the 3-row is non-anonymous, and the
        // single 20-row is its only peer, so it must be masked too.
        assert_eq!(written.lines().count(), 3);
    }
}
