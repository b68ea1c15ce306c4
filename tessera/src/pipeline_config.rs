//! The declarative pipeline document: datasource, redaction predicate
//! defaults, and the list of datasets to run.
//!
//! Loaded from YAML or JSON by file extension, mirroring how the upstream
//! registry loader picks a deserializer per file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

fn default_threshold() -> i64 {
    11
}

fn default_true() -> bool {
    true
}

fn default_masking_value() -> String {
    "redacted".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub datasource: DataSourceConfig,
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default = "default_true")]
    pub allow_zeroes: bool,
    pub redaction_expression: Option<String>,
    pub datasets: Vec<DatasetConfig>,
}

impl PipelineConfig {
    /// Load a pipeline document, picking YAML or JSON by file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            Some("yml") | Some("yaml") | _ => Ok(serde_yaml::from_str(&contents)?),
        }
    }

    /// Resolve the effective redaction predicate for this document: the
    /// explicit `redaction_expression` if set, else `<first metric alias> <
    /// threshold` against the given dataset's first metric.
    pub fn redaction_predicate_for(&self, dataset: &DatasetConfig) -> Result<String> {
        if let Some(expr) = &self.redaction_expression {
            return Ok(expr.clone());
        }
        let first_alias = dataset
            .metrics
            .first()
            .and_then(|m| m.alias.clone())
            .ok_or_else(|| {
                TesseraError::Config(format!(
                    "dataset '{}' has no metrics to derive a default redaction predicate from",
                    dataset.name
                ))
            })?;
        Ok(format!("{} < {}", first_alias, self.threshold))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    File,
    S3,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataSourceConfig {
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl DataSourceConfig {
    /// Resolve a dataset's `source_file`/`output_file` against this
    /// datasource: for `File`, the path is used as-is; for `S3`, it's
    /// joined onto the configured `bucket` (and optional `prefix`) to
    /// build an `s3://bucket/key` URI DuckDB's `httpfs` extension can read
    /// or write directly. A `path` that is already a full URI (contains
    /// `://`) is returned unchanged either way.
    pub fn resolve_uri(&self, path: &str) -> Result<String> {
        if path.contains("://") {
            return Ok(path.to_string());
        }
        match self.connection_type {
            ConnectionType::File => Ok(path.to_string()),
            ConnectionType::S3 => {
                let bucket = self
                    .parameters
                    .get("bucket")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        TesseraError::Config(
                            "s3 datasource requires a 'bucket' parameter".to_string(),
                        )
                    })?;
                let prefix = self
                    .parameters
                    .get("prefix")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let key = if prefix.is_empty() {
                    path.trim_start_matches('/').to_string()
                } else {
                    format!(
                        "{}/{}",
                        prefix.trim_end_matches('/'),
                        path.trim_start_matches('/')
                    )
                };
                Ok(format!("s3://{bucket}/{key}"))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    pub name: String,
    pub dimensions: Vec<String>,
    pub unit_level_id: Option<String>,
    pub metrics: Vec<MetricConfig>,
    /// Optional view definition run against the substrate before aggregation.
    pub sql: Option<String>,
    pub source_file: Option<String>,
    pub output_file: String,
    #[serde(default)]
    pub redaction_order_dimensions: Vec<String>,
    #[serde(default)]
    pub suppression_strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
    AnyValue,
    ArrayAgg,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricConfig {
    /// Source column, or `None` to mean `*` (only valid with `Count`).
    pub column: Option<String>,
    pub alias: Option<String>,
    pub aggregation: AggregationKind,
    #[serde(default)]
    pub null_is_zero: bool,
    /// Raw expression override; when present, takes precedence over
    /// `column`/`aggregation` entirely.
    pub expression: Option<String>,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_subsequent: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum StrategyConfig {
    MarkRedacted(MarkRedactedParams),
    ReplaceWithRedacted(ReplaceWithRedactedParams),
    /// Reserved for future work; configs round-trip but execution fails fast.
    MergeDimensionValues(serde_json::Value),
    ReduceDimensions(serde_json::Value),
    FabricateUnitRecords(serde_json::Value),
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::MarkRedacted(_) => "mark-redacted",
            StrategyConfig::ReplaceWithRedacted(_) => "replace-with-redacted",
            StrategyConfig::MergeDimensionValues(_) => "merge-dimension-values",
            StrategyConfig::ReduceDimensions(_) => "reduce-dimensions",
            StrategyConfig::FabricateUnitRecords(_) => "fabricate-unit-records",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarkRedactedParams {
    pub redacted_dimension: String,
    #[serde(default)]
    pub non_summable_dimensions: Vec<String>,
    #[serde(default)]
    pub first_order_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplaceWithRedactedParams {
    pub redacted_dimension: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default = "default_masking_value")]
    pub masking_value: String,
    #[serde(default)]
    pub non_summable_dimensions: Vec<String>,
    #[serde(default)]
    pub first_order_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_document() {
        let yaml = r#"
datasource:
  connection_type: file
  parameters: {}
threshold: 11
datasets:
  - name: incidence
    dimensions: [county, month]
    metrics:
      - column: count
        alias: incidence
        aggregation: sum
        is_initial: true
        is_subsequent: true
    output_file: out.csv
    suppression_strategies:
      - strategy: mark-redacted
        redacted_dimension: county
"#;
        let cfg: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.datasets.len(), 1);
        assert_eq!(cfg.datasets[0].suppression_strategies.len(), 1);
        assert_eq!(cfg.datasets[0].suppression_strategies[0].name(), "mark-redacted");
    }

    #[test]
    fn s3_datasource_resolves_bucket_and_prefix_into_uri() {
        let mut parameters = HashMap::new();
        parameters.insert("bucket".to_string(), serde_json::json!("census-bucket"));
        parameters.insert("prefix".to_string(), serde_json::json!("outputs/2024"));
        let datasource = DataSourceConfig {
            connection_type: ConnectionType::S3,
            parameters,
        };
        assert_eq!(
            datasource.resolve_uri("library.csv").unwrap(),
            "s3://census-bucket/outputs/2024/library.csv"
        );
    }

    #[test]
    fn s3_datasource_without_prefix_joins_bucket_directly() {
        let mut parameters = HashMap::new();
        parameters.insert("bucket".to_string(), serde_json::json!("census-bucket"));
        let datasource = DataSourceConfig {
            connection_type: ConnectionType::S3,
            parameters,
        };
        assert_eq!(
            datasource.resolve_uri("library.csv").unwrap(),
            "s3://census-bucket/library.csv"
        );
    }

    #[test]
    fn s3_datasource_requires_bucket_parameter() {
        let datasource = DataSourceConfig {
            connection_type: ConnectionType::S3,
            parameters: HashMap::new(),
        };
        assert!(datasource.resolve_uri("library.csv").is_err());
    }

    #[test]
    fn file_datasource_leaves_path_unchanged() {
        let datasource = DataSourceConfig {
            connection_type: ConnectionType::File,
            parameters: HashMap::new(),
        };
        assert_eq!(datasource.resolve_uri("library.csv").unwrap(), "library.csv");
    }

    #[test]
    fn default_predicate_uses_first_metric_alias() {
        let cfg = PipelineConfig {
            datasource: DataSourceConfig {
                connection_type: ConnectionType::File,
                parameters: HashMap::new(),
            },
            threshold: 11,
            allow_zeroes: true,
            redaction_expression: None,
            datasets: vec![],
        };
        let dataset = DatasetConfig {
            name: "d".into(),
            dimensions: vec!["county".into()],
            unit_level_id: None,
            metrics: vec![MetricConfig {
                column: Some("count".into()),
                alias: Some("incidence".into()),
                aggregation: AggregationKind::Sum,
                null_is_zero: false,
                expression: None,
                is_initial: true,
                is_subsequent: true,
            }],
            sql: None,
            source_file: None,
            output_file: "out.csv".into(),
            redaction_order_dimensions: vec![],
            suppression_strategies: vec![],
        };
        assert_eq!(
            cfg.redaction_predicate_for(&dataset).unwrap(),
            "incidence < 11"
        );
    }
}
