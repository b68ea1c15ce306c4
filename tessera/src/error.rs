use thiserror::Error;

pub type Result<T> = std::result::Result<T, TesseraError>;

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("sql generation error: {0}")]
    Sql(String),
    #[error("substrate error: {0}")]
    Substrate(String),
    #[error("strategy '{0}' is not implemented")]
    UnimplementedStrategy(String),
    #[error("suppression kernel failed to reach a fixed point for dataset '{dataset}' after {iterations} iterations")]
    FixedPointDivergence { dataset: String, iterations: usize },
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
