pub mod aggregation;
pub mod cell;
pub mod engine_settings;
pub mod error;
pub mod identifier;
pub mod kernel;
pub mod materializer;
pub mod metric;
pub mod orchestrator;
pub mod pipeline_config;
pub mod query_result;
pub mod substrate;

pub use cell::Cell;
pub use engine_settings::EngineSettings;
pub use error::{Result, TesseraError};
pub use orchestrator::Orchestrator;
pub use pipeline_config::PipelineConfig;

/// Load a pipeline document and run it to completion: every configured
/// dataset is aggregated, suppressed per its declared strategies, and
/// written to its output file.
pub fn run_pipeline_file<P: AsRef<std::path::Path>>(path: P) -> Result<()> {
    let pipeline = PipelineConfig::from_file(path)?;
    let settings = EngineSettings::load_default();
    let orchestrator = Orchestrator::new(settings)?;
    orchestrator.run_pipeline(&pipeline)
}
