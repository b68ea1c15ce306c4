//! Ambient, infrastructure-only settings for the engine.
//!
//! This is deliberately separate from the pipeline document (`pipeline_config`):
//! it carries operational defaults the privacy semantics never need to know
//! about, such as query timeouts and the fixed-point safety cap.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root ambient configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    pub query: QuerySettings,
    pub kernel: KernelSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            query: QuerySettings::default(),
            kernel: KernelSettings::default(),
        }
    }
}

/// Query execution defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Suppression-kernel operational defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Multiplier applied to row count to derive the fixed-point safety cap
    /// (default: 4). Exceeding it is always a bug, never user error.
    pub divergence_cap_multiplier: usize,
    /// Whether a dataset's output table is retained in the substrate's
    /// catalog for downstream datasets in the same process (default: false).
    pub cache_tables_in_memory: bool,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            divergence_cap_multiplier: 4,
            cache_tables_in_memory: false,
        }
    }
}

impl EngineSettings {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load from default locations (env var, cwd, or built-in defaults).
    ///
    /// Search order:
    /// 1. `TESSERA_CONFIG` environment variable
    /// 2. `./tessera.toml` (current directory)
    /// 3. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("TESSERA_CONFIG") {
            if let Ok(cfg) = Self::from_file(&path) {
                tracing::info!(path = %path, "loaded engine settings from TESSERA_CONFIG");
                return cfg;
            }
        }

        if let Ok(cfg) = Self::from_file("tessera.toml") {
            tracing::info!("loaded engine settings from ./tessera.toml");
            return cfg;
        }

        tracing::debug!("no engine settings file found, using defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let cfg = EngineSettings::default();
        assert_eq!(cfg.query.timeout_ms, 30_000);
        assert_eq!(cfg.kernel.divergence_cap_multiplier, 4);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[query]
timeout_ms = 60000

[kernel]
divergence_cap_multiplier = 8
cache_tables_in_memory = true
"#;
        let cfg = EngineSettings::from_toml(toml).unwrap();
        assert_eq!(cfg.query.timeout_ms, 60_000);
        assert_eq!(cfg.kernel.divergence_cap_multiplier, 8);
        assert!(cfg.kernel.cache_tables_in_memory);
    }
}
