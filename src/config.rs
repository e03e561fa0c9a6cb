//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (FIELDPIPE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [optimizer]
//! verbose_optimizer = true
//! filter_adjoint_merging = false
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! FIELDPIPE_OPTIMIZER__VERBOSE_OPTIMIZER=true
//! FIELDPIPE_LOGGING__LEVEL=trace
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Optimizer configuration.
///
/// The `enabled` flag short-circuits the whole pipeline; the per-pass flags
/// let a test harness bypass individual passes. The three merging flags
/// gate promotion of the matching convolution vector mode to its fused
/// block-reduce-sum variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Master switch for the whole optimizer
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log the improvement count of every pass
    #[serde(default)]
    pub verbose_optimizer: bool,

    /// Log every individual kernel merge
    #[serde(default)]
    pub verbose_kernel_merging: bool,

    /// Log the final circuit after optimization
    #[serde(default)]
    pub print_circuit: bool,

    #[serde(default = "default_true")]
    pub project_frame_merging: bool,

    #[serde(default = "default_true")]
    pub back_project_frame_merging: bool,

    #[serde(default = "default_true")]
    pub filter_adjoint_merging: bool,

    /// Allow the tiled local-memory convolution variant
    #[serde(default)]
    pub tiled_convolve_enable: bool,

    #[serde(default = "default_true")]
    pub enable_dead_kernel_removal: bool,

    #[serde(default = "default_true")]
    pub enable_redundant_input_removal: bool,

    #[serde(default = "default_true")]
    pub enable_common_subexpression: bool,

    #[serde(default = "default_true")]
    pub enable_transform_transpose: bool,

    /// Gates the stand-alone tensor-reduce collapsing pass. The driver
    /// does not schedule that pass; the flag only applies when an embedder
    /// runs it directly.
    #[serde(default = "default_true")]
    pub enable_tensor_reduce: bool,

    #[serde(default = "default_true")]
    pub enable_project_frame_reduce: bool,

    #[serde(default = "default_true")]
    pub enable_kernel_merging: bool,

    #[serde(default = "default_true")]
    pub enable_multi_output_merging: bool,

    #[serde(default = "default_true")]
    pub enable_reshape_removal: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            enabled: true,
            verbose_optimizer: false,
            verbose_kernel_merging: false,
            print_circuit: false,
            project_frame_merging: true,
            back_project_frame_merging: true,
            filter_adjoint_merging: true,
            tiled_convolve_enable: false,
            enable_dead_kernel_removal: true,
            enable_redundant_input_removal: true,
            enable_common_subexpression: true,
            enable_transform_transpose: true,
            enable_tensor_reduce: true,
            enable_project_frame_reduce: true,
            enable_kernel_merging: true,
            enable_multi_output_merging: true,
            enable_reshape_removal: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (FIELDPIPE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("FIELDPIPE_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FIELDPIPE_").split("__"))
            .extract()
    }
}

/// Install the global tracing subscriber per the logging configuration.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let already_set = if config.format == "json" {
        builder.json().try_init().is_err()
    } else {
        builder.try_init().is_err()
    };
    if already_set {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.optimizer.enabled);
        assert!(!config.optimizer.verbose_optimizer);
        assert!(config.optimizer.project_frame_merging);
        assert!(!config.optimizer.tiled_convolve_enable);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        // Verify it contains expected sections
        assert!(toml_str.contains("[optimizer]"));
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("filter_adjoint_merging"));
    }
}
