//! Compilation configuration.
//!
//! Everything the middle-end reads from the outside world: the
//! optimization level, explicit pass overrides, the size of the shared
//! scratchpad and a few numeric tuning knobs. The configuration can be
//! built in code or loaded from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Coarse optimization level. Each level enables a fixed default set of
/// passes, see `optimization::Optimizer::is_enabled`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    None,
    Basic,
    #[default]
    Medium,
    Full,
}

/// Numeric tuning options shared by several passes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalOptions {
    /// Maximum lookback/lookahead distance (in instructions) for common
    /// subexpression elimination and the bit-operation peephole.
    pub max_common_expression_distance: u32,
    /// Upper bound on fixpoint iterations of the optimization pipeline.
    pub max_optimization_iterations: u32,
    /// Largest private/constant object (in bytes) lowered into a single
    /// vector register.
    pub register_lowering_limit_bytes: u32,
}

impl Default for AdditionalOptions {
    fn default() -> Self {
        Self {
            max_common_expression_distance: 64,
            max_optimization_iterations: 16,
            register_lowering_limit_bytes: 64,
        }
    }
}

/// Compilation configuration consumed by the normalization and
/// optimization stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub optimization_level: OptimizationLevel,
    /// Pass names enabled on top of the level defaults.
    pub additional_enabled_optimizations: Vec<String>,
    /// Pass names disabled even if the level enables them.
    pub additional_disabled_optimizations: Vec<String>,
    /// Usable scratchpad (VPM) size in bytes.
    pub available_scratchpad_size: u32,
    pub additional_options: AdditionalOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::default(),
            additional_enabled_optimizations: Vec::new(),
            additional_disabled_optimizations: Vec::new(),
            available_scratchpad_size: 4096,
            additional_options: AdditionalOptions::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Configuration {
    pub fn with_level(level: OptimizationLevel) -> Self {
        Self {
            optimization_level: level,
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn enable(mut self, pass: &str) -> Self {
        self.additional_disabled_optimizations.retain(|p| p != pass);
        self.additional_enabled_optimizations.push(pass.to_string());
        self
    }

    pub fn disable(mut self, pass: &str) -> Self {
        self.additional_enabled_optimizations.retain(|p| p != pass);
        self.additional_disabled_optimizations.push(pass.to_string());
        self
    }
}
