//! `aurora.toml` project configuration.
//!
//! Searched in the current directory, then each ancestor. Missing file means
//! defaults; command-line flags override whatever is found.

use aurora_vm::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "aurora.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {message}")]
    Io { path: String, message: String },
    #[error("invalid toml in '{path}': {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AuroraConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub modules: ModulesSection,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_steps: Option<u64>,
    /// Set to 0 to turn collection off.
    pub gc_threshold: Option<usize>,
    pub trace_instructions: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            max_steps: defaults.max_steps,
            gc_threshold: defaults.gc_threshold,
            trace_instructions: defaults.trace_instructions,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct ModulesSection {
    /// Extra roots for `import` and `fork` module paths, relative to the
    /// config file.
    pub search_path: Vec<PathBuf>,
}

impl AuroraConfig {
    /// Load the nearest `aurora.toml`, or defaults when there is none.
    pub fn load() -> Result<(Option<PathBuf>, Self), ConfigError> {
        let Ok(mut dir) = std::env::current_dir() else {
            return Ok((None, Self::default()));
        };
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                let config = Self::load_from(&candidate)?;
                return Ok((Some(candidate), config));
            }
            if !dir.pop() {
                return Ok((None, Self::default()));
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io { path: path.display().to_string(), message: e.to_string() })?;
        let mut config = Self::parse(&content)
            .map_err(|message| ConfigError::Parse { path: path.display().to_string(), message })?;
        if let Some(base) = path.parent() {
            config.modules.search_path =
                config.modules.search_path.iter().map(|p| if p.is_relative() { base.join(p) } else { p.clone() }).collect();
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// The VM configuration this file describes.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_steps: self.runtime.max_steps,
            gc_threshold: self.runtime.gc_threshold.filter(|t| *t > 0),
            trace_instructions: self.runtime.trace_instructions,
            search_path: self.modules.search_path.clone(),
        }
    }
}
