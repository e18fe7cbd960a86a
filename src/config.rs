use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::flatten::FlattenOptions;

/// Tables to seed before the analysis pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Table name -> paths routed to it
    pub root_tables: IndexMap<String, Vec<String>>,

    /// Root tables gathering the same structure from several paths
    pub combined_tables: IndexMap<String, Vec<String>>,

    /// Maximum schema nesting followed while building columns
    pub max_depth: usize,

    /// Rows kept per table as a preview of each representation
    pub preview_rows: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            root_tables: IndexMap::new(),
            combined_tables: IndexMap::new(),
            max_depth: 16,
            preview_rows: 20,
        }
    }
}

impl AnalysisConfig {
    pub fn with_root(mut self, name: impl Into<String>, paths: &[&str]) -> Self {
        self.root_tables
            .insert(name.into(), paths.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_combined(mut self, name: impl Into<String>, paths: &[&str]) -> Self {
        self.combined_tables
            .insert(name.into(), paths.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// Everything a conversion run needs besides its inputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub analysis: AnalysisConfig,
    pub flatten: FlattenOptions,
}

impl PipelineConfig {
    /// Reads a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}
