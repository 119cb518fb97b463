use serde::{Deserialize, Serialize};
use std::fmt;

/// Which flavour of the pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Rebuild every layer from the source.
    Full,
    /// Only load rows changed since the previous run.
    Incremental,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Full => "full",
            PipelineMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(PipelineMode::Full),
            "incremental" => Ok(PipelineMode::Incremental),
            other => Err(format!("mode must be 'full' or 'incremental', got '{other}'")),
        }
    }
}

/// Knobs forwarded to the pipeline on every execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Sample-row override for full loads. `None` keeps the pipeline default.
    #[serde(default, alias = "rows")]
    pub rows_override: Option<u32>,
    /// Keep going after a failing script instead of stopping.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Skip SQL validation before executing scripts.
    #[serde(default)]
    pub skip_validation: bool,
}
