//! Pipeline configuration (`pipeline.toml`) and per-run parameters.
//!
//! Relative paths in the file resolve against the directory that holds it.

use chrono::NaiveDate;
use macropanel_core::domain::SourceLayout;
use macropanel_core::features::{EngineConfig, ExecutionMode};
use macropanel_core::panel::PanelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline config: {0}")]
    Parse(String),

    #[error("no sources declared")]
    NoSources,

    #[error("source '{name}' declared twice")]
    DuplicateSource { name: String },

    #[error("unknown source '{name}' in source filter")]
    UnknownSource { name: String },

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("worker count must be at least 1")]
    ZeroWorkers,
}

/// Filesystem locations used by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one observation file per source, and the `long/`
    /// output parts.
    pub staging_dir: PathBuf,
    /// Directory for the wide artifact, reports and history.
    pub output_dir: PathBuf,
    /// Symbol catalog CSV.
    pub registry: PathBuf,
    #[serde(default)]
    pub aggregates: Option<PathBuf>,
    #[serde(default)]
    pub features: Option<PathBuf>,
    /// Run history JSONL. Defaults to `{output_dir}/history.jsonl`.
    #[serde(default)]
    pub history: Option<PathBuf>,
    /// Stem of the wide artifact: `{output_name}.parquet`.
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

fn default_output_name() -> String {
    "macro_panel".to_string()
}

/// One staging source, in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub layout: SourceLayout,
    /// File name inside the staging directory. When absent,
    /// `{name}.parquet` and `{name}.csv` are looked up.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl PipelineConfig {
    /// Load from a TOML file. Relative paths resolve against its directory.
    pub fn from_file(path: &Path) -> Result<Self, PipelineConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| PipelineConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Parse from TOML. Relative paths resolve against the working directory.
    pub fn from_toml(content: &str) -> Result<Self, PipelineConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| PipelineConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        if self.sources.is_empty() {
            return Err(PipelineConfigError::NoSources);
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(PipelineConfigError::DuplicateSource {
                    name: source.name.clone(),
                });
            }
        }
        if let (Some(start), Some(end)) = (self.panel.start, self.panel.end) {
            if start > end {
                return Err(PipelineConfigError::InvalidRange { start, end });
            }
        }
        if self.engine.workers == Some(0) {
            return Err(PipelineConfigError::ZeroWorkers);
        }
        Ok(())
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve(&self.paths.staging_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.paths.output_dir)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve(&self.paths.registry)
    }

    pub fn aggregates_path(&self) -> Option<PathBuf> {
        self.paths.aggregates.as_deref().map(|p| self.resolve(p))
    }

    pub fn features_path(&self) -> Option<PathBuf> {
        self.paths.features.as_deref().map(|p| self.resolve(p))
    }

    pub fn history_path(&self) -> PathBuf {
        match &self.paths.history {
            Some(path) => self.resolve(path),
            None => self.output_dir().join("history.jsonl"),
        }
    }

    /// Sources selected by `params`, in declared order.
    pub fn selected_sources(
        &self,
        params: &RunParams,
    ) -> Result<Vec<&SourceConfig>, PipelineConfigError> {
        if let Some(unknown) = params
            .sources
            .iter()
            .find(|name| !self.sources.iter().any(|s| &s.name == *name))
        {
            return Err(PipelineConfigError::UnknownSource {
                name: unknown.clone(),
            });
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| params.sources.is_empty() || params.sources.contains(&s.name))
            .collect())
    }

    /// Panel options with the run's date overrides applied.
    pub fn panel_config(&self, params: &RunParams) -> Result<PanelConfig, PipelineConfigError> {
        let mut panel = self.panel.clone();
        if params.start.is_some() {
            panel.start = params.start;
        }
        if params.end.is_some() {
            panel.end = params.end;
        }
        if let (Some(start), Some(end)) = (panel.start, panel.end) {
            if start > end {
                return Err(PipelineConfigError::InvalidRange { start, end });
            }
        }
        Ok(panel)
    }

    /// Engine options with the run's worker overrides applied.
    pub fn engine_config(&self, params: &RunParams) -> Result<EngineConfig, PipelineConfigError> {
        let mut engine = self.engine.clone();
        if let Some(workers) = params.workers {
            if workers == 0 {
                return Err(PipelineConfigError::ZeroWorkers);
            }
            engine.workers = Some(workers);
        }
        if params.sequential {
            engine.mode = ExecutionMode::Sequential;
        }
        Ok(engine)
    }
}

/// How the long-format artifact is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Write every observed cell and retire older parts.
    #[default]
    Full,
    /// Append only rows dated after the stored watermark.
    Incremental,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Per-run overrides, usually from CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub mode: RunMode,
    pub workers: Option<usize>,
    pub sequential: bool,
    /// Restrict to these sources. Empty means all.
    pub sources: Vec<String>,
    /// Restrict feature outputs to these names plus their dependencies.
    pub features: Vec<String>,
}
