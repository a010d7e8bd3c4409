//! macropanel runner: pipeline orchestration on top of `macropanel-core`.
//!
//! This crate provides:
//! - TOML pipeline config and per-run parameters
//! - Staging-file observation sources (Parquet, then CSV)
//! - Atomic wide/long Parquet output with a long-store watermark
//! - JSON/Markdown run report and JSONL run history
//! - The end-to-end `Pipeline`

pub mod config;
pub mod history;
pub mod pipeline;
pub mod report;
pub mod staging;
pub mod writer;

pub use config::{PipelineConfig, PipelineConfigError, RunMode, RunParams, SourceConfig};
pub use history::{HistoryEntry, RunHistory};
pub use pipeline::{Pipeline, ValidationSummary};
pub use report::{PipelineReport, SourceSummary};
pub use staging::{FileSource, ObservationSource, ReadStrategy, SourceLoad, StagingError};
pub use writer::{LongArtifact, OutputWriter, WideArtifact, Watermark};
