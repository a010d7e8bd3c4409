//! Two-tier feature graph.
//!
//! - `catalog`: declarative feature definitions (TOML-loadable)
//! - `classify`: series classes that drive Tier-1 eligibility
//! - `graph`: planning, collision and cycle checks, Tier-2 waves
//! - `engine`: bounded worker pool execution with per-feature isolation
//! - `transforms` / `savgol`: the column math

pub mod catalog;
pub mod classify;
pub mod engine;
pub mod graph;
pub mod savgol;
pub mod transforms;

pub use catalog::{
    BasicFeatureSpec, BasicTransform, DomainFeatureDef, DomainTransform, Eligibility,
    FeatureCatalog,
};
pub use classify::{classify, SeriesClass};
pub use engine::{
    EngineConfig, EngineError, ExecutionMode, FeatureEngine, FeatureIssue, FeatureReport,
    FeatureRun,
};
pub use graph::{FeatureDescriptor, FeatureFilter, FeatureGraph};
pub use transforms::TransformError;
