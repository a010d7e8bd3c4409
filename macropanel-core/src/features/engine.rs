//! Feature execution over a planned graph.
//!
//! Tier 1 runs first: one task per base series, all reading the same
//! immutable panel and writing only to their own result slot. When every
//! Tier-1 task has returned, successful outputs are merged into a new panel
//! (the tier barrier). Tier-2 waves then run the same way, one merge per wave.
//!
//! A failed or skipped feature is recorded in the report and never aborts its
//! siblings; dependents of a missing feature are skipped.

use super::catalog::{BasicTransform, DomainFeatureDef, DomainTransform, FeatureCatalog};
use super::graph::{BasicUnit, DomainNode, FeatureDescriptor, FeatureGraph};
use super::savgol::savgol;
use super::transforms::{self, finish, TransformError};
use crate::panel::{Panel, PanelError};
use crate::registry::{
    SymbolRecord, SymbolRegistry, DEFAULT_UNIT, SOURCE_DOMAIN_FEATURE, SOURCE_FEATURE,
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Panel(#[from] PanelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads. `None` uses one per available core.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

/// A feature that was not computed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureIssue {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureReport {
    pub computed: Vec<String>,
    pub skipped: Vec<FeatureIssue>,
    pub failed: Vec<FeatureIssue>,
}

impl FeatureReport {
    pub fn is_skipped(&self, name: &str) -> bool {
        self.skipped.iter().any(|i| i.name == name)
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.failed.iter().any(|i| i.name == name)
    }
}

/// Extended panel, report, and registry rows pending commit.
#[derive(Debug, Clone)]
pub struct FeatureRun {
    pub panel: Panel,
    pub report: FeatureReport,
    pub registry_rows: Vec<SymbolRecord>,
}

/// Outcome of one feature inside a task.
enum Outcome {
    Computed(Vec<f64>),
    Skipped(String),
    Failed(TransformError),
}

pub struct FeatureEngine {
    pool: Option<rayon::ThreadPool>,
}

impl FeatureEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let pool = match config.mode {
            ExecutionMode::Sequential => None,
            ExecutionMode::Parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.workers.unwrap_or(0))
                    .thread_name(|i| format!("feature-worker-{i}"))
                    .build()?,
            ),
        };
        Ok(Self { pool })
    }

    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// Run `op` inside the worker pool, so any rayon work it starts is
    /// bounded by the configured worker count. Runs inline without a pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Run every task, in the pool when there is one. Results keep task order.
    fn run_tasks<T, R, F>(&self, tasks: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| tasks.par_iter().map(&f).collect()),
            None => tasks.iter().map(f).collect(),
        }
    }

    pub fn run(
        &self,
        panel: Panel,
        graph: &FeatureGraph,
        catalog: &FeatureCatalog,
        registry: &SymbolRegistry,
    ) -> Result<FeatureRun, EngineError> {
        let mut report = FeatureReport::default();
        let mut registry_rows = Vec::new();

        // ── Tier 1 ──
        let results = {
            let panel = &panel;
            self.run_tasks(&graph.units, |unit| run_unit(panel, unit, catalog))
        };

        let mut merged = Vec::new();
        for (unit, outcomes) in graph.units.iter().zip(results) {
            let descriptors = unit.tasks.iter().flat_map(|t| &t.outputs);
            for (descriptor, outcome) in descriptors.zip(outcomes) {
                let name = descriptor.output.clone();
                match outcome {
                    Outcome::Computed(values) => {
                        registry_rows.push(basic_record(descriptor, catalog, registry));
                        report.computed.push(name.clone());
                        merged.push((name, values));
                    }
                    Outcome::Skipped(reason) => report.skipped.push(FeatureIssue { name, reason }),
                    Outcome::Failed(err) => {
                        warn!(feature = %name, base = %unit.base, error = %err, "feature failed");
                        report.failed.push(FeatureIssue {
                            name,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
        let mut panel = panel.with_columns(merged)?;
        info!(
            computed = report.computed.len(),
            failed = report.failed.len(),
            workers = self.workers(),
            "tier 1 complete"
        );

        // ── Tier 2 ──
        for wave in &graph.waves {
            let results = {
                let panel = &panel;
                self.run_tasks(wave, |node| run_domain(panel, node))
            };

            let mut merged = Vec::new();
            for (node, outcome) in wave.iter().zip(results) {
                let name = node.def.name.clone();
                match outcome {
                    Outcome::Computed(values) => {
                        registry_rows.push(domain_record(&node.def));
                        report.computed.push(name.clone());
                        merged.push((name, values));
                    }
                    Outcome::Skipped(reason) => {
                        warn!(feature = %name, %reason, "domain feature skipped");
                        report.skipped.push(FeatureIssue { name, reason });
                    }
                    Outcome::Failed(err) => {
                        warn!(feature = %name, error = %err, "domain feature failed");
                        report.failed.push(FeatureIssue {
                            name,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            panel = panel.with_columns(merged)?;
        }

        info!(
            computed = report.computed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "feature graph complete"
        );

        Ok(FeatureRun {
            panel,
            report,
            registry_rows,
        })
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

/// Outcomes for every output of `unit`, in descriptor order.
fn run_unit(panel: &Panel, unit: &BasicUnit, catalog: &FeatureCatalog) -> Vec<Outcome> {
    let Some(values) = panel.column(&unit.base) else {
        let reason = format!("base series '{}' not in panel", unit.base);
        return unit
            .tasks
            .iter()
            .flat_map(|t| &t.outputs)
            .map(|_| Outcome::Skipped(reason.clone()))
            .collect();
    };

    let mut out = Vec::new();
    for task in &unit.tasks {
        let transform = &catalog.basic[task.spec].transform;
        let results = apply_basic(transform, panel.dates(), values, task.outputs.len());
        out.extend(results.into_iter().map(|result| match result {
            Ok(v) => Outcome::Computed(v),
            Err(e) => Outcome::Failed(e),
        }));
    }
    out
}

/// Results for one catalog entry, one per emitted output.
fn apply_basic(
    transform: &BasicTransform,
    dates: &[NaiveDate],
    values: &[f64],
    outputs: usize,
) -> Vec<Result<Vec<f64>, TransformError>> {
    match *transform {
        BasicTransform::YearOverYear { years } => {
            vec![transforms::year_over_year(dates, values, years)]
        }
        BasicTransform::Log => vec![transforms::natural_log(values)],
        BasicTransform::MovingAverage { days } => vec![transforms::moving_average(values, days)],
        BasicTransform::Smooth { window, order, .. } => (0..outputs)
            .map(|derivative| savgol(values, window, order, derivative))
            .collect(),
    }
}

fn run_domain(panel: &Panel, node: &DomainNode) -> Outcome {
    if !node.unresolved.is_empty() {
        return Outcome::Skipped(format!(
            "input(s) never produced: {}",
            node.unresolved.join(", ")
        ));
    }
    let missing: Vec<&str> = node
        .def
        .inputs
        .iter()
        .filter(|i| !panel.contains(i))
        .map(|i| i.as_str())
        .collect();
    if !missing.is_empty() {
        return Outcome::Skipped(format!("input(s) not computed: {}", missing.join(", ")));
    }

    let inputs: Vec<&[f64]> = node
        .def
        .inputs
        .iter()
        .filter_map(|i| panel.column(i))
        .collect();
    if inputs
        .iter()
        .any(|c| transforms::observed_span(c).is_none())
    {
        return Outcome::Failed(TransformError::AllMissing);
    }

    let result = match node.def.transform {
        DomainTransform::Difference => finish(transforms::difference(inputs[0], inputs[1])),
        DomainTransform::Sum => finish(transforms::sum(&inputs)),
        DomainTransform::Ratio { scale } => finish(transforms::ratio(inputs[0], inputs[1], scale)),
        DomainTransform::Scale { factor } => finish(transforms::scale(inputs[0], factor)),
        DomainTransform::Signal { threshold } => finish(transforms::signal(inputs[0], threshold)),
        DomainTransform::Smooth {
            window,
            order,
            derivative,
        } => savgol(inputs[0], window, order, derivative),
        DomainTransform::PctChange => finish(transforms::pct_change(inputs[0])),
        DomainTransform::Compound => finish(transforms::compound(inputs[0])),
        DomainTransform::Accumulate => finish(transforms::accumulate(inputs[0])),
        DomainTransform::RecessionInit {
            lead_months,
            lag_months,
        } => finish(transforms::recession_initiation(
            panel.dates(),
            inputs[0],
            lead_months,
            lag_months,
        )),
        DomainTransform::RecessionInitSmooth {
            window,
            order,
            jitter,
        } => transforms::recession_initiation_smooth(
            panel.dates(),
            inputs[0],
            window,
            order,
            jitter,
            &node.def.name,
        ),
    };
    match result {
        Ok(values) => Outcome::Computed(values),
        Err(e) => Outcome::Failed(e),
    }
}

// ── Registry rows ────────────────────────────────────────────────────

fn basic_record(
    descriptor: &FeatureDescriptor,
    catalog: &FeatureCatalog,
    registry: &SymbolRegistry,
) -> SymbolRecord {
    let resolved = registry.resolve(&descriptor.base);
    let base_description = resolved
        .map(|r| r.description())
        .unwrap_or_else(|| descriptor.base.clone());
    let base_unit = resolved
        .map(|r| r.unit().to_string())
        .unwrap_or_else(|| DEFAULT_UNIT.to_string());

    let transform = &catalog.basic[descriptor.spec].transform;
    let (label, unit) = match transform {
        BasicTransform::YearOverYear { .. } => (transform.label(), "Fraction".to_string()),
        BasicTransform::Log => (transform.label(), format!("log({base_unit})")),
        BasicTransform::MovingAverage { .. } => (transform.label(), base_unit),
        BasicTransform::Smooth { .. } if descriptor.derivative => (
            format!("First derivative of {}", transform.label().to_lowercase()),
            format!("{base_unit} per day"),
        ),
        BasicTransform::Smooth { .. } => (transform.label(), base_unit),
    };

    SymbolRecord::new(
        descriptor.output.clone(),
        SOURCE_FEATURE,
        format!("{label} of {base_description}"),
        unit,
    )
}

fn domain_record(def: &DomainFeatureDef) -> SymbolRecord {
    SymbolRecord::new(
        def.name.clone(),
        SOURCE_DOMAIN_FEATURE,
        def.registry_description(),
        def.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()),
    )
}
