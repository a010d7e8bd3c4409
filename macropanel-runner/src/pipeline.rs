//! End-to-end run: staging sources → panel → aggregates → features → outputs.
//!
//! Configuration problems surface before any computation. The registry is
//! committed once per stage and saved only after every artifact has landed.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use macropanel_core::aggregate::{self, AggregateCatalog};
use macropanel_core::domain::SourceBatch;
use macropanel_core::features::{
    ExecutionMode, FeatureCatalog, FeatureEngine, FeatureFilter, FeatureGraph,
};
use macropanel_core::fingerprint::panel_hash;
use macropanel_core::panel::{Panel, PanelBuilder};
use macropanel_core::registry::SymbolRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{PipelineConfig, RunParams};
use crate::history::{HistoryEntry, RunHistory};
use crate::report::{OutputSummary, PipelineReport, SourceSummary};
use crate::staging::{FileSource, ObservationSource, StagingError};
use crate::writer::OutputWriter;

pub const REPORT_JSON: &str = "run_report.json";
pub const REPORT_MARKDOWN: &str = "run_report.md";

/// What `validate` checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub sources: Vec<String>,
    pub missing_files: Vec<String>,
    pub aggregates: usize,
    pub basic_features: usize,
    pub domain_features: usize,
    pub registry_symbols: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    aggregates: AggregateCatalog,
    features: FeatureCatalog,
}

impl Pipeline {
    /// Load catalogs named by the config. Without a feature catalog the
    /// standard Tier-1 set is used; without an aggregate catalog none run.
    pub fn load(config: PipelineConfig) -> Result<Self> {
        let aggregates = match config.aggregates_path() {
            Some(path) => AggregateCatalog::from_file(&path)
                .with_context(|| format!("invalid aggregate catalog {}", path.display()))?,
            None => AggregateCatalog::default(),
        };
        let features = match config.features_path() {
            Some(path) => FeatureCatalog::from_file(&path)
                .with_context(|| format!("invalid feature catalog {}", path.display()))?,
            None => FeatureCatalog::standard(),
        };
        Ok(Self::from_parts(config, aggregates, features))
    }

    pub fn from_parts(
        config: PipelineConfig,
        aggregates: AggregateCatalog,
        features: FeatureCatalog,
    ) -> Self {
        Self {
            config,
            aggregates,
            features,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Check config, catalogs, run parameters, and staging files without
    /// computing anything.
    pub fn validate(&self, params: &RunParams) -> Result<ValidationSummary> {
        self.config.validate()?;
        let selected = self.config.selected_sources(params)?;
        self.config.panel_config(params)?;
        self.config.engine_config(params)?;
        self.aggregates.validate()?;
        self.features.validate()?;

        let registry = SymbolRegistry::load_or_default(&self.config.registry_path())
            .context("failed to load symbol registry")?;

        let staging_dir = self.config.staging_dir();
        let missing_files = selected
            .iter()
            .filter(|s| FileSource::locate(s, &staging_dir).is_err())
            .map(|s| s.name.clone())
            .collect();

        Ok(ValidationSummary {
            sources: selected.iter().map(|s| s.name.clone()).collect(),
            missing_files,
            aggregates: self.aggregates.len(),
            basic_features: self.features.basic.len(),
            domain_features: self.features.domain.len(),
            registry_symbols: registry.len(),
        })
    }

    /// Run against the configured staging files.
    pub fn run(&self, params: &RunParams, now: NaiveDateTime) -> Result<PipelineReport> {
        let staging_dir = self.config.staging_dir();
        let mut sources: Vec<Box<dyn ObservationSource>> = Vec::new();
        let mut missing = Vec::new();
        for source in self.config.selected_sources(params)? {
            match FileSource::locate(source, &staging_dir) {
                Ok(file) => sources.push(Box::new(file)),
                Err(e @ StagingError::NotFound { .. }) => {
                    warn!(source = %source.name, error = %e, "source skipped");
                    missing.push(source.name.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.run_sources(&sources, &missing, params, now)
    }

    /// Run against explicit sources, in priority order. `missing` names
    /// configured sources that had no file.
    pub fn run_sources(
        &self,
        sources: &[Box<dyn ObservationSource>],
        missing: &[String],
        params: &RunParams,
        now: NaiveDateTime,
    ) -> Result<PipelineReport> {
        let clock = Instant::now();
        let panel_config = self.config.panel_config(params)?;
        let engine_config = self.config.engine_config(params)?;
        self.aggregates.validate()?;
        self.features.validate()?;

        let registry_path = self.config.registry_path();
        let mut registry = SymbolRegistry::load_or_default(&registry_path)
            .context("failed to load symbol registry")?;

        // ── Sources ──
        let mut summaries: Vec<SourceSummary> = missing
            .iter()
            .map(|name| SourceSummary {
                name: name.clone(),
                file: None,
                strategy: None,
                observations: 0,
                rejected_rows: 0,
            })
            .collect();
        let mut batches: Vec<SourceBatch> = Vec::with_capacity(sources.len());
        for source in sources {
            let load = source
                .load()
                .with_context(|| format!("failed to load source '{}'", source.name()))?;
            summaries.push(SourceSummary {
                name: source.name().to_string(),
                file: source.location().map(Path::to_path_buf),
                strategy: Some(load.strategy),
                observations: load.batch.len(),
                rejected_rows: load.rejected_rows,
            });
            batches.push(load.batch);
        }

        // ── Panel ──
        let engine = FeatureEngine::new(&engine_config).context("failed to start worker pool")?;
        let parallel = engine_config.mode == ExecutionMode::Parallel;
        let today = now.date();
        let build = engine
            .install(|| {
                PanelBuilder::new(panel_config)
                    .with_parallelism(parallel)
                    .build(&batches, today)
            })
            .context("panel build failed")?;
        let unregistered = unregistered_columns(&build.panel, &registry);
        if !unregistered.is_empty() {
            warn!(
                count = unregistered.len(),
                columns = %unregistered.join(","),
                "panel columns without registry rows"
            );
        }

        // ── Aggregates ──
        let aggregated = aggregate::generate(build.panel, &self.aggregates, &registry)
            .context("aggregate generation failed")?;
        let mut commits = vec![registry.commit("aggregates", aggregated.registry_rows)];

        // ── Features ──
        let filter = FeatureFilter::new(params.features.iter().cloned());
        let graph = FeatureGraph::plan(&aggregated.panel, &registry, &self.features, &filter)
            .context("feature graph planning failed")?;
        info!(
            tier1 = graph.tier1_count(),
            domain = graph.domain_count(),
            workers = engine.workers(),
            "feature graph planned"
        );
        let featured = engine
            .run(aggregated.panel, &graph, &self.features, &registry)
            .context("feature execution failed")?;
        commits.push(registry.commit("features", featured.registry_rows));

        let panel = featured.panel;
        let hash = panel_hash(&panel);

        // ── Outputs ──
        let output_dir = self.config.output_dir();
        let writer = OutputWriter::new(
            &output_dir,
            self.config.staging_dir(),
            self.config.paths.output_name.clone(),
        );
        let wide = writer.write_wide(&panel, now)?;
        let long = writer.write_long(&panel, params.mode, now)?;
        registry
            .save_csv(&registry_path)
            .context("failed to save symbol registry")?;

        let history = RunHistory::new(self.config.history_path());
        let previous_hash = history
            .last()
            .context("failed to read run history")?
            .map(|entry| entry.panel_hash);
        if previous_hash.as_deref() == Some(hash.0.as_str()) {
            info!(hash = %hash, "panel unchanged since previous run");
        }

        let report = PipelineReport {
            run_id: run_id(&self.config, params, now),
            started_at: now,
            duration_secs: clock.elapsed().as_secs_f64(),
            mode: params.mode,
            panel_hash: hash,
            previous_hash,
            sources: summaries,
            panel: build.report,
            aggregates: aggregated.report,
            features: featured.report,
            registry: commits,
            unregistered_columns: unregistered,
            outputs: OutputSummary {
                wide: Some(wide),
                long: Some(long),
                registry: Some(registry_path),
            },
        };

        report.write_json(&output_dir.join(REPORT_JSON))?;
        std::fs::write(output_dir.join(REPORT_MARKDOWN), report.to_markdown())
            .context("failed to write markdown report")?;
        history
            .append(&HistoryEntry::from_report(&report))
            .context("failed to append run history")?;

        info!(
            run_id = %report.run_id,
            hash = %report.panel_hash,
            computed = report.features.computed.len(),
            skipped = report.features.skipped.len(),
            failed = report.features.failed.len(),
            "run complete"
        );
        Ok(report)
    }

    /// Path of the JSON report written by the last run.
    pub fn report_path(&self) -> PathBuf {
        self.config.output_dir().join(REPORT_JSON)
    }
}

/// Base panel columns the registry cannot resolve.
fn unregistered_columns(panel: &Panel, registry: &SymbolRegistry) -> Vec<String> {
    panel
        .names()
        .iter()
        .filter(|name| registry.resolve(name).is_none())
        .cloned()
        .collect()
}

fn run_id(config: &PipelineConfig, params: &RunParams, now: NaiveDateTime) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(now.to_string().as_bytes());
    hasher.update(serde_json::to_string(config).unwrap_or_default().as_bytes());
    hasher.update(serde_json::to_string(params).unwrap_or_default().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}
