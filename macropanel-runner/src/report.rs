//! End-of-run report: JSON for machines, Markdown for people.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use macropanel_core::aggregate::AggregateReport;
use macropanel_core::features::FeatureReport;
use macropanel_core::fingerprint::PanelHash;
use macropanel_core::panel::BuildReport;
use macropanel_core::registry::UpsertSummary;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RunMode;
use crate::staging::ReadStrategy;
use crate::writer::{LongArtifact, WideArtifact};

/// How one staging source loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub name: String,
    pub file: Option<PathBuf>,
    pub strategy: Option<ReadStrategy>,
    pub observations: usize,
    pub rejected_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub wide: Option<WideArtifact>,
    pub long: Option<LongArtifact>,
    pub registry: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub started_at: NaiveDateTime,
    pub duration_secs: f64,
    pub mode: RunMode,
    pub panel_hash: PanelHash,
    /// Panel hash of the previous recorded run, if any.
    #[serde(default)]
    pub previous_hash: Option<String>,
    pub sources: Vec<SourceSummary>,
    pub panel: BuildReport,
    pub aggregates: AggregateReport,
    pub features: FeatureReport,
    /// One entry per stage commit, in order.
    pub registry: Vec<UpsertSummary>,
    /// Panel columns with no registry row.
    pub unregistered_columns: Vec<String>,
    pub outputs: OutputSummary,
}

impl PipelineReport {
    /// Write pretty JSON via `.tmp` + rename.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize run report")?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move report into {}", path.display()))?;
        Ok(())
    }

    pub fn to_markdown(&self) -> String {
        let range = match (self.panel.start, self.panel.end) {
            (Some(s), Some(e)) => format!("{s} → {e}"),
            _ => "n/a".to_string(),
        };
        let mut md = format!(
            "# macropanel Run Report\n\n\
Run ID: `{}`\n\n\
## Summary\n\
- Mode: {}\n\
- Range: {}\n\
- Panel: {} rows × {} columns\n\
- Panel hash: `{}`{}\n\
- Aggregates: {} computed, {} skipped\n\
- Features: {} computed, {} skipped, {} failed\n\
- Duration: {:.1}s\n",
            self.run_id,
            self.mode,
            range,
            self.panel.rows,
            self.panel.columns,
            self.panel_hash,
            match &self.previous_hash {
                Some(prev) if *prev == self.panel_hash.0 => " (unchanged)",
                Some(_) => " (changed)",
                None => "",
            },
            self.aggregates.computed.len(),
            self.aggregates.skipped.len(),
            self.features.computed.len(),
            self.features.skipped.len(),
            self.features.failed.len(),
            self.duration_secs,
        );

        md.push_str("\n## Sources\n\n");
        md.push_str("| Source | Format | Observations | Rejected |\n");
        md.push_str("|--------|--------|--------------|----------|\n");
        for s in &self.sources {
            let format = s.strategy.map_or("-".to_string(), |f| f.to_string());
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                s.name, format, s.observations, s.rejected_rows
            );
        }

        let overrides: usize = self.panel.cross_source_overrides.values().sum();
        let collisions: usize = self.panel.duplicate_collisions.values().sum();
        if overrides + collisions + self.panel.dropped_non_finite > 0 {
            md.push_str("\n## Input Defects\n\n");
            let _ = writeln!(md, "- Within-source duplicates: {collisions}");
            let _ = writeln!(md, "- Cross-source overrides: {overrides}");
            let _ = writeln!(md, "- Non-finite values dropped: {}", self.panel.dropped_non_finite);
        }

        if !self.aggregates.skipped.is_empty() {
            md.push_str("\n## Skipped Aggregates\n\n");
            for s in &self.aggregates.skipped {
                let _ = writeln!(md, "- `{}`: {}", s.name, s.reason);
            }
        }

        if !self.features.failed.is_empty() {
            md.push_str("\n## Failed Features\n\n");
            for f in &self.features.failed {
                let _ = writeln!(md, "- `{}`: {}", f.name, f.reason);
            }
        }

        if !self.features.skipped.is_empty() {
            md.push_str("\n## Skipped Features\n\n");
            for f in &self.features.skipped {
                let _ = writeln!(md, "- `{}`: {}", f.name, f.reason);
            }
        }

        if !self.registry.is_empty() {
            md.push_str("\n## Registry\n\n");
            md.push_str("| Stage | Inserted | Replaced | Unchanged |\n");
            md.push_str("|-------|----------|----------|-----------|\n");
            for r in &self.registry {
                let _ = writeln!(
                    md,
                    "| {} | {} | {} | {} |",
                    r.stage, r.inserted, r.replaced, r.unchanged
                );
            }
            if !self.unregistered_columns.is_empty() {
                let _ = writeln!(
                    md,
                    "\nUnregistered columns: {}",
                    self.unregistered_columns.join(", ")
                );
            }
        }

        md
    }
}
