//! Panel builder: sparse per-source observations → one dense daily panel.
//!
//! Steps:
//! 1. Reshape every source into one `(day, column, value, priority)` frame
//!    and drop non-finite values.
//! 2. Resolve duplicate `(date, column)` pairs in bulk. The later write wins,
//!    both within a source (input order) and across sources (priority
//!    order). Both kinds of collision are counted.
//! 3. Place every column on one contiguous daily axis that spans both the
//!    requested range and all observations, so knots outside the range still
//!    anchor interpolation.
//! 4. Fill columns independently (in parallel) and slice to the range.

use super::fill::{fill_column, FillMethod};
use super::{Panel, PanelError};
use crate::domain::{epoch_day, from_epoch_day, SourceBatch};
use chrono::NaiveDate;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Panel construction options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    /// First date of the panel. Defaults to the earliest observation.
    #[serde(default)]
    pub start: Option<NaiveDate>,
    /// Last date of the panel. Defaults to the date passed to `build`.
    #[serde(default)]
    pub end: Option<NaiveDate>,
    /// Fill method for every column not listed in `step_series`.
    #[serde(default)]
    pub fill: FillMethod,
    /// Columns filled with [`FillMethod::Step`] (e.g. `USREC`).
    #[serde(default)]
    pub step_series: Vec<String>,
    /// Maximum days a value is held past its last observation. `None` holds
    /// through the end of the range.
    #[serde(default)]
    pub forward_fill_limit_days: Option<u32>,
}

/// What the builder did, for the run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub sources_used: Vec<String>,
    pub skipped_sources: Vec<String>,
    /// Same `(date, column)` written twice within one source.
    pub duplicate_collisions: BTreeMap<String, usize>,
    /// Cells a source overwrote from an earlier-priority source.
    pub cross_source_overrides: BTreeMap<String, usize>,
    pub dropped_non_finite: usize,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub rows: usize,
    pub columns: usize,
}

/// Built panel plus its report.
#[derive(Debug, Clone)]
pub struct PanelBuild {
    pub panel: Panel,
    pub report: BuildReport,
}

/// Columns sorted by name, each holding `(epoch day, value)` knots in date
/// order.
type SparseColumns = Vec<(String, Vec<(i32, f64)>)>;

pub struct PanelBuilder {
    config: PanelConfig,
    parallel: bool,
}

impl PanelBuilder {
    pub fn new(config: PanelConfig) -> Self {
        Self {
            config,
            parallel: true,
        }
    }

    /// Enables or disables parallel column filling. Parallel filling runs on
    /// the rayon pool the build is called from.
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    /// Build the panel. `today` is the default end of the range.
    pub fn build(
        &self,
        sources: &[SourceBatch],
        today: NaiveDate,
    ) -> Result<PanelBuild, PanelError> {
        let mut report = BuildReport::default();
        let merged = merge_sources(sources, &mut report)?;

        let (min_day, max_day) = observed_span(&merged).ok_or(PanelError::NoObservations)?;
        let start = self.config.start.unwrap_or_else(|| from_epoch_day(min_day));
        let end = self.config.end.unwrap_or(today);
        if start > end {
            return Err(PanelError::InvalidRange { start, end });
        }

        let axis_start = epoch_day(start).min(min_day);
        let axis_end = epoch_day(end).max(max_day);
        let axis_len = (axis_end - axis_start) as usize + 1;
        let lo = (epoch_day(start) - axis_start) as usize;
        let hi = (epoch_day(end) - axis_start) as usize + 1;

        let step: HashSet<&str> = self.config.step_series.iter().map(|s| s.as_str()).collect();
        let limit = self.config.forward_fill_limit_days.map(|d| d as usize);
        let default_fill = self.config.fill;

        let densify = |(name, points): &(String, Vec<(i32, f64)>)| {
            let method = if step.contains(name.as_str()) {
                FillMethod::Step
            } else {
                default_fill
            };
            let knots: Vec<(usize, f64)> = points
                .iter()
                .map(|&(day, v)| ((day - axis_start) as usize, v))
                .collect();
            let full = fill_column(&knots, axis_len, method, limit);
            (name.clone(), full[lo..hi].to_vec())
        };

        let columns: Vec<(String, Vec<f64>)> = if self.parallel {
            merged.par_iter().map(densify).collect()
        } else {
            merged.iter().map(densify).collect()
        };

        let panel = Panel::from_range(start, end)?.with_columns(columns)?;

        report.start = Some(start);
        report.end = Some(end);
        report.rows = panel.len();
        report.columns = panel.width();
        info!(
            rows = report.rows,
            columns = report.columns,
            %start,
            %end,
            "panel built"
        );

        Ok(PanelBuild { panel, report })
    }
}

/// Collapse all sources into sparse columns, applying priority order.
fn merge_sources(
    sources: &[SourceBatch],
    report: &mut BuildReport,
) -> Result<SparseColumns, PanelError> {
    let mut frames = Vec::with_capacity(sources.len());
    for (priority, batch) in sources.iter().enumerate() {
        let finite = batch.finite_len();
        report.dropped_non_finite += batch.len() - finite;
        if finite == 0 {
            warn!(source = %batch.source, "source has no observations, skipping");
            report.skipped_sources.push(batch.source.clone());
            continue;
        }
        report.sources_used.push(batch.source.clone());
        frames.push(
            batch
                .to_frame()?
                .lazy()
                .with_column(lit(priority as u32).cast(DataType::UInt32).alias("priority")),
        );
    }
    if frames.is_empty() {
        return Ok(SparseColumns::new());
    }

    // One row per (column, day, source); the last input row of a source wins.
    let cells = concat(frames, UnionArgs::default())?
        .filter(col("value").is_finite())
        .group_by_stable([col("column"), col("day"), col("priority")])
        .agg([col("value").last(), len().alias("rows")])
        .collect()?;

    let collisions = cells
        .clone()
        .lazy()
        .filter(col("rows").gt(lit(1)))
        .group_by([col("priority")])
        .agg([(col("rows").cast(DataType::Int64) - lit(1i64)).sum().alias("n")])
        .collect()?;
    for (priority, n) in counts_by_priority(&collisions)? {
        let source = &sources[priority].source;
        warn!(source = %source, collisions = n, "duplicate (date, series) rows, last write kept");
        report.duplicate_collisions.insert(source.clone(), n);
    }

    let overrides = cells
        .clone()
        .lazy()
        .filter(
            col("priority").neq(col("priority").min().over([col("column"), col("day")])),
        )
        .group_by([col("priority")])
        .agg([len().cast(DataType::Int64).alias("n")])
        .collect()?;
    for (priority, n) in counts_by_priority(&overrides)? {
        let source = &sources[priority].source;
        warn!(source = %source, overrides = n, "source overrides earlier-priority cells");
        report.cross_source_overrides.insert(source.clone(), n);
    }

    let winners = cells
        .lazy()
        .sort(
            ["column", "day", "priority"],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .unique_stable(
            Some(vec!["column".into(), "day".into()]),
            UniqueKeepStrategy::Last,
        )
        .collect()?;

    let names = winners.column("column")?.str()?;
    let days = winners.column("day")?.i32()?;
    let values = winners.column("value")?.f64()?;
    let mut merged = SparseColumns::new();
    for ((name, day), value) in names
        .into_no_null_iter()
        .zip(days.into_no_null_iter())
        .zip(values.into_no_null_iter())
    {
        if merged.last().map_or(true, |(current, _)| current.as_str() != name) {
            merged.push((name.to_string(), Vec::new()));
        }
        if let Some((_, knots)) = merged.last_mut() {
            knots.push((day, value));
        }
    }
    Ok(merged)
}

/// `(priority, n)` pairs from a frame with `priority` and Int64 `n` columns.
fn counts_by_priority(frame: &DataFrame) -> PolarsResult<Vec<(usize, usize)>> {
    let priority = frame.column("priority")?.u32()?;
    let n = frame.column("n")?.i64()?;
    let mut counts: Vec<(usize, usize)> = priority
        .into_no_null_iter()
        .zip(n.into_no_null_iter())
        .filter(|(_, n)| *n > 0)
        .map(|(p, n)| (p as usize, n as usize))
        .collect();
    counts.sort_unstable();
    Ok(counts)
}

fn observed_span(columns: &SparseColumns) -> Option<(i32, i32)> {
    let first = columns.iter().filter_map(|(_, k)| k.first()).map(|k| k.0).min()?;
    let last = columns.iter().filter_map(|(_, k)| k.last()).map(|k| k.0).max()?;
    Some((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Observation, SourceLayout};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn long(source: &str, rows: &[(&str, &str, f64)]) -> SourceBatch {
        SourceBatch::new(source, SourceLayout::Long).with_observations(
            rows.iter()
                .map(|(date, key, v)| Observation::new(d(date), *key, *v))
                .collect(),
        )
    }

    #[test]
    fn default_range_runs_from_first_observation_to_today() {
        let sources = [long("fred", &[("2024-01-03", "GDP", 1.0), ("2024-01-05", "GDP", 3.0)])];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-08"))
            .unwrap();

        let panel = &build.panel;
        assert_eq!(panel.start(), Some(d("2024-01-03")));
        assert_eq!(panel.end(), Some(d("2024-01-08")));
        assert_eq!(panel.column("GDP").unwrap(), &[1.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn anchors_before_start_still_interpolate() {
        let sources = [long("fred", &[("2024-01-01", "GDP", 0.0), ("2024-01-11", "GDP", 10.0)])];
        let config = PanelConfig {
            start: Some(d("2024-01-06")),
            end: Some(d("2024-01-07")),
            ..Default::default()
        };
        let build = PanelBuilder::new(config).build(&sources, d("2030-01-01")).unwrap();
        assert_eq!(build.panel.column("GDP").unwrap(), &[5.0, 6.0]);
    }

    #[test]
    fn later_source_wins_and_collisions_are_counted() {
        let sources = [
            long(
                "fred",
                &[
                    ("2024-01-01", "X", 1.0),
                    ("2024-01-01", "X", 2.0),
                    ("2024-01-02", "X", 5.0),
                ],
            ),
            long("override", &[("2024-01-02", "X", 9.0)]),
        ];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-02"))
            .unwrap();

        assert_eq!(build.panel.column("X").unwrap(), &[2.0, 9.0]);
        assert_eq!(build.report.duplicate_collisions["fred"], 1);
        assert_eq!(build.report.cross_source_overrides["override"], 1);
    }

    #[test]
    fn empty_sources_are_skipped() {
        let sources = [
            SourceBatch::new("empty", SourceLayout::Long),
            long("fred", &[("2024-01-01", "X", 1.0)]),
        ];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-01"))
            .unwrap();
        assert_eq!(build.report.skipped_sources, vec!["empty".to_string()]);
        assert_eq!(build.report.sources_used, vec!["fred".to_string()]);
    }

    #[test]
    fn source_with_only_non_finite_rows_is_skipped() {
        let sources = [
            long("dead", &[("2024-01-01", "X", f64::NAN)]),
            long("fred", &[("2024-01-01", "Y", 1.0)]),
        ];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-01"))
            .unwrap();
        assert_eq!(build.report.skipped_sources, vec!["dead".to_string()]);
        assert_eq!(build.report.dropped_non_finite, 1);
        assert!(!build.panel.contains("X"));
    }

    #[test]
    fn all_empty_is_an_error() {
        let sources = [SourceBatch::new("empty", SourceLayout::Long)];
        let result = PanelBuilder::new(PanelConfig::default()).build(&sources, d("2024-01-01"));
        assert!(matches!(result, Err(PanelError::NoObservations)));
    }

    #[test]
    fn melted_rows_become_metric_columns() {
        let batch = SourceBatch::new("yahoo", SourceLayout::Melted).with_observations(vec![
            Observation::melted(d("2024-01-01"), "SPY", "open", 470.0),
            Observation::melted(d("2024-01-01"), "SPY", "close", 472.0),
        ]);
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&[batch], d("2024-01-01"))
            .unwrap();
        assert_eq!(
            build.panel.names(),
            &["SPY_close".to_string(), "SPY_open".to_string()]
        );
    }

    #[test]
    fn step_series_and_forward_limit() {
        let sources = [long(
            "fred",
            &[
                ("2024-01-01", "USREC", 0.0),
                ("2024-01-04", "USREC", 1.0),
                ("2024-01-01", "GDP", 10.0),
                ("2024-01-03", "GDP", 30.0),
            ],
        )];
        let config = PanelConfig {
            step_series: vec!["USREC".into()],
            forward_fill_limit_days: Some(1),
            ..Default::default()
        };
        let build = PanelBuilder::new(config).build(&sources, d("2024-01-06")).unwrap();

        assert_eq!(
            &build.panel.column("USREC").unwrap()[..5],
            &[0.0, 0.0, 0.0, 1.0, 1.0]
        );
        assert!(build.panel.column("USREC").unwrap()[5].is_nan());

        let gdp = build.panel.column("GDP").unwrap();
        assert_eq!(&gdp[..4], &[10.0, 20.0, 30.0, 30.0]);
        assert!(gdp[4].is_nan() && gdp[5].is_nan());
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let sources = [long(
            "fred",
            &[("2024-01-01", "X", 1.0), ("2024-01-02", "X", f64::NAN), ("2024-01-03", "X", 3.0)],
        )];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-03"))
            .unwrap();
        assert_eq!(build.report.dropped_non_finite, 1);
        assert_eq!(build.panel.column("X").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn duplicates_resolve_across_many_columns_in_bulk() {
        // Three sources over two columns, with repeats inside and across them.
        let sources = [
            long(
                "fred",
                &[
                    ("2024-01-01", "B", 1.0),
                    ("2024-01-01", "A", 1.0),
                    ("2024-01-01", "A", 2.0),
                    ("2024-01-01", "A", 3.0),
                    ("2024-01-03", "A", 5.0),
                ],
            ),
            long("bls", &[("2024-01-03", "A", 6.0), ("2024-01-03", "B", 8.0)]),
            long("usda", &[("2024-01-03", "A", 7.0), ("2024-01-03", "A", 9.0)]),
        ];
        let build = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-01-03"))
            .unwrap();

        assert_eq!(build.panel.names(), &["A".to_string(), "B".to_string()]);
        assert_eq!(build.panel.column("A").unwrap(), &[3.0, 6.0, 9.0]);
        assert_eq!(build.panel.column("B").unwrap(), &[1.0, 4.5, 8.0]);
        assert_eq!(build.report.duplicate_collisions["fred"], 2);
        assert_eq!(build.report.duplicate_collisions["usda"], 1);
        assert!(!build.report.duplicate_collisions.contains_key("bls"));
        assert_eq!(build.report.cross_source_overrides["bls"], 1);
        assert_eq!(build.report.cross_source_overrides["usda"], 1);
    }

    #[test]
    fn parallel_and_sequential_builds_agree() {
        let sources = [long(
            "fred",
            &[("2024-01-01", "A", 1.0), ("2024-02-01", "A", 4.0), ("2024-01-15", "B", 2.0)],
        )];
        let par = PanelBuilder::new(PanelConfig::default())
            .build(&sources, d("2024-03-01"))
            .unwrap();
        let seq = PanelBuilder::new(PanelConfig::default())
            .with_parallelism(false)
            .build(&sources, d("2024-03-01"))
            .unwrap();
        assert_eq!(
            crate::fingerprint::panel_hash(&par.panel),
            crate::fingerprint::panel_hash(&seq.panel)
        );
    }
}
