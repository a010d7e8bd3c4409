//! Output artifacts.
//!
//! Layout:
//! - `{output_dir}/{name}_{YYYYMMDD_HHMMSS}.parquet`: wide panel, one per run
//! - `{output_dir}/{name}.parquet`: copy of the newest wide panel
//! - `{staging_dir}/long/part-{YYYYMMDD_HHMMSS}.parquet`: `(date, symbol, value)`
//! - `{staging_dir}/long/_watermark.json`: last date appended, live parts
//!
//! Every file is written to `.tmp` and renamed into place, so a failed run
//! leaves the previous artifacts untouched.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use macropanel_core::domain::epoch_day;
use macropanel_core::panel::Panel;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::RunMode;

const LONG_DIR: &str = "long";
const WATERMARK_FILE: &str = "_watermark.json";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Progress marker for the long-format store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Latest date present in the live parts.
    pub last_date: NaiveDate,
    /// Live part file names, oldest first.
    pub parts: Vec<String>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideArtifact {
    pub versioned: PathBuf,
    pub latest: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongArtifact {
    /// The part written this run, if any rows qualified.
    pub part: Option<PathBuf>,
    pub rows: usize,
    /// Parts removed by a full rewrite.
    pub retired: Vec<PathBuf>,
    pub watermark: Option<NaiveDate>,
}

pub struct OutputWriter {
    output_dir: PathBuf,
    long_dir: PathBuf,
    name: String,
}

impl OutputWriter {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        staging_dir: impl AsRef<Path>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            long_dir: staging_dir.as_ref().join(LONG_DIR),
            name: name.into(),
        }
    }

    /// Path of the stable "latest" wide artifact.
    pub fn latest_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.parquet", self.name))
    }

    pub fn long_dir(&self) -> &Path {
        &self.long_dir
    }

    // ── Wide ─────────────────────────────────────────────────────────

    /// Write the versioned wide artifact, then swap it in as "latest".
    pub fn write_wide(&self, panel: &Panel, stamp: NaiveDateTime) -> Result<WideArtifact> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.output_dir.display())
        })?;

        let mut df = wide_frame(panel).context("failed to build wide frame")?;
        let versioned = unique_path(
            &self.output_dir,
            &format!("{}_{}", self.name, stamp.format(STAMP_FORMAT)),
            "parquet",
        );
        write_parquet_atomic(&mut df, &versioned)?;

        let latest = self.latest_path();
        let tmp = tmp_path(&latest);
        fs::copy(&versioned, &tmp)
            .with_context(|| format!("failed to stage {}", tmp.display()))?;
        rename_into_place(&tmp, &latest)?;

        info!(
            path = %versioned.display(),
            rows = df.height(),
            columns = panel.width(),
            "wide artifact written"
        );
        Ok(WideArtifact {
            versioned,
            latest,
            rows: df.height(),
            columns: panel.width(),
        })
    }

    // ── Long ─────────────────────────────────────────────────────────

    pub fn read_watermark(&self) -> Result<Option<Watermark>> {
        let path = self.long_dir.join(WATERMARK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let watermark = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(watermark))
    }

    /// Append observed cells as a new part.
    ///
    /// Full mode writes every cell and retires the older parts. Incremental
    /// mode writes only cells dated after the watermark.
    pub fn write_long(
        &self,
        panel: &Panel,
        mode: RunMode,
        stamp: NaiveDateTime,
    ) -> Result<LongArtifact> {
        fs::create_dir_all(&self.long_dir)
            .with_context(|| format!("failed to create {}", self.long_dir.display()))?;

        let previous = self.read_watermark()?;
        let cutoff = match mode {
            RunMode::Full => None,
            RunMode::Incremental => previous.as_ref().map(|w| w.last_date),
        };

        let (mut df, last_date) = long_frame(panel, cutoff).context("failed to build long frame")?;
        let Some(last_date) = last_date else {
            if mode == RunMode::Full {
                warn!("panel has no observed cells; long store left unchanged");
            } else {
                info!(watermark = ?cutoff, "no rows past watermark");
            }
            return Ok(LongArtifact {
                part: None,
                rows: 0,
                retired: Vec::new(),
                watermark: previous.map(|w| w.last_date),
            });
        };

        let part = unique_path(
            &self.long_dir,
            &format!("part-{}", stamp.format(STAMP_FORMAT)),
            "parquet",
        );
        write_parquet_atomic(&mut df, &part)?;
        let part_name = file_name(&part);

        let (parts, last_date) = match mode {
            RunMode::Full => (vec![part_name.clone()], last_date),
            RunMode::Incremental => {
                let mut parts = previous.as_ref().map(|w| w.parts.clone()).unwrap_or_default();
                parts.push(part_name.clone());
                let last = previous
                    .as_ref()
                    .map_or(last_date, |w| w.last_date.max(last_date));
                (parts, last)
            }
        };

        // The new part only goes live with its watermark; older parts are
        // retired after that.
        let watermark = Watermark {
            last_date,
            parts,
            updated_at: stamp,
        };
        if let Err(e) = self.write_watermark(&watermark) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        let retired = match mode {
            RunMode::Full => self.retire_parts_except(&part_name)?,
            RunMode::Incremental => Vec::new(),
        };

        info!(
            part = %part.display(),
            rows = df.height(),
            %mode,
            retired = retired.len(),
            %last_date,
            "long part written"
        );
        Ok(LongArtifact {
            part: Some(part),
            rows: df.height(),
            retired,
            watermark: Some(last_date),
        })
    }

    /// Live long parts on disk, oldest first.
    pub fn long_parts(&self) -> Result<Vec<PathBuf>> {
        if !self.long_dir.exists() {
            return Ok(Vec::new());
        }
        let mut parts: Vec<PathBuf> = fs::read_dir(&self.long_dir)
            .with_context(|| format!("failed to list {}", self.long_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_part(p))
            .collect();
        parts.sort();
        Ok(parts)
    }

    fn retire_parts_except(&self, keep: &str) -> Result<Vec<PathBuf>> {
        let mut retired = Vec::new();
        for path in self.long_parts()? {
            if file_name(&path) == keep {
                continue;
            }
            fs::remove_file(&path)
                .with_context(|| format!("failed to retire {}", path.display()))?;
            retired.push(path);
        }
        Ok(retired)
    }

    fn write_watermark(&self, watermark: &Watermark) -> Result<()> {
        let path = self.long_dir.join(WATERMARK_FILE);
        let json =
            serde_json::to_string_pretty(watermark).context("failed to serialize watermark")?;
        let tmp = tmp_path(&path);
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        rename_into_place(&tmp, &path)
    }
}

// ── Frames ───────────────────────────────────────────────────────────

fn date_column(dates: impl Iterator<Item = NaiveDate>) -> PolarsResult<Column> {
    let days: Vec<i32> = dates.map(epoch_day).collect();
    Column::new("date".into(), days).cast(&DataType::Date)
}

/// `date` plus one nullable Float64 column per panel column.
pub fn wide_frame(panel: &Panel) -> PolarsResult<DataFrame> {
    let mut columns = Vec::with_capacity(panel.width() + 1);
    columns.push(date_column(panel.dates().iter().copied())?);
    for (name, values) in panel.columns() {
        let values: Vec<Option<f64>> = values.iter().map(|v| (!v.is_nan()).then_some(*v)).collect();
        columns.push(Column::new(name.into(), values));
    }
    DataFrame::new(columns)
}

/// `(date, symbol, value)` rows for observed cells dated after `cutoff`,
/// plus the latest date emitted.
fn long_frame(
    panel: &Panel,
    cutoff: Option<NaiveDate>,
) -> PolarsResult<(DataFrame, Option<NaiveDate>)> {
    let tail = cutoff.map(|c| panel.slice(c.succ_opt().unwrap_or(NaiveDate::MAX), NaiveDate::MAX));
    let panel = tail.as_ref().unwrap_or(panel);

    let mut dates = Vec::new();
    let mut symbols = Vec::new();
    let mut values = Vec::new();
    for (date, name, value) in panel.observed_cells() {
        dates.push(date);
        symbols.push(name);
        values.push(value);
    }
    let last = dates.last().copied();
    let df = DataFrame::new(vec![
        date_column(dates.into_iter())?,
        Column::new("symbol".into(), symbols),
        Column::new("value".into(), values),
    ])?;
    Ok((df, last))
}

// ── File helpers ─────────────────────────────────────────────────────

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_part(path: &Path) -> bool {
    let name = file_name(path);
    name.starts_with("part-") && name.ends_with(".parquet")
}

/// `{dir}/{stem}.{ext}`, or `{stem}-N.{ext}` if that is taken.
fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn rename_into_place(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        anyhow::anyhow!("atomic rename to {} failed: {e}", path.display())
    })
}

fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    let file =
        fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    if let Err(e) = ParquetWriter::new(file).finish(df) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to write {}", tmp.display()));
    }
    rename_into_place(&tmp, path)
}
