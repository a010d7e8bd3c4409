//! Staging observation sources.
//!
//! Each source is one file in the staging directory holding `date`,
//! `series_key` (or `symbol` / `series_id`), an optional `metric`, and
//! `value`. Files are read through an ordered list of format strategies;
//! dates through an ordered list of formats. Rows that cannot be read are
//! counted and dropped, never fatal.

use chrono::{NaiveDate, NaiveDateTime};
use macropanel_core::domain::{Observation, SourceBatch, SourceLayout};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SourceConfig;

/// Accepted names for the series key column, in lookup order.
const SERIES_KEY_ALIASES: [&str; 3] = ["series_key", "symbol", "series_id"];

/// Date cell formats, in the order they are tried.
pub const DATE_FORMATS: [&str; 4] = [
    "%Y-%m-%d",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y",
];

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("no staging file for source '{source_name}' in {dir}")]
    NotFound { source_name: String, dir: PathBuf },

    #[error("{path}: missing column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("{path}: every read strategy failed: {}", format_attempts(.attempts))]
    Unreadable {
        path: PathBuf,
        attempts: Vec<StrategyFailure>,
    },
}

fn format_attempts(attempts: &[StrategyFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// File formats a staging file may be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
    Parquet,
    Csv,
}

impl fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parquet => write!(f, "parquet"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

impl ReadStrategy {
    /// Strategies for `path`, the one matching its extension first.
    pub fn order_for(path: &Path) -> [ReadStrategy; 2] {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => [Self::Csv, Self::Parquet],
            _ => [Self::Parquet, Self::Csv],
        }
    }
}

/// One strategy's failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub strategy: ReadStrategy,
    pub reason: String,
}

/// Parse a date cell with the first matching format.
pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(cell, fmt)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(cell, fmt).ok().map(|dt| dt.date()))
    })
}

/// A loaded source plus the rows it had to drop.
#[derive(Debug, Clone)]
pub struct SourceLoad {
    pub batch: SourceBatch,
    pub strategy: ReadStrategy,
    pub rejected_rows: usize,
}

/// Anything that can deliver one source's observations.
pub trait ObservationSource: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self) -> Result<SourceLoad, StagingError>;

    /// Where the observations come from, when that is a file.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// A staging file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    name: String,
    layout: SourceLayout,
    path: PathBuf,
}

impl FileSource {
    pub fn new(name: impl Into<String>, layout: SourceLayout, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            layout,
            path: path.into(),
        }
    }

    /// Locate the file for a configured source: the declared file, else
    /// `{name}.parquet`, else `{name}.csv`.
    pub fn locate(config: &SourceConfig, staging_dir: &Path) -> Result<Self, StagingError> {
        let candidates: Vec<PathBuf> = match &config.file {
            Some(file) => vec![staging_dir.join(file)],
            None => vec![
                staging_dir.join(format!("{}.parquet", config.name)),
                staging_dir.join(format!("{}.csv", config.name)),
            ],
        };
        candidates
            .into_iter()
            .find(|p| p.is_file())
            .map(|path| Self::new(config.name.clone(), config.layout, path))
            .ok_or_else(|| StagingError::NotFound {
                source_name: config.name.clone(),
                dir: staging_dir.to_path_buf(),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObservationSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn load(&self) -> Result<SourceLoad, StagingError> {
        let mut attempts = Vec::new();
        for strategy in ReadStrategy::order_for(&self.path) {
            let rows = match strategy {
                ReadStrategy::Parquet => read_parquet(&self.path, self.layout),
                ReadStrategy::Csv => read_csv(&self.path, self.layout),
            };
            match rows {
                Ok(Rows {
                    observations,
                    rejected,
                }) => {
                    if rejected > 0 {
                        warn!(
                            source = %self.name,
                            rejected,
                            "dropped unreadable staging rows"
                        );
                    }
                    debug!(
                        source = %self.name,
                        %strategy,
                        rows = observations.len(),
                        "staging file loaded"
                    );
                    return Ok(SourceLoad {
                        batch: SourceBatch::new(self.name.clone(), self.layout)
                            .with_observations(observations),
                        strategy,
                        rejected_rows: rejected,
                    });
                }
                Err(ReadFailure::Fatal(e)) => return Err(e),
                Err(ReadFailure::Format(reason)) => {
                    debug!(source = %self.name, %strategy, %reason, "read strategy failed");
                    attempts.push(StrategyFailure { strategy, reason });
                }
            }
        }
        Err(StagingError::Unreadable {
            path: self.path.clone(),
            attempts,
        })
    }
}

struct Rows {
    observations: Vec<Observation>,
    rejected: usize,
}

enum ReadFailure {
    /// The file is not in this format; try the next strategy.
    Format(String),
    /// The file is in this format but unusable.
    Fatal(StagingError),
}

fn missing(path: &Path, column: &str) -> ReadFailure {
    ReadFailure::Fatal(StagingError::MissingColumn {
        path: path.to_path_buf(),
        column: column.to_string(),
    })
}

fn build_observation(
    layout: SourceLayout,
    date: Option<NaiveDate>,
    key: Option<&str>,
    metric: Option<&str>,
    value: Option<f64>,
) -> Option<Observation> {
    let (date, key, value) = (date?, key?, value?);
    if key.is_empty() {
        return None;
    }
    match layout {
        SourceLayout::Long => Some(Observation::new(date, key, value)),
        SourceLayout::Melted => Some(Observation::melted(date, key, metric?, value)),
    }
}

// ── Parquet ──────────────────────────────────────────────────────────

fn read_parquet(path: &Path, layout: SourceLayout) -> Result<Rows, ReadFailure> {
    let format = |e: PolarsError| ReadFailure::Format(e.to_string());

    let file = fs::File::open(path).map_err(|e| ReadFailure::Format(e.to_string()))?;
    let df = ParquetReader::new(file).finish().map_err(format)?;

    let dates = df.column("date").map_err(|_| missing(path, "date"))?;
    let dates = parquet_dates(dates).map_err(format)?;

    let key_name = SERIES_KEY_ALIASES
        .iter()
        .find(|name| df.column(name).is_ok())
        .ok_or_else(|| missing(path, "series_key"))?;
    let keys = df
        .column(key_name)
        .and_then(|c| c.cast(&DataType::String))
        .map_err(format)?;
    let keys = keys.str().map_err(format)?;

    let metrics = match layout {
        SourceLayout::Melted => {
            let column = df.column("metric").map_err(|_| missing(path, "metric"))?;
            Some(column.cast(&DataType::String).map_err(format)?)
        }
        SourceLayout::Long => None,
    };
    let metrics = metrics.as_ref().map(|c| c.str()).transpose().map_err(format)?;

    let values = df
        .column("value")
        .map_err(|_| missing(path, "value"))?
        .cast(&DataType::Float64)
        .map_err(format)?;
    let values = values.f64().map_err(format)?;

    let mut observations = Vec::with_capacity(df.height());
    let mut rejected = 0;
    for (i, date) in dates.into_iter().enumerate() {
        let metric = metrics.and_then(|m| m.get(i));
        match build_observation(layout, date, keys.get(i), metric, values.get(i)) {
            Some(obs) => observations.push(obs),
            None => rejected += 1,
        }
    }
    Ok(Rows {
        observations,
        rejected,
    })
}

/// Dates from a Date, Datetime, or string column.
fn parquet_dates(column: &Column) -> PolarsResult<Vec<Option<NaiveDate>>> {
    if column.dtype() == &DataType::String {
        let strings = column.str()?;
        return Ok(strings.into_iter().map(|s| s.and_then(parse_date)).collect());
    }

    let column = column.cast(&DataType::Date)?;
    let days = column.date()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    Ok((0..column.len())
        .map(|i| days.get(i).map(|d| epoch + chrono::Duration::days(d as i64)))
        .collect())
}

// ── CSV ──────────────────────────────────────────────────────────────

fn read_csv(path: &Path, layout: SourceLayout) -> Result<Rows, ReadFailure> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| ReadFailure::Format(e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReadFailure::Format(e.to_string()))?
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    let find = |name: &str| headers.iter().position(|h| h == name);

    // A binary file decodes as garbage headers rather than failing outright.
    let date_idx = find("date").ok_or_else(|| {
        ReadFailure::Format(format!("no 'date' header among {} columns", headers.len()))
    })?;
    let key_idx = SERIES_KEY_ALIASES
        .iter()
        .find_map(|name| find(name))
        .ok_or_else(|| missing(path, "series_key"))?;
    let value_idx = find("value").ok_or_else(|| missing(path, "value"))?;
    let metric_idx = match layout {
        SourceLayout::Melted => Some(find("metric").ok_or_else(|| missing(path, "metric"))?),
        SourceLayout::Long => None,
    };

    let mut observations = Vec::new();
    let mut rejected = 0;
    for record in reader.records() {
        let Ok(record) = record else {
            rejected += 1;
            continue;
        };
        let date = record.get(date_idx).and_then(parse_date);
        let key = record.get(key_idx);
        let metric = metric_idx.and_then(|i| record.get(i));
        let value = record.get(value_idx).and_then(|v| v.parse::<f64>().ok());
        match build_observation(layout, date, key, metric, value) {
            Some(obs) => observations.push(obs),
            None => rejected += 1,
        }
    }
    Ok(Rows {
        observations,
        rejected,
    })
}
