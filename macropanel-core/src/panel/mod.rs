//! Dense daily panel: one row per calendar day, one column per series.
//!
//! The date axis is contiguous and strictly increasing. Every cell holds a
//! real or interpolated value, or `NaN` for explicitly missing. Later stages
//! never write into an existing panel; they produce a new one with extra
//! columns via [`Panel::with_columns`].

pub mod builder;
pub mod fill;

pub use builder::{BuildReport, PanelBuild, PanelBuilder, PanelConfig};
pub use fill::{fill_column, FillMethod};

use chrono::NaiveDate;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("no observations in any source")]
    NoObservations,

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("date axis is not contiguous at {date}")]
    NonContiguous { date: NaiveDate },

    #[error("column '{name}' has {actual} rows, panel has {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("observation reshape failed: {0}")]
    Reshape(#[from] polars::prelude::PolarsError),
}

/// The dense date × series matrix.
#[derive(Debug, Clone, Default)]
pub struct Panel {
    dates: Vec<NaiveDate>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    index: HashMap<String, usize>,
}

impl Panel {
    /// Empty panel over an explicit axis. The axis must be gap-free.
    pub fn new(dates: Vec<NaiveDate>) -> Result<Self, PanelError> {
        for pair in dates.windows(2) {
            if pair[0].succ_opt() != Some(pair[1]) {
                return Err(PanelError::NonContiguous { date: pair[1] });
            }
        }
        Ok(Self {
            dates,
            ..Default::default()
        })
    }

    /// Empty panel covering `[start, end]` inclusive.
    pub fn from_range(start: NaiveDate, end: NaiveDate) -> Result<Self, PanelError> {
        if start > end {
            return Err(PanelError::InvalidRange { start, end });
        }
        Ok(Self {
            dates: start.iter_days().take_while(|d| *d <= end).collect(),
            ..Default::default()
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Number of rows (days).
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Row index of a date, if it lies on the axis.
    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        let start = self.start()?;
        let offset = (date - start).num_days();
        usize::try_from(offset).ok().filter(|i| *i < self.len())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.index.get(name).map(|&i| self.columns[i].as_slice())
    }

    /// Columns in panel order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.names
            .iter()
            .zip(&self.columns)
            .map(|(n, c)| (n.as_str(), c.as_slice()))
    }

    /// Value at `(date, name)`; `None` when off-axis or unknown column.
    pub fn value(&self, date: NaiveDate, name: &str) -> Option<f64> {
        let row = self.position(date)?;
        self.column(name).map(|c| c[row])
    }

    /// Count of non-missing cells in a column.
    pub fn observed_count(&self, name: &str) -> usize {
        self.column(name)
            .map(|c| c.iter().filter(|v| !v.is_nan()).count())
            .unwrap_or(0)
    }

    /// New panel with the given columns added. A name that already exists is
    /// replaced at its current position.
    pub fn with_columns(
        mut self,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self, PanelError> {
        for (name, values) in columns {
            if values.len() != self.len() {
                return Err(PanelError::LengthMismatch {
                    name,
                    expected: self.len(),
                    actual: values.len(),
                });
            }
            match self.index.get(&name) {
                Some(&i) => self.columns[i] = values,
                None => {
                    self.index.insert(name.clone(), self.names.len());
                    self.names.push(name);
                    self.columns.push(values);
                }
            }
        }
        Ok(self)
    }

    pub fn with_column(self, name: impl Into<String>, values: Vec<f64>) -> Result<Self, PanelError> {
        self.with_columns([(name.into(), values)])
    }

    /// Rows in `[start, end]`, clamped to the axis.
    pub fn slice(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end).max(lo);
        Self {
            dates: self.dates[lo..hi].to_vec(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c[lo..hi].to_vec()).collect(),
            index: self.index.clone(),
        }
    }

    /// Non-missing cells as `(date, column, value)` in date-major order.
    pub fn observed_cells(&self) -> impl Iterator<Item = (NaiveDate, &str, f64)> + '_ {
        self.dates.iter().enumerate().flat_map(move |(row, date)| {
            self.columns()
                .filter(move |(_, c)| !c[row].is_nan())
                .map(move |(name, c)| (*date, name, c[row]))
        })
    }
}
