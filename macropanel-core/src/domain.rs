//! Raw observation types fed into the panel builder.
//!
//! Sources deliver sparse, irregularly sampled observations in one of two
//! layouts: long `(date, series_key, value)` rows, or melted
//! `(date, series_key, metric, value)` rows where one upstream symbol carries
//! several metrics (open/high/low/close/volume).

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Metric literal that maps a melted row onto the bare series key.
pub const BARE_METRIC: &str = "value";

/// How a source lays out its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayout {
    #[default]
    Long,
    Melted,
}

/// A single raw observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub series_key: String,
    #[serde(default)]
    pub metric: Option<String>,
    pub value: f64,
}

impl Observation {
    pub fn new(date: NaiveDate, series_key: impl Into<String>, value: f64) -> Self {
        Self {
            date,
            series_key: series_key.into(),
            metric: None,
            value,
        }
    }

    pub fn melted(
        date: NaiveDate,
        series_key: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            date,
            series_key: series_key.into(),
            metric: Some(metric.into()),
            value,
        }
    }
}

/// Days since 1970-01-01, the physical encoding of a Polars `Date`.
pub fn epoch_day(date: NaiveDate) -> i32 {
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

pub fn from_epoch_day(day: i32) -> NaiveDate {
    NaiveDate::default() + chrono::Duration::days(i64::from(day))
}

/// Panel column a row lands in.
///
/// `SPY` + `close` becomes `SPY_close`; a metric of `value` (or none, or
/// empty) keeps the bare series key.
pub fn column_key() -> Expr {
    let bare = col("metric")
        .is_null()
        .or(col("metric").eq(lit("")))
        .or(col("metric").eq(lit(BARE_METRIC)));
    when(bare)
        .then(col("series_key"))
        .otherwise(concat_str([col("series_key"), col("metric")], "_", false))
        .alias("column")
}

/// All observations delivered by one named source, stored column-wise.
///
/// Batches are handed to the builder in declared priority order: when two
/// sources write the same `(date, column)`, the later batch wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceBatch {
    pub source: String,
    pub layout: SourceLayout,
    pub dates: Vec<NaiveDate>,
    pub series_keys: Vec<String>,
    pub metrics: Vec<Option<String>>,
    pub values: Vec<f64>,
}

impl SourceBatch {
    pub fn new(source: impl Into<String>, layout: SourceLayout) -> Self {
        Self {
            source: source.into(),
            layout,
            ..Default::default()
        }
    }

    pub fn with_observations(mut self, observations: Vec<Observation>) -> Self {
        self.reserve(observations.len());
        for observation in observations {
            self.push(observation);
        }
        self
    }

    pub fn reserve(&mut self, additional: usize) {
        self.dates.reserve(additional);
        self.series_keys.reserve(additional);
        self.metrics.reserve(additional);
        self.values.reserve(additional);
    }

    pub fn push(&mut self, observation: Observation) {
        self.dates.push(observation.date);
        self.series_keys.push(observation.series_key);
        self.metrics.push(observation.metric);
        self.values.push(observation.value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Rows with a finite value.
    pub fn finite_len(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    /// `(day, column, value)` frame: `day` in [`epoch_day`] encoding and
    /// `column` the resolved panel column key.
    pub fn to_frame(&self) -> PolarsResult<DataFrame> {
        let days: Vec<i32> = self.dates.iter().copied().map(epoch_day).collect();
        DataFrame::new(vec![
            Column::new("day".into(), days),
            Column::new("series_key".into(), self.series_keys.as_slice()),
            Column::new("metric".into(), self.metrics.as_slice()),
            Column::new("value".into(), self.values.as_slice()),
        ])?
        .lazy()
        .select([col("day"), column_key(), col("value")])
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn keys(batch: &SourceBatch) -> Vec<String> {
        let frame = batch.to_frame().unwrap();
        frame
            .column("column")
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn column_keys_follow_layout() {
        let batch = SourceBatch::new("mixed", SourceLayout::Melted).with_observations(vec![
            Observation::new(d("2024-01-02"), "GDP", 1.0),
            Observation::melted(d("2024-01-02"), "SPY", "close", 470.0),
            Observation::melted(d("2024-01-02"), "UNRATE", "value", 3.7),
            Observation::melted(d("2024-01-02"), "DGS10", "", 4.1),
        ]);
        assert_eq!(keys(&batch), vec!["GDP", "SPY_close", "UNRATE", "DGS10"]);
    }

    #[test]
    fn frame_keeps_row_order_and_day_encoding() {
        let batch = SourceBatch::new("fred", SourceLayout::Long).with_observations(vec![
            Observation::new(d("1970-01-02"), "GDP", f64::NAN),
            Observation::new(d("2024-01-01"), "GDP", 2.0),
        ]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.finite_len(), 1);

        let frame = batch.to_frame().unwrap();
        let days: Vec<i32> = frame.column("day").unwrap().i32().unwrap().into_no_null_iter().collect();
        assert_eq!(days, vec![1, epoch_day(d("2024-01-01"))]);
        assert_eq!(from_epoch_day(days[1]), d("2024-01-01"));
    }
}
