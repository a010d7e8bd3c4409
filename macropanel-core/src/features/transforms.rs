//! Column transforms. Inputs and outputs are full-length panel columns with
//! `NaN` for missing; every function is pure.

use super::savgol::savgol;
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single feature could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransformError {
    #[error("input has no observed values")]
    AllMissing,

    #[error("insufficient history: need {needed} rows, have {available}")]
    InsufficientHistory { needed: usize, available: usize },

    #[error("result has no finite values")]
    NoFiniteOutput,

    #[error("window {window} does not exceed polynomial order {order}")]
    WindowTooSmall { window: usize, order: usize },
}

/// Rows from the first to the last observed value, inclusive.
pub fn observed_span(values: &[f64]) -> Option<(usize, usize)> {
    let first = values.iter().position(|v| !v.is_nan())?;
    let last = values.iter().rposition(|v| !v.is_nan())?;
    Some((first, last))
}

/// Reject outputs with no finite cell; map infinities to missing.
pub fn finish(mut values: Vec<f64>) -> Result<Vec<f64>, TransformError> {
    let mut any = false;
    for v in &mut values {
        if v.is_finite() {
            any = true;
        } else {
            *v = f64::NAN;
        }
    }
    if any {
        Ok(values)
    } else {
        Err(TransformError::NoFiniteOutput)
    }
}

// ── Tier 1 ───────────────────────────────────────────────────────────

/// Calendar-anchored change: `value[t] / value[t - N years] - 1`.
///
/// The anchor is the same calendar day `years` earlier (Feb 29 anchors on
/// Feb 28). The axis is gap-free, so the anchor row is found by day offset.
pub fn year_over_year(
    dates: &[NaiveDate],
    values: &[f64],
    years: u32,
) -> Result<Vec<f64>, TransformError> {
    let (first, last) = observed_span(values).ok_or(TransformError::AllMissing)?;

    let mut out = vec![f64::NAN; values.len()];
    let mut any = false;
    for (t, date) in dates.iter().enumerate() {
        let current = values[t];
        if current.is_nan() {
            continue;
        }
        let Some(anchor) = date.checked_sub_months(Months::new(12 * years)) else {
            continue;
        };
        let Ok(offset) = usize::try_from((*date - anchor).num_days()) else {
            continue;
        };
        if offset > t {
            continue;
        }
        let prior = values[t - offset];
        if prior.is_nan() || prior == 0.0 {
            continue;
        }
        out[t] = current / prior - 1.0;
        any = true;
    }

    if !any {
        return Err(TransformError::InsufficientHistory {
            needed: 366 * years as usize,
            available: last - first + 1,
        });
    }
    finish(out)
}

/// `ln(value)`; non-positive inputs give missing.
pub fn natural_log(values: &[f64]) -> Result<Vec<f64>, TransformError> {
    observed_span(values).ok_or(TransformError::AllMissing)?;
    finish(
        values
            .iter()
            .map(|&v| if v > 0.0 { v.ln() } else { f64::NAN })
            .collect(),
    )
}

/// Trailing simple mean over `days` rows. A window containing a missing
/// cell yields missing.
pub fn moving_average(values: &[f64], days: usize) -> Result<Vec<f64>, TransformError> {
    let (first, last) = observed_span(values).ok_or(TransformError::AllMissing)?;
    let available = last - first + 1;
    if days == 0 || available < days {
        return Err(TransformError::InsufficientHistory {
            needed: days,
            available,
        });
    }

    let n = values.len();
    let mut out = vec![f64::NAN; n];
    let mut sum = 0.0;
    let mut missing = 0usize;

    for i in 0..n {
        let entering = values[i];
        if entering.is_nan() {
            missing += 1;
        } else {
            sum += entering;
        }
        if i >= days {
            let leaving = values[i - days];
            if leaving.is_nan() {
                missing -= 1;
            } else {
                sum -= leaving;
            }
        }
        if i + 1 >= days && missing == 0 {
            out[i] = sum / days as f64;
        }
        // Drop accumulated rounding whenever the window is empty of values.
        if missing == days.min(i + 1) {
            sum = 0.0;
        }
    }

    finish(out)
}

// ── Tier 2 ───────────────────────────────────────────────────────────

fn zip_map(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| if x.is_nan() || y.is_nan() { f64::NAN } else { f(x, y) })
        .collect()
}

pub fn difference(a: &[f64], b: &[f64]) -> Vec<f64> {
    zip_map(a, b, |x, y| x - y)
}

pub fn ratio(a: &[f64], b: &[f64], scale: f64) -> Vec<f64> {
    zip_map(a, b, |x, y| if y == 0.0 { f64::NAN } else { x / y * scale })
}

/// Element-wise sum; missing if any input is missing.
pub fn sum(inputs: &[&[f64]]) -> Vec<f64> {
    let rows = inputs.first().map_or(0, |c| c.len());
    (0..rows)
        .map(|i| inputs.iter().map(|c| c[i]).sum::<f64>())
        .collect()
}

pub fn scale(a: &[f64], factor: f64) -> Vec<f64> {
    a.iter().map(|v| v * factor).collect()
}

/// `1.0` where the input exceeds `threshold`, `0.0` otherwise.
pub fn signal(a: &[f64], threshold: f64) -> Vec<f64> {
    a.iter()
        .map(|&v| {
            if v.is_nan() {
                f64::NAN
            } else if v > threshold {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// `a[t] / a[t-1] - 1`.
pub fn pct_change(a: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; a.len()];
    for t in 1..a.len() {
        let (prev, cur) = (a[t - 1], a[t]);
        if !prev.is_nan() && !cur.is_nan() && prev != 0.0 {
            out[t] = cur / prev - 1.0;
        }
    }
    out
}

/// Running product of `1 + r`, skipping missing returns.
pub fn compound(r: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    r.iter()
        .map(|&x| {
            if x.is_nan() {
                f64::NAN
            } else {
                acc *= 1.0 + x;
                acc
            }
        })
        .collect()
}

/// `1 + Σ r` over returns after the first observed one.
pub fn accumulate(r: &[f64]) -> Vec<f64> {
    let mut acc: Option<f64> = None;
    r.iter()
        .map(|&x| {
            if x.is_nan() {
                return f64::NAN;
            }
            let next = match acc {
                None => 1.0,
                Some(total) => total + x,
            };
            acc = Some(next);
            next
        })
        .collect()
}

/// Recession initiation windows over a 0/1 recession indicator.
///
/// Every 0 to 1 transition starts a recession. Its initiation window runs
/// strictly between `lead_months` and `lag_months` before the first of the
/// start month. Rows inside any window are `1`, other rows within the
/// indicator's observed span are `0`, and rows outside it stay missing.
pub fn recession_initiation(
    dates: &[NaiveDate],
    indicator: &[f64],
    lead_months: u32,
    lag_months: u32,
) -> Vec<f64> {
    let mut out = vec![f64::NAN; indicator.len()];
    let Some((first, last)) = observed_span(indicator) else {
        return out;
    };
    out[first..=last].fill(0.0);

    let mut previous: Option<f64> = None;
    for t in first..=last {
        let current = indicator[t];
        if current.is_nan() {
            continue;
        }
        let starts = previous.is_some_and(|p| p < 0.5) && current >= 0.5;
        previous = Some(current);
        if !starts {
            continue;
        }
        let Some(month) = NaiveDate::from_ymd_opt(dates[t].year(), dates[t].month(), 1) else {
            continue;
        };
        let (Some(open), Some(close)) = (
            month.checked_sub_months(Months::new(lead_months)),
            month.checked_sub_months(Months::new(lag_months)),
        ) else {
            continue;
        };
        let lo = dates.partition_point(|d| *d <= open).max(first);
        let hi = dates.partition_point(|d| *d < close).min(last + 1);
        if lo < hi {
            out[lo..hi].fill(1.0);
        }
    }
    out
}

/// Day count within each run of `1`s, `0` outside runs.
fn run_counter(indicator: &[f64]) -> Vec<f64> {
    let mut count = 0.0;
    indicator
        .iter()
        .map(|&v| {
            if v.is_nan() {
                count = 0.0;
                f64::NAN
            } else if v >= 0.5 {
                count += 1.0;
                count
            } else {
                count = 0.0;
                0.0
            }
        })
        .collect()
}

/// Deterministic noise in `[-1, 1)` keyed by `seed` and the row's date.
fn jitter_at(seed: &str, date: NaiveDate) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed.as_bytes());
    hasher.update(&date.num_days_from_ce().to_le_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    let unit = (u64::from_le_bytes(word) >> 11) as f64 / (1u64 << 53) as f64;
    2.0 * unit - 1.0
}

/// Smoothed recession-initiation ramp on a `0..=1` scale.
///
/// The day counter inside each initiation window is Savitzky-Golay
/// smoothed, negatives are clipped to zero and the result is divided by its
/// peak. `jitter` adds noise of at most that amplitude, reproducible from
/// `seed` so reruns give identical values.
pub fn recession_initiation_smooth(
    dates: &[NaiveDate],
    initiation: &[f64],
    window: usize,
    order: usize,
    jitter: f64,
    seed: &str,
) -> Result<Vec<f64>, TransformError> {
    let mut out = savgol(&run_counter(initiation), window, order, 0)?;
    for v in &mut out {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
    let peak = out
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0_f64, |m, &v| m.max(v));
    for (v, date) in out.iter_mut().zip(dates) {
        if v.is_nan() {
            continue;
        }
        *v = if peak > 0.0 { *v / peak } else { 0.0 };
        if jitter > 0.0 {
            *v += jitter * jitter_at(seed, *date);
        }
    }
    finish(out)
}
