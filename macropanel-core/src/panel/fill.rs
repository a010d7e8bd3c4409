//! Densifying a sparse column onto the daily axis.
//!
//! Rules shared by every method:
//! - cells before the first known value stay missing,
//! - known values are reproduced exactly,
//! - after the last known value the value is held forward, optionally for at
//!   most `forward_limit` days.

use serde::{Deserialize, Serialize};

/// How gaps between two known values are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    /// Straight line between neighbouring known values.
    #[default]
    Linear,
    /// Hold the previous known value (regime flags such as recession indicators).
    Step,
}

/// Fill a column of `len` rows from sorted, unique `(row, value)` knots.
///
/// Knots must be finite and strictly increasing in row; knots at or beyond
/// `len` are ignored.
pub fn fill_column(
    knots: &[(usize, f64)],
    len: usize,
    method: FillMethod,
    forward_limit: Option<usize>,
) -> Vec<f64> {
    let mut out = vec![f64::NAN; len];
    let knots: Vec<(usize, f64)> = knots.iter().copied().filter(|(i, _)| *i < len).collect();

    let Some(&(last_row, last_value)) = knots.last() else {
        return out;
    };

    for pair in knots.windows(2) {
        let (i0, v0) = pair[0];
        let (i1, v1) = pair[1];
        out[i0] = v0;
        let span = (i1 - i0) as f64;
        for (k, cell) in out.iter_mut().enumerate().take(i1).skip(i0 + 1) {
            *cell = match method {
                FillMethod::Linear => v0 + (v1 - v0) * (k - i0) as f64 / span,
                FillMethod::Step => v0,
            };
        }
    }

    let tail_end = match forward_limit {
        Some(limit) => (last_row + 1 + limit).min(len),
        None => len,
    };
    for cell in &mut out[last_row..tail_end] {
        *cell = last_value;
    }

    out
}
