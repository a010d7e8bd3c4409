//! Savitzky-Golay smoothing.
//!
//! A polynomial of degree `order` is least-squares fitted to each window of
//! `window` rows. Interior rows take the fitted value (or derivative) at the
//! window centre, which reduces to a fixed convolution. The first and last
//! `window / 2` rows are evaluated on the polynomial fitted to the first and
//! last full window.
//!
//! Only the observed span of the input is filtered. Interior gaps are linearly
//! interpolated first; rows outside the span stay missing. The window is
//! forced odd and shrunk to fit the span.

use super::transforms::{finish, observed_span, TransformError};
use crate::panel::{fill_column, FillMethod};

/// Smooth `values`, returning the `derivative`-th derivative per row
/// (0 = the smoothed series itself).
pub fn savgol(
    values: &[f64],
    window: usize,
    order: usize,
    derivative: usize,
) -> Result<Vec<f64>, TransformError> {
    let (first, last) = observed_span(values).ok_or(TransformError::AllMissing)?;
    let span_len = last - first + 1;

    let mut window = if window % 2 == 0 { window + 1 } else { window };
    if window > span_len {
        window = if span_len % 2 == 1 { span_len } else { span_len - 1 };
    }
    if window <= order {
        return Err(TransformError::WindowTooSmall { window, order });
    }

    let knots: Vec<(usize, f64)> = values[first..=last]
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, v)| (i, *v))
        .collect();
    let span = fill_column(&knots, span_len, FillMethod::Linear, None);

    let filter = SavgolFilter::new(window, order)
        .ok_or(TransformError::WindowTooSmall { window, order })?;
    let smoothed = filter.apply(&span, derivative);

    let mut out = vec![f64::NAN; values.len()];
    out[first..=last].copy_from_slice(&smoothed);
    finish(out)
}

/// Precomputed least-squares projection for one `(window, order)` pair.
struct SavgolFilter {
    window: usize,
    half: usize,
    order: usize,
    /// Abscissa scale: window positions are mapped to `u = (j - half) / scale`
    /// in `[-1, 1]` to keep the normal equations well conditioned.
    scale: f64,
    /// `(order + 1) × window` matrix mapping window values to polynomial
    /// coefficients in `u`.
    projection: Vec<Vec<f64>>,
}

impl SavgolFilter {
    fn new(window: usize, order: usize) -> Option<Self> {
        let half = window / 2;
        let scale = if half == 0 { 1.0 } else { half as f64 };
        let terms = order + 1;

        let design: Vec<Vec<f64>> = (0..window)
            .map(|j| {
                let u = (j as f64 - half as f64) / scale;
                (0..terms).map(|k| u.powi(k as i32)).collect()
            })
            .collect();

        let mut normal = vec![vec![0.0; terms]; terms];
        for row in &design {
            for a in 0..terms {
                for b in 0..terms {
                    normal[a][b] += row[a] * row[b];
                }
            }
        }
        let inverse = invert(normal)?;

        let projection = (0..terms)
            .map(|k| {
                (0..window)
                    .map(|j| (0..terms).map(|m| inverse[k][m] * design[j][m]).sum())
                    .collect()
            })
            .collect();

        Some(Self {
            window,
            half,
            order,
            scale,
            projection,
        })
    }

    fn coefficients(&self, data: &[f64]) -> Vec<f64> {
        self.projection
            .iter()
            .map(|row| row.iter().zip(data).map(|(w, y)| w * y).sum())
            .collect()
    }

    /// `d`-th derivative (per row) of the polynomial `coeffs` at `u`.
    fn evaluate(&self, coeffs: &[f64], u: f64, d: usize) -> f64 {
        if d > self.order {
            return 0.0;
        }
        let mut total = 0.0;
        for (k, c) in coeffs.iter().enumerate().skip(d) {
            let falling: f64 = ((k - d + 1)..=k).map(|x| x as f64).product();
            total += c * falling * u.powi((k - d) as i32);
        }
        total / self.scale.powi(d as i32)
    }

    fn apply(&self, data: &[f64], d: usize) -> Vec<f64> {
        let n = data.len();
        let mut out = vec![0.0; n];

        // Interior: value at the window centre (u = 0) is linear in the data.
        let centre: Vec<f64> = {
            let mut unit = vec![0.0; self.order + 1];
            (0..self.window)
                .map(|j| {
                    unit.iter_mut().enumerate().for_each(|(k, c)| {
                        *c = self.projection[k][j];
                    });
                    self.evaluate(&unit, 0.0, d)
                })
                .collect()
        };
        for i in self.half..n - self.half {
            let window = &data[i - self.half..=i + self.half];
            out[i] = centre.iter().zip(window).map(|(w, y)| w * y).sum();
        }

        // Edges: evaluate the first/last window's polynomial off-centre.
        let head = self.coefficients(&data[..self.window]);
        for (i, cell) in out.iter_mut().enumerate().take(self.half) {
            let u = (i as f64 - self.half as f64) / self.scale;
            *cell = self.evaluate(&head, u, d);
        }
        let tail_start = n - self.window;
        let tail = self.coefficients(&data[tail_start..]);
        for (i, cell) in out.iter_mut().enumerate().skip(n - self.half) {
            let u = ((i - tail_start) as f64 - self.half as f64) / self.scale;
            *cell = self.evaluate(&tail, u, d);
        }

        out
    }
}

/// Gauss-Jordan inversion with partial pivoting. `None` when singular.
fn invert(mut a: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..n {
            a[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}
