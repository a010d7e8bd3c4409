//! Shared helpers for unit tests.

use chrono::NaiveDate;

/// Default epsilon for numeric assertions.
pub const DEFAULT_EPSILON: f64 = 1e-10;

/// Assert two f64 values are approximately equal (within epsilon).
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Every calendar day in `[start, end]`, both `YYYY-MM-DD`.
pub fn daily_dates(start: &str, end: &str) -> Vec<NaiveDate> {
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap();
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap();
    start.iter_days().take_while(|d| *d <= end).collect()
}
