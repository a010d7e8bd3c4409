//! Series classification used for feature eligibility.
//!
//! The class comes from the column's metric suffix first (`SPY_close` is a
//! price, `SPY_volume` a volume), then from the registry unit.

use crate::registry::SymbolRegistry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesClass {
    /// Traded prices and price-derived ratios.
    Price,
    /// Interest rates and other percentages.
    Rate,
    Volume,
    /// Binary regime flags such as recession indicators.
    Indicator,
    /// Everything else: economic levels, counts, indices.
    Level,
}

const PRICE_METRICS: [&str; 6] = ["open", "high", "low", "close", "adj_close", "adjclose"];

pub fn classify(column: &str, registry: &SymbolRegistry) -> SeriesClass {
    if let Some((_, metric)) = column.rsplit_once('_') {
        let metric = metric.to_ascii_lowercase();
        if metric == "volume" {
            return SeriesClass::Volume;
        }
        if PRICE_METRICS.contains(&metric.as_str()) {
            return SeriesClass::Price;
        }
    }

    let unit = registry
        .resolve(column)
        .map(|r| r.unit().to_ascii_lowercase())
        .unwrap_or_default();

    if unit.contains("indicator") || unit.contains("binary") || unit.contains("+1 or 0") {
        SeriesClass::Indicator
    } else if unit.contains("percent") || unit == "%" || unit.contains("rate") {
        SeriesClass::Rate
    } else if unit.contains("usd") || unit.contains("dollar") || unit.contains("price") {
        SeriesClass::Price
    } else {
        SeriesClass::Level
    }
}
