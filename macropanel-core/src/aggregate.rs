//! Aggregate series: declared cross-series columns computed from the panel.
//!
//! Definitions live in a catalog and are evaluated in declaration order, so a
//! definition may use any aggregate declared before it. Every operation is
//! element-wise over the panel rows: a missing operand on a date gives a
//! missing result on that date, never a zero.

use crate::error::ConfigError;
use crate::panel::{Panel, PanelError};
use crate::registry::{SymbolRecord, SymbolRegistry, DEFAULT_UNIT, SOURCE_COMPUTED};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Panel(#[from] PanelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    /// `a / b`
    Ratio,
    /// `a - b`
    Difference,
    /// `a / (b / base)`, deflating by an index quoted against `base`.
    Normalize,
    /// `(a - b) / c`, with `c` defaulting to `b`.
    Spread,
    Sum,
    Mean,
    Product,
}

impl AggregateOp {
    /// Accepted operand count as `(min, max)`.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Ratio | Self::Difference | Self::Normalize => (2, Some(2)),
            Self::Spread => (2, Some(3)),
            Self::Sum | Self::Mean | Self::Product => (2, None),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ratio => "ratio",
            Self::Difference => "difference",
            Self::Normalize => "normalize",
            Self::Spread => "spread",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Product => "product",
        }
    }
}

/// One declared aggregate column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDef {
    pub name: String,
    pub op: AggregateOp,
    pub operands: Vec<String>,
    /// Multiplier applied to the result. Defaults to 1.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Index base for `normalize`. Defaults to 100.
    #[serde(default)]
    pub base: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl AggregateDef {
    pub fn new(name: impl Into<String>, op: AggregateOp, operands: &[&str]) -> Self {
        Self {
            name: name.into(),
            op,
            operands: operands.iter().map(|s| s.to_string()).collect(),
            scale: None,
            base: None,
            description: None,
            unit: None,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = Some(base);
        self
    }

    fn scale(&self) -> f64 {
        self.scale.unwrap_or(1.0)
    }

    fn base(&self) -> f64 {
        self.base.unwrap_or(100.0)
    }

    /// Human-readable formula, e.g. `(BUSLOANS / GDP) * 100`.
    pub fn formula(&self) -> String {
        let ops = &self.operands;
        let core = match self.op {
            AggregateOp::Ratio => format!("{} / {}", ops[0], ops[1]),
            AggregateOp::Difference => format!("{} - {}", ops[0], ops[1]),
            AggregateOp::Normalize => format!("{} / ({} / {})", ops[0], ops[1], self.base()),
            AggregateOp::Spread => {
                let denom = ops.get(2).unwrap_or(&ops[1]);
                format!("({} - {}) / {denom}", ops[0], ops[1])
            }
            AggregateOp::Sum => ops.join(" + "),
            AggregateOp::Mean => format!("mean({})", ops.join(", ")),
            AggregateOp::Product => ops.join(" * "),
        };
        let scale = self.scale();
        if scale == 1.0 {
            core
        } else {
            format!("({core}) * {scale}")
        }
    }

    /// Registry description: the declared text (if any) plus the formula.
    pub fn registry_description(&self) -> String {
        match &self.description {
            Some(text) => format!("{text} [{}]", self.formula()),
            None => self.formula(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = self.op.arity();
        let n = self.operands.len();
        if n < min || max.is_some_and(|m| n > m) {
            let expected = match max {
                Some(m) if m == min => format!("{min}"),
                Some(m) => format!("{min}-{m}"),
                None => format!("at least {min}"),
            };
            return Err(ConfigError::Arity {
                name: self.name.clone(),
                op: self.op.name().to_string(),
                expected,
                actual: n,
            });
        }
        if self.operands.iter().any(|o| *o == self.name) {
            return Err(ConfigError::SelfReference {
                name: self.name.clone(),
            });
        }
        let scale = self.scale();
        if !scale.is_finite() || scale == 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: self.name.clone(),
                reason: format!("scale must be finite and non-zero, got {scale}"),
            });
        }
        let base = self.base();
        if !base.is_finite() || base == 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: self.name.clone(),
                reason: format!("base must be finite and non-zero, got {base}"),
            });
        }
        Ok(())
    }

    /// Evaluate over operand columns (same order and length as `operands`).
    pub fn evaluate(&self, columns: &[&[f64]]) -> Vec<f64> {
        let rows = columns.first().map_or(0, |c| c.len());
        let scale = self.scale();
        let base = self.base();

        (0..rows)
            .map(|i| {
                if columns.iter().any(|c| c[i].is_nan()) {
                    return f64::NAN;
                }
                let a = columns[0][i];
                let raw = match self.op {
                    AggregateOp::Ratio => checked_div(a, columns[1][i]),
                    AggregateOp::Difference => a - columns[1][i],
                    AggregateOp::Normalize => checked_div(a, columns[1][i] / base),
                    AggregateOp::Spread => {
                        let denom = columns.get(2).unwrap_or(&columns[1])[i];
                        checked_div(a - columns[1][i], denom)
                    }
                    AggregateOp::Sum => columns.iter().map(|c| c[i]).sum(),
                    AggregateOp::Mean => {
                        columns.iter().map(|c| c[i]).sum::<f64>() / columns.len() as f64
                    }
                    AggregateOp::Product => columns.iter().map(|c| c[i]).product(),
                };
                let v = raw * scale;
                if v.is_finite() {
                    v
                } else {
                    f64::NAN
                }
            })
            .collect()
    }
}

fn checked_div(num: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        f64::NAN
    } else {
        num / denom
    }
}

/// Ordered list of aggregate definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateCatalog {
    #[serde(default, rename = "aggregate")]
    pub aggregates: Vec<AggregateDef>,
}

impl AggregateCatalog {
    pub fn new(aggregates: Vec<AggregateDef>) -> Self {
        Self { aggregates }
    }

    /// Load from a TOML file with `[[aggregate]]` tables.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let catalog: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("aggregate catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aggregates.iter().map(|a| a.name.as_str())
    }

    /// Static checks: arity, parameters, duplicate names, self and forward
    /// references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let position: HashMap<&str, usize> = self
            .aggregates
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.as_str(), i))
            .collect();

        let mut seen = HashMap::new();
        for (i, def) in self.aggregates.iter().enumerate() {
            if seen.insert(def.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateName {
                    name: def.name.clone(),
                });
            }
            def.validate()?;
            for operand in &def.operands {
                if position.get(operand.as_str()).is_some_and(|&j| j > i) {
                    return Err(ConfigError::ForwardReference {
                        name: def.name.clone(),
                        operand: operand.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Why an aggregate produced no column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedAggregate {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub computed: Vec<String>,
    pub skipped: Vec<SkippedAggregate>,
}

/// Extended panel, report, and registry rows pending commit.
#[derive(Debug, Clone)]
pub struct AggregateRun {
    pub panel: Panel,
    pub report: AggregateReport,
    pub registry_rows: Vec<SymbolRecord>,
}

/// Evaluate every definition in order against `panel`.
///
/// A definition whose operand column is absent is skipped. A definition named
/// after a base (non-derived) registry symbol, or after a panel column the
/// registry does not mark as derived, is a configuration error.
pub fn generate(
    panel: Panel,
    catalog: &AggregateCatalog,
    registry: &SymbolRegistry,
) -> Result<AggregateRun, AggregateError> {
    catalog.validate()?;
    for def in &catalog.aggregates {
        let record = registry.get(&def.name);
        if record.is_some_and(|r| r.is_derived()) {
            continue;
        }
        let owner = match record {
            Some(r) => r.source.clone(),
            None if panel.contains(&def.name) => "panel".to_string(),
            None => continue,
        };
        return Err(ConfigError::ShadowsBase {
            name: def.name.clone(),
            owner,
        }
        .into());
    }

    let mut panel = panel;
    let mut report = AggregateReport::default();
    let mut registry_rows = Vec::new();

    for def in &catalog.aggregates {
        let missing: Vec<&str> = def
            .operands
            .iter()
            .filter(|o| !panel.contains(o))
            .map(|o| o.as_str())
            .collect();
        if !missing.is_empty() {
            let reason = format!("operand(s) not in panel: {}", missing.join(", "));
            warn!(aggregate = %def.name, %reason, "skipping aggregate");
            report.skipped.push(SkippedAggregate {
                name: def.name.clone(),
                reason,
            });
            continue;
        }

        let values = {
            let columns: Vec<&[f64]> = def
                .operands
                .iter()
                .filter_map(|o| panel.column(o))
                .collect();
            def.evaluate(&columns)
        };
        panel = panel.with_column(def.name.clone(), values)?;

        registry_rows.push(SymbolRecord::new(
            def.name.clone(),
            SOURCE_COMPUTED,
            def.registry_description(),
            def.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        ));
        report.computed.push(def.name.clone());
    }

    info!(
        computed = report.computed.len(),
        skipped = report.skipped.len(),
        "aggregates generated"
    );

    Ok(AggregateRun {
        panel,
        report,
        registry_rows,
    })
}
