//! Feature catalog: which transforms exist, how their outputs are named, and
//! which series they apply to.
//!
//! Tier 1 (`[[basic]]`) entries are applied to every eligible series in the
//! panel. Tier 2 (`[[domain]]`) entries are named cross-series features that
//! read Tier-1 outputs, panel columns, or other domain features.

use super::classify::SeriesClass;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ── Tier 1 ───────────────────────────────────────────────────────────

/// A per-series transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BasicTransform {
    /// `value[t] / value[t - N years] - 1`, anchored on calendar dates.
    #[serde(rename = "yoy")]
    YearOverYear { years: u32 },
    /// Natural log; non-positive inputs give missing.
    Log,
    /// Trailing simple mean over `days` calendar days.
    MovingAverage { days: usize },
    /// Savitzky-Golay smoothing, optionally emitting the first derivative too.
    Smooth {
        window: usize,
        order: usize,
        #[serde(default)]
        derivative: bool,
    },
}

impl BasicTransform {
    fn default_suffix(&self) -> String {
        match self {
            Self::YearOverYear { years } => format!("YoY{years}"),
            Self::Log => "Log".to_string(),
            Self::MovingAverage { days } => format!("mva{days:03}"),
            Self::Smooth { .. } => "Smooth".to_string(),
        }
    }

    /// Human label for descriptions.
    pub fn label(&self) -> String {
        match self {
            Self::YearOverYear { years } => format!("{years}-year change"),
            Self::Log => "Natural log".to_string(),
            Self::MovingAverage { days } => format!("{days}-day moving average"),
            Self::Smooth { window, order, .. } => {
                format!("Savitzky-Golay smoothing (window {window}, order {order})")
            }
        }
    }
}

/// Which series a basic transform applies to.
///
/// `exclude` beats `include`, which beats the class filter. An empty class
/// list admits every class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    #[serde(default)]
    pub classes: Vec<SeriesClass>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Eligibility {
    pub fn classes(classes: &[SeriesClass]) -> Self {
        Self {
            classes: classes.to_vec(),
            ..Default::default()
        }
    }

    pub fn admits(&self, column: &str, class: SeriesClass) -> bool {
        if self.exclude.iter().any(|s| s == column) {
            return false;
        }
        if self.include.iter().any(|s| s == column) {
            return true;
        }
        self.classes.is_empty() || self.classes.contains(&class)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicFeatureSpec {
    #[serde(flatten)]
    pub transform: BasicTransform,
    /// Output suffix override (`{base}_{suffix}`).
    #[serde(default)]
    pub suffix: Option<String>,
    /// Suffix for the derivative output of `smooth`. Defaults to
    /// `{suffix}Der`.
    #[serde(default)]
    pub derivative_suffix: Option<String>,
    #[serde(default)]
    pub eligibility: Eligibility,
}

impl BasicFeatureSpec {
    pub fn new(transform: BasicTransform) -> Self {
        Self {
            transform,
            suffix: None,
            derivative_suffix: None,
            eligibility: Eligibility::default(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn suffix(&self) -> String {
        self.suffix
            .clone()
            .unwrap_or_else(|| self.transform.default_suffix())
    }

    /// Output names for one base series, in emission order.
    pub fn output_names(&self, base: &str) -> Vec<String> {
        let suffix = self.suffix();
        let mut names = vec![format!("{base}_{suffix}")];
        if let BasicTransform::Smooth {
            derivative: true, ..
        } = self.transform
        {
            let der = self
                .derivative_suffix
                .clone()
                .unwrap_or_else(|| format!("{suffix}Der"));
            names.push(format!("{base}_{der}"));
        }
        names
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParameter {
            name: self.suffix(),
            reason,
        };
        match self.transform {
            BasicTransform::YearOverYear { years } if years == 0 => {
                Err(invalid("yoy years must be at least 1".into()))
            }
            BasicTransform::MovingAverage { days } if days == 0 => {
                Err(invalid("moving average days must be at least 1".into()))
            }
            BasicTransform::Smooth { window, order, .. } if window <= order => Err(invalid(
                format!("smoothing window {window} must exceed order {order}"),
            )),
            _ => Ok(()),
        }
    }
}

// ── Tier 2 ───────────────────────────────────────────────────────────

fn one() -> f64 {
    1.0
}

fn twelve() -> u32 {
    12
}

fn one_month() -> u32 {
    1
}

fn initiation_window() -> usize {
    201
}

fn cubic() -> usize {
    3
}

fn initiation_jitter() -> f64 {
    0.01
}

/// A cross-series transform over named inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainTransform {
    /// `a - b`
    Difference,
    /// `Σ inputs`
    Sum,
    /// `a / b * scale`
    Ratio {
        #[serde(default = "one")]
        scale: f64,
    },
    /// `a * factor`
    Scale { factor: f64 },
    /// `1` where `a > threshold`, else `0`.
    Signal {
        #[serde(default)]
        threshold: f64,
    },
    /// Savitzky-Golay smoothing of one input, or its `derivative`-th
    /// derivative.
    Smooth {
        window: usize,
        order: usize,
        #[serde(default)]
        derivative: usize,
    },
    /// Day-over-day relative change.
    PctChange,
    /// Running product of `1 + r`.
    Compound,
    /// `1 + Σ r` from the first observed point.
    Accumulate,
    /// `1` in the window from `lead_months` to `lag_months` before the start
    /// month of each recession in a 0/1 indicator.
    RecessionInit {
        #[serde(default = "twelve")]
        lead_months: u32,
        #[serde(default = "one_month")]
        lag_months: u32,
    },
    /// Smoothed day count inside initiation windows, scaled to peak at 1
    /// plus reproducible noise of amplitude `jitter`.
    RecessionInitSmooth {
        #[serde(default = "initiation_window")]
        window: usize,
        #[serde(default = "cubic")]
        order: usize,
        #[serde(default = "initiation_jitter")]
        jitter: f64,
    },
}

impl DomainTransform {
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Self::Difference | Self::Ratio { .. } => (2, Some(2)),
            Self::Sum => (2, None),
            Self::Scale { .. }
            | Self::Signal { .. }
            | Self::Smooth { .. }
            | Self::PctChange
            | Self::Compound
            | Self::Accumulate
            | Self::RecessionInit { .. }
            | Self::RecessionInitSmooth { .. } => (1, Some(1)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Difference => "difference",
            Self::Sum => "sum",
            Self::Ratio { .. } => "ratio",
            Self::Scale { .. } => "scale",
            Self::Signal { .. } => "signal",
            Self::Smooth { .. } => "smooth",
            Self::PctChange => "pct_change",
            Self::Compound => "compound",
            Self::Accumulate => "accumulate",
            Self::RecessionInit { .. } => "recession_init",
            Self::RecessionInitSmooth { .. } => "recession_init_smooth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainFeatureDef {
    pub name: String,
    pub inputs: Vec<String>,
    pub transform: DomainTransform,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    /// An unresolvable input fails planning instead of skipping the feature.
    #[serde(default)]
    pub required: bool,
}

impl DomainFeatureDef {
    pub fn new(name: impl Into<String>, inputs: &[&str], transform: DomainTransform) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            transform,
            description: None,
            unit: None,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn registry_description(&self) -> String {
        let formula = format!("{}({})", self.transform.name(), self.inputs.join(", "));
        match &self.description {
            Some(text) => format!("{text} [{formula}]"),
            None => formula,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = self.transform.arity();
        let n = self.inputs.len();
        if n < min || max.is_some_and(|m| n > m) {
            return Err(ConfigError::Arity {
                name: self.name.clone(),
                op: self.transform.name().to_string(),
                expected: match max {
                    Some(m) if m == min => format!("{min}"),
                    Some(m) => format!("{min}-{m}"),
                    None => format!("at least {min}"),
                },
                actual: n,
            });
        }
        if let DomainTransform::Smooth {
            window,
            order,
            derivative,
        } = self.transform
        {
            if window <= order || derivative > 2 {
                return Err(ConfigError::InvalidParameter {
                    name: self.name.clone(),
                    reason: format!(
                        "smooth needs window > order and derivative <= 2 \
                         (window {window}, order {order}, derivative {derivative})"
                    ),
                });
            }
        }
        if let DomainTransform::Ratio { scale } | DomainTransform::Scale { factor: scale } =
            self.transform
        {
            if !scale.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    name: self.name.clone(),
                    reason: format!("non-finite multiplier {scale}"),
                });
            }
        }
        match self.transform {
            DomainTransform::RecessionInit {
                lead_months,
                lag_months,
            } if lead_months <= lag_months => Err(ConfigError::InvalidParameter {
                name: self.name.clone(),
                reason: format!(
                    "initiation window opens {lead_months} months before the start \
                     but closes {lag_months} months before it"
                ),
            }),
            DomainTransform::RecessionInitSmooth { window, order, jitter }
                if window <= order || !(jitter.is_finite() && jitter >= 0.0) =>
            {
                Err(ConfigError::InvalidParameter {
                    name: self.name.clone(),
                    reason: format!(
                        "recession_init_smooth needs window > order and a finite \
                         jitter >= 0 (window {window}, order {order}, jitter {jitter})"
                    ),
                })
            }
            _ => Ok(()),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCatalog {
    #[serde(default)]
    pub basic: Vec<BasicFeatureSpec>,
    #[serde(default)]
    pub domain: Vec<DomainFeatureDef>,
}

impl FeatureCatalog {
    /// The stock Tier-1 set: YoY at 1/4/5 years, log, 50/200/365-day moving
    /// averages on prices, and long and short smoothing.
    pub fn standard() -> Self {
        use SeriesClass::*;
        let changes = Eligibility::classes(&[Price, Level, Volume]);
        let basic = vec![
            BasicFeatureSpec::new(BasicTransform::YearOverYear { years: 1 })
                .with_eligibility(changes.clone()),
            BasicFeatureSpec::new(BasicTransform::YearOverYear { years: 4 })
                .with_eligibility(changes.clone()),
            BasicFeatureSpec::new(BasicTransform::YearOverYear { years: 5 })
                .with_eligibility(changes.clone()),
            BasicFeatureSpec::new(BasicTransform::Log).with_eligibility(changes),
            BasicFeatureSpec::new(BasicTransform::MovingAverage { days: 50 })
                .with_eligibility(Eligibility::classes(&[Price])),
            BasicFeatureSpec::new(BasicTransform::MovingAverage { days: 200 })
                .with_eligibility(Eligibility::classes(&[Price])),
            BasicFeatureSpec::new(BasicTransform::MovingAverage { days: 365 })
                .with_eligibility(Eligibility::classes(&[Price])),
            BasicFeatureSpec::new(BasicTransform::Smooth {
                window: 365,
                order: 3,
                derivative: true,
            })
            .with_eligibility(Eligibility::classes(&[Price, Rate, Level])),
            BasicFeatureSpec::new(BasicTransform::Smooth {
                window: 15,
                order: 3,
                derivative: false,
            })
            .with_suffix("Smooth_short")
            .with_eligibility(Eligibility::classes(&[Price, Rate, Level])),
        ];
        Self {
            basic,
            domain: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let catalog: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("feature catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parameter, arity and duplicate-name checks. Name collisions between
    /// generated outputs are checked when the graph is planned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for spec in &self.basic {
            spec.validate()?;
        }
        let mut seen = HashSet::new();
        for def in &self.domain {
            if !seen.insert(def.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: def.name.clone(),
                });
            }
            def.validate()?;
        }
        Ok(())
    }
}
