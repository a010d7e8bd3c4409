//! Symbol registry: one metadata row per symbol, base or derived.
//!
//! Every stage reads the registry to describe and classify series, and hands
//! back the rows for the columns it created. Those rows are committed in a
//! single upsert at the stage boundary, so a rerun replaces derived rows in
//! place instead of appending duplicates.
//!
//! On disk the registry is a CSV file with the header
//! `symbol,source,description,unit,expense_ratio`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Source tag for aggregate series.
pub const SOURCE_COMPUTED: &str = "computed";
/// Source tag for Tier-1 basic features.
pub const SOURCE_FEATURE: &str = "feature";
/// Source tag for Tier-2 domain features.
pub const SOURCE_DOMAIN_FEATURE: &str = "domain_feature";

/// Unit used when nothing better is known.
pub const DEFAULT_UNIT: &str = "Value";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry CSV at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Metadata for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol: String,
    pub source: String,
    pub description: String,
    pub unit: String,
    #[serde(default)]
    pub expense_ratio: Option<f64>,
}

impl SymbolRecord {
    pub fn new(
        symbol: impl Into<String>,
        source: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            source: source.into(),
            description: description.into(),
            unit: unit.into(),
            expense_ratio: None,
        }
    }

    pub fn with_expense_ratio(mut self, ratio: f64) -> Self {
        self.expense_ratio = Some(ratio);
        self
    }

    /// True for rows written by the aggregate generator or feature engine.
    pub fn is_derived(&self) -> bool {
        matches!(
            self.source.as_str(),
            SOURCE_COMPUTED | SOURCE_FEATURE | SOURCE_DOMAIN_FEATURE
        )
    }
}

/// What an upsert did to a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

/// Counts from one stage-boundary commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub stage: String,
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.replaced + self.unchanged
    }
}

/// A registry row together with the metric suffix it was resolved through.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSymbol<'a> {
    pub record: &'a SymbolRecord,
    pub metric: Option<&'a str>,
}

impl ResolvedSymbol<'_> {
    /// Description with the metric appended, e.g. `S&P 500 (close)`.
    pub fn description(&self) -> String {
        match self.metric {
            Some(metric) => format!("{} ({metric})", self.record.description),
            None => self.record.description.clone(),
        }
    }

    pub fn unit(&self) -> &str {
        &self.record.unit
    }

    pub fn source(&self) -> &str {
        &self.record.source
    }
}

/// The registry itself. Keyed by symbol, so there is never more than one row
/// per symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    records: BTreeMap<String, SymbolRecord>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from rows; a later row for the same symbol replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = SymbolRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.upsert(record);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolRecord> {
        self.records.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.records.contains_key(symbol)
    }

    /// Rows in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.records.values()
    }

    pub fn derived(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.records.values().filter(|r| r.is_derived())
    }

    /// Look up a panel column, falling back to its root symbol when the
    /// column carries a metric suffix (`SPY_close` resolves through `SPY`).
    pub fn resolve<'a>(&'a self, column: &'a str) -> Option<ResolvedSymbol<'a>> {
        if let Some(record) = self.records.get(column) {
            return Some(ResolvedSymbol {
                record,
                metric: None,
            });
        }
        let (root, metric) = column.rsplit_once('_')?;
        self.records.get(root).map(|record| ResolvedSymbol {
            record,
            metric: Some(metric),
        })
    }

    /// Insert or replace one row.
    pub fn upsert(&mut self, record: SymbolRecord) -> UpsertOutcome {
        match self.records.get_mut(&record.symbol) {
            Some(existing) if *existing == record => UpsertOutcome::Unchanged,
            Some(existing) => {
                *existing = record;
                UpsertOutcome::Replaced
            }
            None => {
                self.records.insert(record.symbol.clone(), record);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Commit the rows a stage produced. Called once per stage, after the
    /// stage's results have been merged.
    pub fn commit(&mut self, stage: &str, rows: Vec<SymbolRecord>) -> UpsertSummary {
        let mut summary = UpsertSummary {
            stage: stage.to_string(),
            ..Default::default()
        };
        for row in rows {
            match self.upsert(row) {
                UpsertOutcome::Inserted => summary.inserted += 1,
                UpsertOutcome::Replaced => summary.replaced += 1,
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
        }
        debug!(
            stage,
            inserted = summary.inserted,
            replaced = summary.replaced,
            unchanged = summary.unchanged,
            "registry commit"
        );
        summary
    }

    // ── CSV persistence ─────────────────────────────────────────────

    /// Load a registry CSV. Duplicate symbols in the file collapse to the
    /// last row and are reported with a warning.
    pub fn load_csv(path: &Path) -> Result<Self, RegistryError> {
        let mut reader = csv::Reader::from_path(path).map_err(|source| RegistryError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let mut registry = Self::new();
        let mut duplicates = 0usize;
        for row in reader.deserialize::<SymbolRecord>() {
            let record = row.map_err(|source| RegistryError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            if registry.upsert(record) != UpsertOutcome::Inserted {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!(path = %path.display(), duplicates, "duplicate symbols in registry file");
        }
        Ok(registry)
    }

    /// Load a registry CSV, or start empty when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, RegistryError> {
        if path.exists() {
            Self::load_csv(path)
        } else {
            warn!(path = %path.display(), "registry file not found, starting empty");
            Ok(Self::new())
        }
    }

    /// Write the registry CSV atomically (write to .tmp, rename into place).
    pub fn save_csv(&self, path: &Path) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = path.with_extension("csv.tmp");
        let write = || -> Result<(), RegistryError> {
            let mut writer =
                csv::Writer::from_path(&tmp_path).map_err(|source| RegistryError::Csv {
                    path: tmp_path.clone(),
                    source,
                })?;
            for record in self.records.values() {
                writer.serialize(record).map_err(|source| RegistryError::Csv {
                    path: tmp_path.clone(),
                    source,
                })?;
            }
            writer.flush().map_err(|source| RegistryError::Io {
                path: tmp_path.clone(),
                source,
            })
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            io_err(e)
        })
    }
}
