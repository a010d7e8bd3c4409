//! Run history: JSONL append-only persistence.
//!
//! One JSON object per line per completed run, so the file survives partial
//! writes and can be streamed. Malformed lines are skipped on read.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::config::RunMode;
use crate::report::PipelineReport;

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub started_at: NaiveDateTime,
    pub mode: RunMode,
    pub panel_hash: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub rows: usize,
    pub columns: usize,
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub long_rows: usize,
    pub duration_secs: f64,
}

impl HistoryEntry {
    pub fn from_report(report: &PipelineReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            started_at: report.started_at,
            mode: report.mode,
            panel_hash: report.panel_hash.0.clone(),
            start: report.panel.start,
            end: report.panel.end,
            rows: report.panel.rows,
            columns: report.panel.columns,
            computed: report.aggregates.computed.len() + report.features.computed.len(),
            skipped: report.aggregates.skipped.len() + report.features.skipped.len(),
            failed: report.features.failed.len(),
            long_rows: report.outputs.long.as_ref().map_or(0, |l| l.rows),
            duration_secs: report.duration_secs,
        }
    }
}

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &HistoryEntry) -> io::Result<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{json}")?;
        file.flush()
    }

    /// All entries, oldest first.
    pub fn read_all(&self) -> io::Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = io::BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<HistoryEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Most recent entry, if any.
    pub fn last(&self) -> io::Result<Option<HistoryEntry>> {
        Ok(self.read_all()?.pop())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run_id: &str) -> HistoryEntry {
        HistoryEntry {
            run_id: run_id.to_string(),
            started_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            mode: RunMode::Full,
            panel_hash: "abc".into(),
            start: NaiveDate::from_ymd_opt(2000, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 4, 30),
            rows: 8887,
            columns: 120,
            computed: 400,
            skipped: 3,
            failed: 1,
            long_rows: 1_000_000,
            duration_secs: 12.5,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let history = RunHistory::new(dir.path().join("nested").join("history.jsonl"));
        assert!(history.read_all().unwrap().is_empty());

        history.append(&entry("a")).unwrap();
        history.append(&entry("b")).unwrap();

        let all = history.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry("a"));
        assert_eq!(history.last().unwrap().unwrap().run_id, "b");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let history = RunHistory::new(&path);
        history.append(&entry("a")).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
            writeln!(file).unwrap();
        }
        history.append(&entry("c")).unwrap();

        let ids: Vec<String> = history
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.run_id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
