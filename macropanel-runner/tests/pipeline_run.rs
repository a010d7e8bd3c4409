//! End-to-end pipeline runs against staging files in a temp directory.
//!
//! Tests:
//! 1. A full run writes wide/long artifacts, report, history, and registry
//! 2. A rerun is idempotent (same hash, no new registry rows)
//! 3. Incremental mode appends only rows past the watermark
//! 4. Sequential and parallel runs agree
//! 5. Configuration errors fail before anything is written
//! 6. A configured source with no file is skipped and reported

use chrono::{NaiveDate, NaiveDateTime};
use macropanel_core::aggregate::{AggregateCatalog, AggregateDef, AggregateOp};
use macropanel_core::features::{DomainFeatureDef, DomainTransform, FeatureCatalog};
use macropanel_core::registry::{SymbolRecord, SymbolRegistry};
use macropanel_runner::history::RunHistory;
use macropanel_runner::pipeline::{REPORT_JSON, REPORT_MARKDOWN};
use macropanel_runner::writer::OutputWriter;
use macropanel_runner::{Pipeline, PipelineConfig, PipelineReport, RunMode, RunParams};
use polars::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn at(h: u32) -> NaiveDateTime {
    d(2021, 1, 4).and_hms_opt(h, 0, 0).unwrap()
}

const PIPELINE_TOML: &str = r#"
[paths]
staging_dir = "staging"
output_dir = "out"
registry = "symbols.csv"
output_name = "macro_panel"

[[sources]]
name = "fred"

[[sources]]
name = "yahoo"
layout = "melted"

[[sources]]
name = "bls"

[panel]
start = "2019-01-01"
end = "2020-12-31"
"#;

/// Quarterly GDP since 2015 and daily SPY closes since 2019.
fn write_staging(root: &Path) {
    let staging = root.join("staging");
    fs::create_dir_all(&staging).unwrap();

    let mut fred = String::from("date,series_id,value\n");
    let mut gdp = 18_000.0;
    for year in 2015..=2020 {
        for month in [1, 4, 7, 10] {
            writeln!(fred, "{year}-{month:02}-01,GDP,{gdp:.4}").unwrap();
            gdp *= 1.01;
        }
    }
    fs::write(staging.join("fred.csv"), fred).unwrap();

    let mut yahoo = String::from("date,symbol,metric,value\n");
    for (i, date) in d(2019, 1, 1).iter_days().take(731).enumerate() {
        writeln!(yahoo, "{date},SPY,close,{:.4}", 250.0 + i as f64 * 0.1).unwrap();
    }
    fs::write(staging.join("yahoo.csv"), yahoo).unwrap();

    SymbolRegistry::from_records([
        SymbolRecord::new("GDP", "fred", "Gross Domestic Product", "Billions of Dollars"),
        SymbolRecord::new("SPY", "yahoo", "SPDR S&P 500 ETF", "USD").with_expense_ratio(0.0945),
    ])
    .save_csv(&root.join("symbols.csv"))
    .unwrap();
}

fn pipeline(root: &Path) -> Pipeline {
    fs::write(root.join("pipeline.toml"), PIPELINE_TOML).unwrap();
    let config = PipelineConfig::from_file(&root.join("pipeline.toml")).unwrap();
    let aggregates = AggregateCatalog::new(vec![AggregateDef::new(
        "SPY_close_by_GDP",
        AggregateOp::Ratio,
        &["SPY_close", "GDP"],
    )
    .with_scale(1000.0)]);
    let mut features = FeatureCatalog::standard();
    features.domain.push(DomainFeatureDef::new(
        "SPY_close_mva050_mva200",
        &["SPY_close_mva050", "SPY_close_mva200"],
        DomainTransform::Difference,
    ));
    features.domain.push(DomainFeatureDef::new(
        "SPY_close_mva050_mva200_sig",
        &["SPY_close_mva050_mva200"],
        DomainTransform::Signal { threshold: 0.0 },
    ));
    Pipeline::from_parts(config, aggregates, features)
}

fn setup() -> (tempfile::TempDir, Pipeline) {
    let dir = tempfile::tempdir().unwrap();
    write_staging(dir.path());
    let pipeline = pipeline(dir.path());
    (dir, pipeline)
}

fn read_parquet(path: &Path) -> DataFrame {
    ParquetReader::new(fs::File::open(path).unwrap())
        .finish()
        .unwrap()
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[test]
fn full_run_writes_every_artifact() {
    let (dir, pipeline) = setup();
    let report = pipeline.run(&RunParams::default(), at(9)).unwrap();

    assert_eq!(report.panel.start, Some(d(2019, 1, 1)));
    assert_eq!(report.panel.end, Some(d(2020, 12, 31)));
    assert_eq!(report.aggregates.computed, vec!["SPY_close_by_GDP"]);
    for name in [
        "GDP_YoY1",
        "GDP_Log",
        "SPY_close_mva050",
        "SPY_close_Log",
        "SPY_close_mva050_mva200_sig",
    ] {
        assert!(
            report.features.computed.iter().any(|c| c == name),
            "{name} not computed"
        );
    }
    assert!(report.unregistered_columns.is_empty());

    let out = dir.path().join("out");
    let wide = read_parquet(&out.join("macro_panel.parquet"));
    assert_eq!(wide.height(), 731);
    assert!(wide.column("SPY_close_by_GDP").is_ok());
    assert!(out.join(REPORT_JSON).is_file());
    assert!(fs::read_to_string(out.join(REPORT_MARKDOWN))
        .unwrap()
        .contains("macropanel Run Report"));

    let long = report.outputs.long.as_ref().unwrap();
    assert!(long.rows > 0);
    assert_eq!(long.watermark, Some(d(2020, 12, 31)));

    let history = RunHistory::new(out.join("history.jsonl")).read_all().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].panel_hash, report.panel_hash.0);

    let registry = SymbolRegistry::load_csv(&dir.path().join("symbols.csv")).unwrap();
    assert_eq!(registry.get("SPY_close_by_GDP").unwrap().source, "computed");
    assert_eq!(registry.get("GDP_YoY1").unwrap().source, "feature");
    assert_eq!(
        registry.get("SPY_close_mva050_mva200_sig").unwrap().source,
        "domain_feature"
    );
    assert_eq!(registry.get("SPY").unwrap().expense_ratio, Some(0.0945));
}

#[test]
fn rerun_is_idempotent() {
    let (dir, pipeline) = setup();
    let first = pipeline.run(&RunParams::default(), at(9)).unwrap();
    let registry_len = SymbolRegistry::load_csv(&dir.path().join("symbols.csv"))
        .unwrap()
        .len();

    let second = pipeline.run(&RunParams::default(), at(10)).unwrap();
    assert_eq!(first.panel_hash, second.panel_hash);
    assert!(first.previous_hash.is_none());
    assert_eq!(second.previous_hash.as_ref(), Some(&first.panel_hash.0));
    assert!(second.registry.iter().all(|s| s.inserted == 0));
    assert_eq!(
        SymbolRegistry::load_csv(&dir.path().join("symbols.csv"))
            .unwrap()
            .len(),
        registry_len
    );

    // The second full write retires the first part.
    let writer = OutputWriter::new(
        dir.path().join("out"),
        dir.path().join("staging"),
        "macro_panel",
    );
    assert_eq!(writer.long_parts().unwrap().len(), 1);
}

#[test]
fn incremental_appends_past_watermark() {
    let (dir, pipeline) = setup();
    let first = RunParams {
        end: Some(d(2020, 6, 30)),
        ..Default::default()
    };
    pipeline.run(&first, at(9)).unwrap();

    let incremental = RunParams {
        mode: RunMode::Incremental,
        ..Default::default()
    };
    let report = pipeline.run(&incremental, at(10)).unwrap();
    let long = report.outputs.long.unwrap();
    assert_eq!(long.watermark, Some(d(2020, 12, 31)));

    let part = read_parquet(long.part.as_ref().unwrap());
    assert_eq!(part.height(), long.rows);
    let dates = part.column("date").unwrap().date().unwrap();
    let cutoff = (d(2020, 6, 30) - NaiveDate::default()).num_days() as i32;
    assert!((0..part.height()).all(|i| dates.get(i).unwrap() > cutoff));

    let writer = OutputWriter::new(
        dir.path().join("out"),
        dir.path().join("staging"),
        "macro_panel",
    );
    assert_eq!(writer.long_parts().unwrap().len(), 2);
}

#[test]
fn sequential_matches_parallel() {
    let (_a, parallel) = setup();
    let (_b, sequential) = setup();
    let p = parallel
        .run(
            &RunParams {
                workers: Some(3),
                ..Default::default()
            },
            at(9),
        )
        .unwrap();
    let s = sequential
        .run(
            &RunParams {
                sequential: true,
                ..Default::default()
            },
            at(9),
        )
        .unwrap();
    assert_eq!(p.panel_hash, s.panel_hash);
    assert_eq!(p.features, s.features);
}

#[test]
fn configuration_errors_fail_before_writing() {
    let (dir, pipeline) = setup();
    let params = RunParams {
        sources: vec!["bloomberg".into()],
        ..Default::default()
    };
    assert!(pipeline.validate(&params).is_err());
    assert!(pipeline.run(&params, at(9)).is_err());
    assert!(!dir.path().join("out").exists());

    let config = PipelineConfig::from_file(&dir.path().join("pipeline.toml")).unwrap();
    let cyclic = FeatureCatalog {
        basic: Vec::new(),
        domain: vec![
            DomainFeatureDef::new("A", &["B"], DomainTransform::PctChange),
            DomainFeatureDef::new("B", &["A"], DomainTransform::PctChange),
        ],
    };
    let bad = Pipeline::from_parts(config, AggregateCatalog::default(), cyclic);
    assert!(bad.run(&RunParams::default(), at(9)).is_err());
    assert!(!dir.path().join("out").exists());
}

#[test]
fn missing_source_file_is_skipped() {
    let (dir, pipeline) = setup();
    let summary = pipeline.validate(&RunParams::default()).unwrap();
    assert_eq!(summary.missing_files, vec!["bls"]);

    let report: PipelineReport = pipeline.run(&RunParams::default(), at(9)).unwrap();
    let bls = report.sources.iter().find(|s| s.name == "bls").unwrap();
    assert!(bls.strategy.is_none());
    assert_eq!(bls.observations, 0);

    let json = fs::read_to_string(dir.path().join("out").join(REPORT_JSON)).unwrap();
    let parsed: PipelineReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.run_id, report.run_id);
}
