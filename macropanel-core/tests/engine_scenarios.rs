//! End-to-end scenarios over the core stages: panel build, aggregates,
//! features, and registry commits.
//!
//! Tests:
//! 1. Quarterly GDP 2000–2020 yields GDP_YoY1 and GDP_Log on the daily axis
//! 1b. Annual GDP 2000–2020: GDP_YoY1 anchors one calendar year back
//! 2. A daily close missing three dates is linearly interpolated
//! 3. Two identical runs give the same panel hash and no new registry rows
//! 4. Aggregates chain and feed domain features

use chrono::{Datelike, NaiveDate};
use macropanel_core::aggregate::{self, AggregateCatalog, AggregateDef, AggregateOp};
use macropanel_core::domain::{Observation, SourceBatch, SourceLayout};
use macropanel_core::features::{
    DomainFeatureDef, DomainTransform, EngineConfig, ExecutionMode, FeatureCatalog,
    FeatureEngine, FeatureFilter, FeatureGraph,
};
use macropanel_core::fingerprint::{panel_hash, PanelHash};
use macropanel_core::panel::{Panel, PanelBuilder, PanelConfig};
use macropanel_core::registry::{SymbolRecord, SymbolRegistry};

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Quarterly GDP on the first day of each quarter, growing 1% per quarter.
fn gdp_batch() -> SourceBatch {
    let mut batch = SourceBatch::new("fred", SourceLayout::Long);
    let mut value = 10_000.0;
    for year in 2000..=2020 {
        for month in [1, 4, 7, 10] {
            batch.push(Observation::new(d(year, month, 1), "GDP", value));
            value *= 1.01;
        }
    }
    batch
}

fn base_registry() -> SymbolRegistry {
    SymbolRegistry::from_records([
        SymbolRecord::new("GDP", "fred", "Gross Domestic Product", "Billions of Dollars"),
        SymbolRecord::new("SPX", "yahoo", "S&P 500", "USD"),
        SymbolRecord::new("DGS10", "fred", "10-Year Treasury", "Percent"),
    ])
}

fn panel_config(start: NaiveDate, end: NaiveDate) -> PanelConfig {
    PanelConfig {
        start: Some(start),
        end: Some(end),
        ..Default::default()
    }
}

struct RunOutput {
    panel: Panel,
    registry: SymbolRegistry,
    hash: PanelHash,
    inserted: usize,
}

fn run_all(
    sources: &[SourceBatch],
    mut registry: SymbolRegistry,
    aggregates: &AggregateCatalog,
    features: &FeatureCatalog,
    config: PanelConfig,
) -> RunOutput {
    let today = d(2021, 1, 1);
    let build = PanelBuilder::new(config).build(sources, today).unwrap();

    let agg = aggregate::generate(build.panel, aggregates, &registry).unwrap();
    let mut inserted = registry.commit("aggregates", agg.registry_rows).inserted;

    let graph = FeatureGraph::plan(&agg.panel, &registry, features, &FeatureFilter::default())
        .unwrap();
    let engine = FeatureEngine::new(&EngineConfig {
        workers: Some(2),
        mode: ExecutionMode::Parallel,
    })
    .unwrap();
    let run = engine.run(agg.panel, &graph, features, &registry).unwrap();
    inserted += registry.commit("features", run.registry_rows).inserted;

    let hash = panel_hash(&run.panel);
    RunOutput {
        panel: run.panel,
        registry,
        hash,
        inserted,
    }
}

// ──────────────────────────────────────────────
// Scenarios
// ──────────────────────────────────────────────

#[test]
fn quarterly_gdp_gets_yoy_and_log() {
    let out = run_all(
        &[gdp_batch()],
        base_registry(),
        &AggregateCatalog::default(),
        &FeatureCatalog::standard(),
        panel_config(d(2000, 1, 1), d(2020, 12, 31)),
    );

    assert_eq!(out.panel.start(), Some(d(2000, 1, 1)));
    assert_eq!(out.panel.end(), Some(d(2020, 12, 31)));
    assert!(out.panel.contains("GDP_YoY1"));
    assert!(out.panel.contains("GDP_Log"));

    // Both ends of the first full year are observed knots.
    let yoy = out.panel.value(d(2001, 1, 1), "GDP_YoY1").unwrap();
    assert!((yoy - (1.01f64.powi(4) - 1.0)).abs() < 1e-9);

    // No anchor a year back during the first year.
    assert!(out.panel.value(d(2000, 6, 1), "GDP_YoY1").unwrap().is_nan());

    let log = out.panel.value(d(2000, 1, 1), "GDP_Log").unwrap();
    assert!((log - 10_000f64.ln()).abs() < 1e-9);

    let record = out.registry.get("GDP_YoY1").unwrap();
    assert_eq!(record.source, "feature");
    assert!(out.registry.get("GDP_Log").unwrap().is_derived());
}

/// Annual GDP on January 1st, growing 5% per year.
fn annual_gdp(year: i32) -> f64 {
    10_000.0 * 1.05f64.powi(year - 2000)
}

/// Daily value of the annual series after linear filling.
fn annual_gdp_on(date: NaiveDate) -> f64 {
    let year = date.year();
    let from = d(year, 1, 1);
    let span = (d(year + 1, 1, 1) - from).num_days() as f64;
    let t = (date - from).num_days() as f64 / span;
    annual_gdp(year) + (annual_gdp(year + 1) - annual_gdp(year)) * t
}

#[test]
fn annual_gdp_yoy_anchors_one_calendar_year_back() {
    let mut batch = SourceBatch::new("fred", SourceLayout::Long);
    for year in 2000..=2020 {
        batch.push(Observation::new(d(year, 1, 1), "GDP", annual_gdp(year)));
    }
    let out = run_all(
        &[batch],
        base_registry(),
        &AggregateCatalog::default(),
        &FeatureCatalog::standard(),
        panel_config(d(2000, 1, 1), d(2020, 12, 31)),
    );
    let yoy = |date: NaiveDate| out.panel.value(date, "GDP_YoY1").unwrap();
    let close = |a: f64, b: f64| (a - b).abs() < 1e-9 * b.abs().max(1.0);

    // Knot to knot.
    for year in 2001..=2020 {
        assert!(close(yoy(d(year, 1, 1)), 0.05), "{year}");
    }
    let yoy4 = out.panel.value(d(2010, 1, 1), "GDP_YoY4").unwrap();
    assert!(close(yoy4, 1.05f64.powi(4) - 1.0));

    // Between knots the anchor is the same calendar date a year earlier,
    // which is 366 days back across a leap day.
    let date = d(2005, 3, 1);
    let calendar = annual_gdp_on(date) / annual_gdp_on(d(2004, 3, 1)) - 1.0;
    let fixed_365 = annual_gdp_on(date) / annual_gdp_on(d(2004, 3, 2)) - 1.0;
    assert!(close(yoy(date), calendar));
    assert!((calendar - fixed_365).abs() > 1e-9);

    // Feb 29 anchors on Feb 28.
    let leap = d(2004, 2, 29);
    assert!(close(yoy(leap), annual_gdp_on(leap) / annual_gdp_on(d(2003, 2, 28)) - 1.0));

    // No anchor during the first year.
    assert!(yoy(d(2000, 12, 31)).is_nan());

    let gdp = out.panel.column("GDP").unwrap();
    let log = out.panel.column("GDP_Log").unwrap();
    assert!(gdp
        .iter()
        .zip(log)
        .all(|(g, l)| g.is_nan() || l.is_finite()));
}

#[test]
fn missing_daily_closes_are_interpolated() {
    let skipped = [d(2020, 2, 10), d(2020, 2, 11), d(2020, 2, 12)];
    let start = d(2020, 1, 1);
    let mut batch = SourceBatch::new("yahoo", SourceLayout::Melted);
    for (i, date) in start.iter_days().take(91).enumerate() {
        if skipped.contains(&date) {
            continue;
        }
        batch.push(Observation::melted(date, "SPX", "close", 3000.0 + i as f64));
    }

    let build = PanelBuilder::new(panel_config(start, d(2020, 3, 31)))
        .build(&[batch], d(2020, 3, 31))
        .unwrap();

    for date in skipped {
        let i = (date - start).num_days() as f64;
        let v = build.panel.value(date, "SPX_close").unwrap();
        assert!((v - (3000.0 + i)).abs() < 1e-9, "{date}: {v}");
    }
    assert_eq!(build.panel.observed_count("SPX_close"), 91);
}

#[test]
fn rerun_is_idempotent() {
    let aggregates = AggregateCatalog::new(vec![AggregateDef::new(
        "GDP_by_DGS10",
        AggregateOp::Ratio,
        &["GDP", "DGS10"],
    )]);
    let mut dgs = SourceBatch::new("fred_rates", SourceLayout::Long);
    for (i, date) in d(2018, 1, 1).iter_days().take(1100).enumerate() {
        dgs.push(Observation::new(date, "DGS10", 2.0 + (i as f64 * 0.01).sin()));
    }
    let sources = vec![gdp_batch(), dgs];
    let features = FeatureCatalog::standard();
    let config = panel_config(d(2018, 1, 1), d(2020, 12, 31));

    let first = run_all(&sources, base_registry(), &aggregates, &features, config.clone());
    assert!(first.inserted > 0);
    let registry_len = first.registry.len();

    let second = run_all(&sources, first.registry, &aggregates, &features, config);
    assert_eq!(first.hash, second.hash);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.registry.len(), registry_len);
}

#[test]
fn aggregates_feed_domain_features() {
    let aggregates = AggregateCatalog::new(vec![
        AggregateDef::new("GDP_by_DGS10", AggregateOp::Ratio, &["GDP", "DGS10"]),
        AggregateDef::new("GDP_by_DGS10_x2", AggregateOp::Sum, &["GDP_by_DGS10", "GDP_by_DGS10"]),
    ]);
    let mut dgs = SourceBatch::new("fred_rates", SourceLayout::Long);
    for date in d(2019, 1, 1).iter_days().take(800) {
        dgs.push(Observation::new(date, "DGS10", 2.0));
    }
    let features = FeatureCatalog {
        basic: Vec::new(),
        domain: vec![DomainFeatureDef::new(
            "GDP_by_DGS10_half",
            &["GDP_by_DGS10_x2"],
            DomainTransform::Scale { factor: 0.25 },
        )],
    };

    let out = run_all(
        &[gdp_batch(), dgs],
        base_registry(),
        &aggregates,
        &features,
        panel_config(d(2019, 1, 1), d(2020, 12, 31)),
    );

    let date = d(2020, 1, 1);
    let ratio = out.panel.value(date, "GDP_by_DGS10").unwrap();
    let half = out.panel.value(date, "GDP_by_DGS10_half").unwrap();
    assert!((half - ratio / 2.0).abs() < 1e-9);
    assert_eq!(out.registry.get("GDP_by_DGS10").unwrap().source, "computed");
    assert_eq!(
        out.registry.get("GDP_by_DGS10_half").unwrap().source,
        "domain_feature"
    );
}
