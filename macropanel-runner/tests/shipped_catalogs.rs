//! The catalogs and config checked into the repository stay loadable.
//!
//! Tests:
//! 1. The sample pipeline.toml parses and resolves catalog paths
//! 2. The aggregate catalog validates in declaration order
//! 3. The feature catalog validates and carries the equity-curve chain

use macropanel_core::aggregate::{AggregateCatalog, AggregateOp};
use macropanel_core::features::{DomainTransform, FeatureCatalog};
use macropanel_runner::PipelineConfig;
use std::path::PathBuf;

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

#[test]
fn sample_pipeline_config_parses() {
    let root = repo_root();
    let config = PipelineConfig::from_file(&root.join("pipeline.toml")).unwrap();
    assert_eq!(config.sources.len(), 4);
    assert_eq!(
        config.aggregates_path(),
        Some(root.join("catalogs/aggregates.toml"))
    );
    assert!(config.panel.step_series.iter().any(|s| s == "USREC"));
}

#[test]
fn aggregate_catalog_validates() {
    let catalog =
        AggregateCatalog::from_file(&repo_root().join("catalogs/aggregates.toml")).unwrap();
    let total = catalog
        .aggregates
        .iter()
        .find(|a| a.name == "TOTLNNSA")
        .unwrap();
    assert_eq!(total.op, AggregateOp::Sum);
    assert_eq!(total.operands.len(), 3);

    let position = |name: &str| catalog.aggregates.iter().position(|a| a.name == name);
    assert!(position("TOTLNNSA") < position("TOTLNNSA_by_GDP"));
    assert!(position("GDP_by_CPIAUCSL") < position("GDP_by_CPIAUCSL_by_POPTHM"));
}

#[test]
fn feature_catalog_validates() {
    let catalog = FeatureCatalog::from_file(&repo_root().join("catalogs/features.toml")).unwrap();
    assert_eq!(catalog.basic, FeatureCatalog::standard().basic);

    let eq_base = catalog.domain.iter().find(|d| d.name == "eq_base").unwrap();
    assert_eq!(eq_base.inputs, vec!["ret_base"]);
    assert_eq!(eq_base.transform, DomainTransform::Compound);

    let smooth = catalog
        .domain
        .iter()
        .find(|d| d.name == "RecInit_Smooth")
        .unwrap();
    assert_eq!(smooth.inputs, vec!["RecInit"]);
    assert!(matches!(
        smooth.transform,
        DomainTransform::RecessionInitSmooth { window: 201, .. }
    ));
}
