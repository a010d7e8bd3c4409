//! Feature graph planning.
//!
//! Planning turns a catalog plus the current panel into:
//! - Tier-1 work units, one per eligible base series, each listing the
//!   transforms to run and the exact output names (the descriptor table),
//! - Tier-2 waves: domain features in topological order, where every feature
//!   in a wave depends only on panel columns, Tier-1 outputs, or features in
//!   earlier waves.
//!
//! Everything that can be checked without computing is checked here: output
//! name collisions, dependency cycles, and unresolvable required inputs.

use super::catalog::{BasicFeatureSpec, DomainFeatureDef, FeatureCatalog};
use super::classify::{classify, SeriesClass};
use crate::error::ConfigError;
use crate::panel::Panel;
use crate::registry::SymbolRegistry;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One Tier-1 output: `(base series, catalog entry) → output name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescriptor {
    pub output: String,
    pub base: String,
    /// Index into `FeatureCatalog::basic`.
    pub spec: usize,
    /// True for the derivative output of a smoothing entry.
    pub derivative: bool,
}

/// One catalog entry applied to one base series.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicTask {
    pub spec: usize,
    /// Output descriptors, in the order the transform emits them.
    pub outputs: Vec<FeatureDescriptor>,
}

/// All Tier-1 work for one base series.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicUnit {
    pub base: String,
    pub class: SeriesClass,
    pub tasks: Vec<BasicTask>,
}

/// A planned domain feature.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainNode {
    pub def: DomainFeatureDef,
    /// Inputs nothing in the plan can produce. The feature will be skipped.
    pub unresolved: Vec<String>,
}

/// Optional subset of features to compute.
///
/// A Tier-1 output is kept when its output name or base series is listed, a
/// domain feature when its name is listed. Dependencies of kept domain
/// features are kept too. An empty filter keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFilter {
    names: BTreeSet<String>,
}

impl FeatureFilter {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn lists(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureGraph {
    pub units: Vec<BasicUnit>,
    pub waves: Vec<Vec<DomainNode>>,
}

impl FeatureGraph {
    /// Plan the graph over `panel`. Fails on collisions, cycles, and
    /// unresolvable required inputs.
    pub fn plan(
        panel: &Panel,
        registry: &SymbolRegistry,
        catalog: &FeatureCatalog,
        filter: &FeatureFilter,
    ) -> Result<Self, ConfigError> {
        catalog.validate()?;

        let mut units = plan_basic(panel, registry, &catalog.basic)?;
        let mut owners: HashMap<String, String> = units
            .iter()
            .flat_map(|u| &u.tasks)
            .flat_map(|t| &t.outputs)
            .map(|d| (d.output.clone(), format!("{} of {}", d.output, d.base)))
            .collect();

        for def in &catalog.domain {
            if panel.contains(&def.name) {
                return Err(ConfigError::NameCollision {
                    name: def.name.clone(),
                    first: "panel column".into(),
                    second: format!("domain feature '{}'", def.name),
                });
            }
            if let Some(first) = owners.insert(def.name.clone(), format!("domain feature '{}'", def.name)) {
                return Err(ConfigError::NameCollision {
                    name: def.name.clone(),
                    first,
                    second: format!("domain feature '{}'", def.name),
                });
            }
        }

        let mut domain = resolve_domain(panel, &owners, &catalog.domain)?;
        if !filter.is_empty() {
            apply_filter(filter, &mut units, &mut domain);
        }
        let waves = order_waves(domain)?;

        Ok(Self { units, waves })
    }

    pub fn tier1_outputs(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.units
            .iter()
            .flat_map(|u| &u.tasks)
            .flat_map(|t| &t.outputs)
    }

    pub fn tier1_count(&self) -> usize {
        self.tier1_outputs().count()
    }

    pub fn domain_count(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum()
    }
}

// ── Tier 1 ───────────────────────────────────────────────────────────

fn plan_basic(
    panel: &Panel,
    registry: &SymbolRegistry,
    specs: &[BasicFeatureSpec],
) -> Result<Vec<BasicUnit>, ConfigError> {
    let mut units = Vec::new();
    let mut owners: HashMap<String, String> = HashMap::new();

    for base in panel.names() {
        let class = classify(base, registry);
        let mut tasks = Vec::new();

        for (spec_index, spec) in specs.iter().enumerate() {
            if !spec.eligibility.admits(base, class) {
                continue;
            }
            let mut outputs = Vec::new();
            for (i, output) in spec.output_names(base).into_iter().enumerate() {
                let origin = format!("{} of {base}", spec.transform.label());
                if panel.contains(&output) {
                    return Err(ConfigError::NameCollision {
                        name: output,
                        first: "panel column".into(),
                        second: origin,
                    });
                }
                if let Some(first) = owners.insert(output.clone(), origin.clone()) {
                    return Err(ConfigError::NameCollision {
                        name: output,
                        first,
                        second: origin,
                    });
                }
                outputs.push(FeatureDescriptor {
                    output,
                    base: base.clone(),
                    spec: spec_index,
                    derivative: i == 1,
                });
            }
            tasks.push(BasicTask {
                spec: spec_index,
                outputs,
            });
        }

        if !tasks.is_empty() {
            units.push(BasicUnit {
                base: base.clone(),
                class,
                tasks,
            });
        }
    }

    Ok(units)
}

// ── Tier 2 ───────────────────────────────────────────────────────────

fn resolve_domain(
    panel: &Panel,
    producers: &HashMap<String, String>,
    defs: &[DomainFeatureDef],
) -> Result<Vec<DomainNode>, ConfigError> {
    defs.iter()
        .map(|def| {
            let mut unresolved = Vec::new();
            for input in &def.inputs {
                if panel.contains(input) || producers.contains_key(input) {
                    continue;
                }
                if def.required {
                    return Err(ConfigError::UnresolvedInput {
                        name: def.name.clone(),
                        input: input.clone(),
                    });
                }
                unresolved.push(input.clone());
            }
            Ok(DomainNode {
                def: def.clone(),
                unresolved,
            })
        })
        .collect()
}

fn apply_filter(filter: &FeatureFilter, units: &mut Vec<BasicUnit>, domain: &mut Vec<DomainNode>) {
    let by_name: HashMap<&str, &DomainNode> =
        domain.iter().map(|n| (n.def.name.as_str(), n)).collect();

    // Domain features listed, plus everything they transitively read.
    let mut keep_domain: HashSet<String> = HashSet::new();
    let mut needed: HashSet<String> = HashSet::new();
    let mut stack: Vec<&str> = domain
        .iter()
        .filter(|n| filter.lists(&n.def.name))
        .map(|n| n.def.name.as_str())
        .collect();
    while let Some(name) = stack.pop() {
        if !keep_domain.insert(name.to_string()) {
            continue;
        }
        if let Some(node) = by_name.get(name) {
            for input in &node.def.inputs {
                needed.insert(input.clone());
                if by_name.contains_key(input.as_str()) {
                    stack.push(input.as_str());
                }
            }
        }
    }

    domain.retain(|n| keep_domain.contains(&n.def.name));
    for unit in units.iter_mut() {
        let base_listed = filter.lists(&unit.base);
        unit.tasks.retain(|task| {
            base_listed
                || task
                    .outputs
                    .iter()
                    .any(|d| filter.lists(&d.output) || needed.contains(&d.output))
        });
    }
    units.retain(|u| !u.tasks.is_empty());
}

/// Kahn's algorithm over domain-on-domain edges, emitting one wave per layer.
fn order_waves(nodes: Vec<DomainNode>) -> Result<Vec<Vec<DomainNode>>, ConfigError> {
    let position: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.def.name.clone(), i))
        .collect();

    let deps: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| {
            let mut d: Vec<usize> = n
                .def
                .inputs
                .iter()
                .filter_map(|i| position.get(i).copied())
                .collect();
            d.sort_unstable();
            d.dedup();
            d
        })
        .collect();

    let mut remaining: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, d) in deps.iter().enumerate() {
        for &j in d {
            dependents[j].push(i);
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| remaining[i] == 0).collect();
    let mut placed = 0;
    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for &i in &ready {
            for &k in &dependents[i] {
                remaining[k] -= 1;
                if remaining[k] == 0 {
                    next.push(k);
                }
            }
        }
        placed += ready.len();
        layers.push(std::mem::replace(&mut ready, next));
    }

    if placed < nodes.len() {
        let stuck: HashSet<usize> = (0..nodes.len()).filter(|&i| remaining[i] > 0).collect();
        return Err(ConfigError::Cycle {
            path: find_cycle(&nodes, &deps, &stuck),
        });
    }

    let mut slots: Vec<Option<DomainNode>> = nodes.into_iter().map(Some).collect();
    Ok(layers
        .into_iter()
        .map(|layer| layer.into_iter().filter_map(|i| slots[i].take()).collect())
        .collect())
}

/// Walk dependencies inside the stuck set until a node repeats.
fn find_cycle(nodes: &[DomainNode], deps: &[Vec<usize>], stuck: &HashSet<usize>) -> Vec<String> {
    let Some(&start) = stuck.iter().min() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(&next) = deps[current].iter().find(|d| stuck.contains(d)) else {
            break;
        };
        if let Some(&at) = seen.get(&next) {
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .map(|&i| nodes[i].def.name.clone())
                .collect();
            cycle.push(nodes[next].def.name.clone());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
    path.into_iter().map(|i| nodes[i].def.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::catalog::{BasicTransform, DomainTransform, Eligibility};
    use crate::registry::SymbolRecord;
    use chrono::NaiveDate;

    fn panel(names: &[&str]) -> Panel {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut panel = Panel::from_range(day, day).unwrap();
        for name in names {
            panel = panel.with_column(*name, vec![1.0]).unwrap();
        }
        panel
    }

    fn registry() -> SymbolRegistry {
        SymbolRegistry::from_records([
            SymbolRecord::new("GDP", "fred", "GDP", "Billions of Dollars"),
            SymbolRecord::new("DGS10", "fred", "10y", "Percent"),
        ])
    }

    fn catalog(domain: Vec<DomainFeatureDef>) -> FeatureCatalog {
        FeatureCatalog {
            basic: vec![
                BasicFeatureSpec::new(BasicTransform::Log),
                BasicFeatureSpec::new(BasicTransform::MovingAverage { days: 50 })
                    .with_eligibility(Eligibility::classes(&[SeriesClass::Price])),
            ],
            domain,
        }
    }

    #[test]
    fn descriptor_table_respects_eligibility() {
        let graph = FeatureGraph::plan(
            &panel(&["GDP", "DGS10"]),
            &registry(),
            &catalog(vec![]),
            &FeatureFilter::default(),
        )
        .unwrap();

        let outputs: Vec<&str> = graph.tier1_outputs().map(|d| d.output.as_str()).collect();
        assert_eq!(outputs, vec!["GDP_Log", "GDP_mva050", "DGS10_Log"]);
    }

    #[test]
    fn collision_with_panel_column_is_rejected() {
        let result = FeatureGraph::plan(
            &panel(&["GDP", "GDP_Log"]),
            &registry(),
            &catalog(vec![]),
            &FeatureFilter::default(),
        );
        assert!(matches!(result, Err(ConfigError::NameCollision { .. })));
    }

    #[test]
    fn duplicate_suffixes_collide() {
        let mut cat = catalog(vec![]);
        cat.basic
            .push(BasicFeatureSpec::new(BasicTransform::YearOverYear { years: 1 }).with_suffix("Log"));
        let result = FeatureGraph::plan(
            &panel(&["GDP"]),
            &registry(),
            &cat,
            &FeatureFilter::default(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::NameCollision { name, .. }) if name == "GDP_Log"
        ));
    }

    #[test]
    fn domain_features_are_layered() {
        let cat = catalog(vec![
            DomainFeatureDef::new("SIG", &["SPREAD"], DomainTransform::Signal { threshold: 0.0 }),
            DomainFeatureDef::new("SPREAD", &["GDP_Log", "DGS10"], DomainTransform::Difference),
        ]);
        let graph =
            FeatureGraph::plan(&panel(&["GDP", "DGS10"]), &registry(), &cat, &FeatureFilter::default())
                .unwrap();

        assert_eq!(graph.waves.len(), 2);
        assert_eq!(graph.waves[0][0].def.name, "SPREAD");
        assert_eq!(graph.waves[1][0].def.name, "SIG");
    }

    #[test]
    fn cycles_are_rejected_with_their_path() {
        let cat = catalog(vec![
            DomainFeatureDef::new("A", &["B"], DomainTransform::PctChange),
            DomainFeatureDef::new("B", &["A"], DomainTransform::PctChange),
        ]);
        let err = FeatureGraph::plan(&panel(&["GDP"]), &registry(), &cat, &FeatureFilter::default())
            .unwrap_err();
        match err {
            ConfigError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"A".to_string()) && path.contains(&"B".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let cat = catalog(vec![DomainFeatureDef::new(
            "A",
            &["A"],
            DomainTransform::Compound,
        )]);
        let result = FeatureGraph::plan(&panel(&["GDP"]), &registry(), &cat, &FeatureFilter::default());
        assert!(matches!(result, Err(ConfigError::Cycle { .. })));
    }

    #[test]
    fn unresolvable_inputs_skip_or_fail() {
        // DGS10 is a rate, so DGS10_mva050 is never planned.
        let optional = catalog(vec![DomainFeatureDef::new(
            "X",
            &["DGS10_mva050"],
            DomainTransform::PctChange,
        )]);
        let graph = FeatureGraph::plan(
            &panel(&["GDP", "DGS10"]),
            &registry(),
            &optional,
            &FeatureFilter::default(),
        )
        .unwrap();
        assert_eq!(graph.waves[0][0].unresolved, vec!["DGS10_mva050".to_string()]);

        let required = catalog(vec![DomainFeatureDef::new(
            "X",
            &["DGS10_mva050"],
            DomainTransform::PctChange,
        )
        .required()]);
        let result = FeatureGraph::plan(
            &panel(&["GDP", "DGS10"]),
            &registry(),
            &required,
            &FeatureFilter::default(),
        );
        assert!(matches!(result, Err(ConfigError::UnresolvedInput { .. })));
    }

    #[test]
    fn filter_keeps_dependencies_of_listed_features() {
        let cat = catalog(vec![
            DomainFeatureDef::new("SPREAD", &["GDP_Log", "DGS10"], DomainTransform::Difference),
            DomainFeatureDef::new("SIG", &["SPREAD"], DomainTransform::Signal { threshold: 0.0 }),
            DomainFeatureDef::new("OTHER", &["DGS10"], DomainTransform::PctChange),
        ]);
        let graph = FeatureGraph::plan(
            &panel(&["GDP", "DGS10"]),
            &registry(),
            &cat,
            &FeatureFilter::new(["SIG"]),
        )
        .unwrap();

        let outputs: Vec<&str> = graph.tier1_outputs().map(|d| d.output.as_str()).collect();
        assert_eq!(outputs, vec!["GDP_Log"]);
        let domain: Vec<&str> = graph
            .waves
            .iter()
            .flatten()
            .map(|n| n.def.name.as_str())
            .collect();
        assert_eq!(domain, vec!["SPREAD", "SIG"]);
    }
}
