//! Target inheritance graph: cycle detection and topological ordering.

use crate::config::TargetConfig;
use secretsync_spec::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// The inheritance graph over targets. An edge `T -> U` exists when target
/// `T` imports target `U`; imports naming sources are not edges.
#[derive(Debug, Clone)]
pub struct TargetGraph {
    imports: BTreeMap<String, Vec<String>>,
}

impl TargetGraph {
    /// Derive the graph from the finalized target map (static plus expanded
    /// dynamic targets).
    pub fn build(targets: &BTreeMap<String, TargetConfig>) -> Self {
        let mut imports = BTreeMap::new();
        for (name, target) in targets {
            let edges = target
                .imports
                .iter()
                .filter(|import| targets.contains_key(*import))
                .cloned()
                .collect();
            imports.insert(name.clone(), edges);
        }
        Self { imports }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.imports.contains_key(name)
    }

    /// Whether `name` imports at least one other target (as opposed to only
    /// sources and unknowns).
    pub fn is_inherited(&self, name: &str) -> bool {
        self.imports
            .get(name)
            .is_some_and(|edges| !edges.is_empty())
    }

    /// Reject cycles. Reports the full chain of names for the first cycle
    /// found; a self-import is called out explicitly.
    pub fn validate(&self) -> Result<()> {
        let mut visited = BTreeSet::new();
        for name in self.imports.keys() {
            if visited.contains(name.as_str()) {
                continue;
            }
            let mut stack = Vec::new();
            let mut on_stack = BTreeSet::new();
            self.detect_cycle(name, &mut visited, &mut stack, &mut on_stack)?;
        }
        Ok(())
    }

    fn detect_cycle<'a>(
        &'a self,
        name: &'a str,
        visited: &mut BTreeSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut BTreeSet<&'a str>,
    ) -> Result<()> {
        visited.insert(name);
        stack.push(name);
        on_stack.insert(name);

        for import in self.imports.get(name).into_iter().flatten() {
            if import == name {
                return Err(Error::CycleDetected {
                    chain: format!("{name} -> {name} (target imports itself)"),
                });
            }
            if on_stack.contains(import.as_str()) {
                let start = stack
                    .iter()
                    .position(|entry| *entry == import.as_str())
                    .unwrap_or(0);
                let mut chain: Vec<&str> = stack[start..].to_vec();
                chain.push(import.as_str());
                return Err(Error::CycleDetected {
                    chain: chain.join(" -> "),
                });
            }
            if !visited.contains(import.as_str()) {
                self.detect_cycle(import, visited, stack, on_stack)?;
            }
        }

        stack.pop();
        on_stack.remove(name);
        Ok(())
    }

    /// Kahn's algorithm with ties broken by ascending target name, so every
    /// import precedes its importer and the order is stable across runs.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (name, edges) in &self.imports {
            indegree.entry(name.as_str()).or_insert(0);
            for import in edges {
                *indegree.entry(name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(import.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.imports.len());
        while let Some(name) = ready.iter().next().copied() {
            ready.remove(name);
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = indegree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    /// The given targets plus every target they transitively import. Used to
    /// honor a `--targets` selection without breaking inheritance.
    pub fn closure(&self, names: &[String]) -> BTreeSet<String> {
        let mut wanted = BTreeSet::new();
        let mut pending: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|name| self.contains(name))
            .collect();
        while let Some(name) = pending.pop() {
            if !wanted.insert(name.to_string()) {
                continue;
            }
            for import in self.imports.get(name).into_iter().flatten() {
                pending.push(import.as_str());
            }
        }
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(edges: &[(&str, &[&str])]) -> BTreeMap<String, TargetConfig> {
        edges
            .iter()
            .map(|(name, imports)| {
                (
                    name.to_string(),
                    TargetConfig {
                        imports: imports.iter().map(|s| s.to_string()).collect(),
                        ..TargetConfig::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn two_node_cycle_is_reported_with_chain() {
        let graph = TargetGraph::build(&targets(&[("A", &["B"]), ("B", &["A"])]));
        let err = graph.validate().unwrap_err();
        match err {
            Error::CycleDetected { chain } => {
                assert!(chain == "A -> B -> A" || chain == "B -> A -> B", "{chain}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_import_is_distinguished() {
        let graph = TargetGraph::build(&targets(&[("A", &["A"])]));
        let err = graph.validate().unwrap_err();
        match err {
            Error::CycleDetected { chain } => assert!(chain.contains("imports itself")),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = TargetGraph::build(&targets(&[
            ("A", &["B", "C"]),
            ("B", &["C"]),
            ("C", &[]),
        ]));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn imports_naming_sources_are_ignored() {
        let graph = TargetGraph::build(&targets(&[("A", &["some-source", "B"]), ("B", &[])]));
        assert!(graph.validate().is_ok());
        assert!(graph.is_inherited("A"));
        assert!(!graph.is_inherited("B"));
    }

    #[test]
    fn topological_order_puts_imports_first() {
        let graph = TargetGraph::build(&targets(&[
            ("Prod", &["Stg"]),
            ("Stg", &["Base"]),
            ("Base", &[]),
        ]));
        let order = graph.topological_order();
        assert_eq!(order, vec!["Base", "Stg", "Prod"]);

        let position = |name: &str| order.iter().position(|entry| entry == name).unwrap();
        assert!(position("Base") < position("Stg"));
        assert!(position("Stg") < position("Prod"));
    }

    #[test]
    fn ties_break_by_ascending_name() {
        let graph = TargetGraph::build(&targets(&[
            ("zeta", &[]),
            ("alpha", &[]),
            ("mid", &["zeta"]),
        ]));
        assert_eq!(graph.topological_order(), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn closure_pulls_in_ancestors() {
        let graph = TargetGraph::build(&targets(&[
            ("Prod", &["Stg"]),
            ("Stg", &["Base"]),
            ("Base", &[]),
            ("Other", &[]),
        ]));
        let closure = graph.closure(&["Prod".to_string()]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec!["Base", "Prod", "Stg"]
        );
    }
}
