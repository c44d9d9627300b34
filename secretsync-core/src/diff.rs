//! Diffing a desired merged tree against an observed destination inventory.

use secretsync_spec::{values_equal, SecretPath, SecretTree};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Both sides of a changed secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Modified {
    pub current: Value,
    pub desired: Value,
}

/// The four disjoint outcomes of comparing desired state with observed
/// state, keyed by logical path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    pub added: BTreeMap<SecretPath, Value>,
    pub removed: BTreeMap<SecretPath, Value>,
    pub modified: BTreeMap<SecretPath, Modified>,
    pub unchanged: BTreeSet<SecretPath>,
}

impl Diff {
    /// Compare `desired` (the merged tree) against `observed` (the
    /// destination inventory).
    pub fn compute(desired: &SecretTree, observed: &SecretTree) -> Self {
        let mut diff = Diff::default();

        for (path, desired_value) in desired {
            match observed.get(path) {
                None => {
                    diff.added.insert(path.clone(), desired_value.clone());
                }
                Some(current) if values_equal(current, desired_value) => {
                    diff.unchanged.insert(path.clone());
                }
                Some(current) => {
                    diff.modified.insert(
                        path.clone(),
                        Modified {
                            current: current.clone(),
                            desired: desired_value.clone(),
                        },
                    );
                }
            }
        }

        for (path, current) in observed {
            if !desired.contains_key(path) {
                diff.removed.insert(path.clone(), current.clone());
            }
        }

        diff
    }

    /// True when nothing would change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// (added, removed, modified, unchanged) counts.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.added.len(),
            self.removed.len(),
            self.modified.len(),
            self.unchanged.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(entries: &[(&str, Value)]) -> SecretTree {
        entries
            .iter()
            .map(|(path, value)| (SecretPath::parse(path).unwrap(), value.clone()))
            .collect()
    }

    #[test]
    fn partitions_into_four_disjoint_sets() {
        let desired = tree(&[
            ("foo", json!("2")),
            ("bar", json!("3")),
            ("same", json!({"a": 1})),
        ]);
        let observed = tree(&[
            ("foo", json!("1")),
            ("orphan", json!("x")),
            ("same", json!({"a": 1})),
        ]);

        let diff = Diff::compute(&desired, &observed);
        assert_eq!(diff.counts(), (1, 1, 1, 1));
        assert!(diff.added.contains_key(&SecretPath::parse("bar").unwrap()));
        assert!(diff
            .removed
            .contains_key(&SecretPath::parse("orphan").unwrap()));

        let modified = &diff.modified[&SecretPath::parse("foo").unwrap()];
        assert_eq!(modified.current, json!("1"));
        assert_eq!(modified.desired, json!("2"));
    }

    #[test]
    fn key_order_differences_are_unchanged() {
        let desired = tree(&[("cfg", serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap())]);
        let observed = tree(&[("cfg", serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap())]);
        let diff = Diff::compute(&desired, &observed);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged.len(), 1);
    }

    #[test]
    fn identical_trees_produce_empty_diff() {
        let desired = tree(&[("a", json!(1)), ("b", json!([1, 2]))]);
        let diff = Diff::compute(&desired, &desired.clone());
        assert!(diff.is_empty());
    }
}
