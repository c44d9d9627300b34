//! Pure merge planning: which trees feed a target, in declaration order.

use std::collections::BTreeSet;

/// One resolved import in a merge plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanInput {
    /// Read the named target's entry from the merge store. Topological
    /// ordering guarantees it was written earlier in this run (or by a
    /// prior run).
    MergedTarget(String),
    /// Read the named source's whole tree from its driver.
    Source(String),
    /// The import matched neither a target nor a source; it contributes an
    /// empty tree and a warning at execution time.
    Unknown(String),
}

/// An ordered list of inputs to fold into a target's merged tree. Building a
/// plan performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub target: String,
    pub inputs: Vec<PlanInput>,
}

impl MergePlan {
    pub fn build(
        target: &str,
        imports: &[String],
        targets: &BTreeSet<String>,
        sources: &BTreeSet<String>,
    ) -> Self {
        let inputs = imports
            .iter()
            .map(|import| {
                if targets.contains(import) {
                    PlanInput::MergedTarget(import.clone())
                } else if sources.contains(import) {
                    PlanInput::Source(import.clone())
                } else {
                    PlanInput::Unknown(import.clone())
                }
            })
            .collect();
        Self {
            target: target.to_string(),
            inputs,
        }
    }

    /// Names of the targets this plan reads from the merge store.
    pub fn target_imports(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|input| match input {
            PlanInput::MergedTarget(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_each_import_in_declaration_order() {
        let targets: BTreeSet<String> = ["Stg".to_string()].into();
        let sources: BTreeSet<String> = ["base".to_string()].into();

        let plan = MergePlan::build(
            "Prod",
            &["base".into(), "Stg".into(), "mystery".into()],
            &targets,
            &sources,
        );

        assert_eq!(
            plan.inputs,
            vec![
                PlanInput::Source("base".into()),
                PlanInput::MergedTarget("Stg".into()),
                PlanInput::Unknown("mystery".into()),
            ]
        );
        assert_eq!(plan.target_imports().collect::<Vec<_>>(), vec!["Stg"]);
    }

    #[test]
    fn a_target_name_shadows_a_source_name() {
        let targets: BTreeSet<String> = ["shared".to_string()].into();
        let sources: BTreeSet<String> = ["shared".to_string()].into();
        let plan = MergePlan::build("T", &["shared".into()], &targets, &sources);
        assert_eq!(plan.inputs, vec![PlanInput::MergedTarget("shared".into())]);
    }
}
