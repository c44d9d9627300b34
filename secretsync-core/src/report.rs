//! Per-target results and the aggregated run report.

use crate::diff::Diff;
use secretsync_spec::{Error, Phase};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of one target in one phase.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub phase: Phase,
    pub target: String,
    pub success: bool,
    pub duration: Duration,
    pub errors: Vec<Error>,
}

impl TargetResult {
    pub fn ok(phase: Phase, target: impl Into<String>, duration: Duration) -> Self {
        Self {
            phase,
            target: target.into(),
            success: true,
            duration,
            errors: Vec::new(),
        }
    }

    pub fn failed(
        phase: Phase,
        target: impl Into<String>,
        duration: Duration,
        errors: Vec<Error>,
    ) -> Self {
        Self {
            phase,
            target: target.into(),
            success: false,
            duration,
            errors,
        }
    }
}

/// Aggregated outcome of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Results appended in completion order, then sorted by (phase, name)
    /// before rendering.
    pub results: Vec<TargetResult>,
    /// Diffs retained per target when dry-run or diff computation was
    /// requested.
    pub diffs: BTreeMap<String, Diff>,
}

impl RunReport {
    pub fn sort_results(&mut self) {
        self.results
            .sort_by(|a, b| (a.phase, &a.target).cmp(&(b.phase, &b.target)));
    }

    pub fn success(&self) -> bool {
        self.results.iter().all(|result| result.success)
    }

    pub fn has_changes(&self) -> bool {
        self.diffs.values().any(|diff| !diff.is_empty())
    }

    /// CI exit-code contract: 2 on any error, 1 on any pending change,
    /// 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            2
        } else if self.has_changes() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secretsync_spec::{SecretPath, SecretTree};
    use serde_json::json;

    fn changed_diff() -> Diff {
        let mut desired = SecretTree::new();
        desired.insert(SecretPath::parse("foo").unwrap(), json!("2"));
        Diff::compute(&desired, &SecretTree::new())
    }

    #[test]
    fn exit_code_prefers_errors_over_changes() {
        let mut report = RunReport::default();
        assert_eq!(report.exit_code(), 0);

        report.diffs.insert("T".into(), changed_diff());
        assert_eq!(report.exit_code(), 1);

        report.results.push(TargetResult::failed(
            Phase::Sync,
            "T",
            Duration::ZERO,
            vec![Error::Cancelled],
        ));
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn results_sort_by_phase_then_name() {
        let mut report = RunReport::default();
        report
            .results
            .push(TargetResult::ok(Phase::Sync, "b", Duration::ZERO));
        report
            .results
            .push(TargetResult::ok(Phase::Merge, "z", Duration::ZERO));
        report
            .results
            .push(TargetResult::ok(Phase::Merge, "a", Duration::ZERO));
        report.sort_results();

        let keys: Vec<(Phase, &str)> = report
            .results
            .iter()
            .map(|result| (result.phase, result.target.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Phase::Merge, "a"),
                (Phase::Merge, "z"),
                (Phase::Sync, "b"),
            ]
        );
    }
}
