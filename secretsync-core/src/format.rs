//! Rendering of diffs and run reports.
//!
//! Secret values are masked in every format unless the caller explicitly
//! opts into unmasked output.

use crate::diff::Diff;
use crate::report::RunReport;
use colored::Colorize;
use secretsync_spec::{Error, Phase, SecretPath};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::str::FromStr;

const MASK: &str = "********";

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    Compact,
    Json,
    Github,
    SideBySide,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(OutputFormat::Human),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            "github" => Ok(OutputFormat::Github),
            "side-by-side" => Ok(OutputFormat::SideBySide),
            other => Err(Error::ConfigInvalid(format!(
                "unknown output format `{other}` (expected human, compact, json, github, or side-by-side)"
            ))),
        }
    }
}

/// Render a full run report in the requested format.
pub fn render_report(report: &RunReport, format: OutputFormat, unmask: bool) -> String {
    match format {
        OutputFormat::Human => render_human(report, unmask),
        OutputFormat::Compact => render_compact(report, unmask),
        OutputFormat::Json => render_json(report, unmask),
        OutputFormat::Github => render_github(report),
        OutputFormat::SideBySide => render_side_by_side(report, unmask),
    }
}

fn display_value(value: &Value, unmask: bool) -> String {
    if unmask {
        serde_json::to_string(value).unwrap_or_else(|_| MASK.to_string())
    } else {
        MASK.to_string()
    }
}

fn indent_for(path: &SecretPath) -> String {
    "  ".repeat(path.depth().saturating_sub(1))
}

fn render_human(report: &RunReport, unmask: bool) -> String {
    let mut out = String::new();
    let rule = "=".repeat(60);
    let _ = writeln!(out, "{rule}\nPipeline Results\n{rule}");

    for phase in [Phase::Merge, Phase::Sync] {
        let results: Vec<_> = report
            .results
            .iter()
            .filter(|result| result.phase == phase)
            .collect();
        if results.is_empty() {
            continue;
        }
        let heading = match phase {
            Phase::Merge => "Merge Phase:",
            Phase::Sync => "Sync Phase:",
        };
        let _ = writeln!(out, "\n{heading}");
        for result in results {
            let status = if result.success {
                "ok".green()
            } else {
                "failed".red()
            };
            let _ = writeln!(
                out,
                "  [{status}] {} ({:.2}s)",
                result.target,
                result.duration.as_secs_f64()
            );
            for error in &result.errors {
                let _ = writeln!(out, "      {} {error}", "error:".red().bold());
            }
        }
    }

    for (target, diff) in &report.diffs {
        if diff.is_empty() {
            continue;
        }
        let (added, removed, modified, unchanged) = diff.counts();
        let _ = writeln!(
            out,
            "\n{} {target} (+{added} -{removed} ~{modified} ={unchanged})",
            "Diff for".bold()
        );
        for (path, value) in &diff.added {
            let line = format!("{}+ {path}: {}", indent_for(path), display_value(value, unmask));
            let _ = writeln!(out, "  {}", line.as_str().green());
        }
        for (path, change) in &diff.modified {
            let line = format!(
                "{}~ {path}: {} -> {}",
                indent_for(path),
                display_value(&change.current, unmask),
                display_value(&change.desired, unmask)
            );
            let _ = writeln!(out, "  {}", line.as_str().yellow());
        }
        for (path, value) in &diff.removed {
            let line = format!("{}- {path}: {}", indent_for(path), display_value(value, unmask));
            let _ = writeln!(out, "  {}", line.as_str().red());
        }
    }

    let total = report.results.len();
    let succeeded = report.results.iter().filter(|r| r.success).count();
    let _ = writeln!(out, "\nTotal: {succeeded}/{total} succeeded");
    out
}

fn render_compact(report: &RunReport, unmask: bool) -> String {
    let mut out = String::new();
    for (target, diff) in &report.diffs {
        for (path, value) in &diff.added {
            let _ = writeln!(out, "{target} + {path} {}", display_value(value, unmask));
        }
        for (path, change) in &diff.modified {
            let _ = writeln!(
                out,
                "{target} ~ {path} {} -> {}",
                display_value(&change.current, unmask),
                display_value(&change.desired, unmask)
            );
        }
        for (path, value) in &diff.removed {
            let _ = writeln!(out, "{target} - {path} {}", display_value(value, unmask));
        }
    }
    for result in report.results.iter().filter(|result| !result.success) {
        for error in &result.errors {
            let _ = writeln!(out, "{} ! {} {error}", result.target, result.phase);
        }
    }
    out
}

fn render_json(report: &RunReport, unmask: bool) -> String {
    let mask_value = |value: &Value| -> Value {
        if unmask {
            value.clone()
        } else {
            Value::String(MASK.to_string())
        }
    };

    let results: Vec<Value> = report
        .results
        .iter()
        .map(|result| {
            json!({
                "phase": result.phase.to_string(),
                "target": result.target,
                "success": result.success,
                "duration_ms": result.duration.as_millis() as u64,
                "errors": result
                    .errors
                    .iter()
                    .map(|error| json!({"code": error.code(), "message": error.to_string()}))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let diffs: serde_json::Map<String, Value> = report
        .diffs
        .iter()
        .map(|(target, diff)| {
            let added: serde_json::Map<String, Value> = diff
                .added
                .iter()
                .map(|(path, value)| (path.to_string(), mask_value(value)))
                .collect();
            let removed: serde_json::Map<String, Value> = diff
                .removed
                .iter()
                .map(|(path, value)| (path.to_string(), mask_value(value)))
                .collect();
            let modified: serde_json::Map<String, Value> = diff
                .modified
                .iter()
                .map(|(path, change)| {
                    (
                        path.to_string(),
                        json!({
                            "current": mask_value(&change.current),
                            "desired": mask_value(&change.desired),
                        }),
                    )
                })
                .collect();
            let unchanged: Vec<Value> = diff
                .unchanged
                .iter()
                .map(|path| Value::String(path.to_string()))
                .collect();
            (
                target.clone(),
                json!({
                    "added": added,
                    "removed": removed,
                    "modified": modified,
                    "unchanged": unchanged,
                }),
            )
        })
        .collect();

    let doc = json!({
        "results": results,
        "diffs": diffs,
        "summary": {
            "success": report.success(),
            "changes": report.has_changes(),
            "exit_code": report.exit_code(),
        },
    });
    serde_json::to_string_pretty(&doc).expect("report always serializes")
}

fn render_github(report: &RunReport) -> String {
    let mut out = String::new();
    for (target, diff) in &report.diffs {
        for path in diff.added.keys() {
            let _ = writeln!(out, "::notice::{target}: added {path}");
        }
        for path in diff.modified.keys() {
            let _ = writeln!(out, "::warning::{target}: modified {path}");
        }
        for path in diff.removed.keys() {
            let _ = writeln!(out, "::warning::{target}: orphaned {path}");
        }
    }
    for result in report.results.iter().filter(|result| !result.success) {
        for error in &result.errors {
            let _ = writeln!(
                out,
                "::error::{}: {} phase failed: {error}",
                result.target, result.phase
            );
        }
    }
    out
}

fn render_side_by_side(report: &RunReport, unmask: bool) -> String {
    let mut out = String::new();
    for (target, diff) in &report.diffs {
        if diff.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{target}");
        let width = diff
            .added
            .keys()
            .chain(diff.modified.keys())
            .chain(diff.removed.keys())
            .map(|path| path.as_str().len())
            .max()
            .unwrap_or(0)
            .max(4);
        let _ = writeln!(out, "  {:width$} | {:24} | {}", "path", "current", "desired");
        for (path, value) in &diff.added {
            let _ = writeln!(
                out,
                "  {:width$} | {:24} | {}",
                path.as_str(),
                "(absent)",
                display_value(value, unmask)
            );
        }
        for (path, change) in &diff.modified {
            let _ = writeln!(
                out,
                "  {:width$} | {:24} | {}",
                path.as_str(),
                display_value(&change.current, unmask),
                display_value(&change.desired, unmask)
            );
        }
        for (path, value) in &diff.removed {
            let _ = writeln!(
                out,
                "  {:width$} | {:24} | {}",
                path.as_str(),
                display_value(value, unmask),
                "(absent)"
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TargetResult;
    use secretsync_spec::{DriverError, SecretTree};
    use serde_json::json;
    use std::time::Duration;

    fn sample_report() -> RunReport {
        let mut desired = SecretTree::new();
        desired.insert(
            SecretPath::parse("app/api-key").unwrap(),
            json!("sk_live_abc"),
        );
        desired.insert(SecretPath::parse("app/db").unwrap(), json!({"host": "new"}));
        let mut observed = SecretTree::new();
        observed.insert(SecretPath::parse("app/db").unwrap(), json!({"host": "old"}));
        observed.insert(SecretPath::parse("stale").unwrap(), json!("x"));

        let mut report = RunReport::default();
        report.diffs.insert(
            "Prod".to_string(),
            Diff::compute(&desired, &observed),
        );
        report.results.push(TargetResult::ok(
            Phase::Sync,
            "Prod",
            Duration::from_millis(120),
        ));
        report.results.push(TargetResult::failed(
            Phase::Sync,
            "Stg",
            Duration::from_millis(80),
            vec![Error::DestinationList {
                target: "Stg".into(),
                source: DriverError::transient("list_secrets", "timeout"),
            }],
        ));
        report
    }

    #[test]
    fn parses_every_format_name() {
        for name in ["human", "compact", "json", "github", "side-by-side"] {
            assert!(name.parse::<OutputFormat>().is_ok(), "{name}");
        }
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn values_are_masked_by_default() {
        let report = sample_report();
        for format in [
            OutputFormat::Human,
            OutputFormat::Compact,
            OutputFormat::Json,
            OutputFormat::SideBySide,
        ] {
            let rendered = render_report(&report, format, false);
            assert!(
                !rendered.contains("sk_live_abc"),
                "secret leaked in {format:?}: {rendered}"
            );
            assert!(rendered.contains(MASK), "no mask in {format:?}");
        }
    }

    #[test]
    fn unmask_opt_in_shows_values() {
        let rendered = render_report(&sample_report(), OutputFormat::Compact, true);
        assert!(rendered.contains("sk_live_abc"));
    }

    #[test]
    fn github_format_uses_annotation_prefixes() {
        let rendered = render_report(&sample_report(), OutputFormat::Github, false);
        assert!(rendered.contains("::notice::Prod: added app/api-key"));
        assert!(rendered.contains("::warning::Prod: modified app/db"));
        assert!(rendered.contains("::error::Stg: sync phase failed"));
        // Annotations never carry secret material.
        assert!(!rendered.contains("sk_live_abc"));
    }

    #[test]
    fn json_format_is_structured() {
        let rendered = render_report(&sample_report(), OutputFormat::Json, false);
        let doc: Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(doc["summary"]["exit_code"], json!(2));
        assert_eq!(doc["diffs"]["Prod"]["added"]["app/api-key"], json!(MASK));
        let errors = doc["results"]
            .as_array()
            .unwrap()
            .iter()
            .find(|entry| entry["target"] == "Stg")
            .unwrap()["errors"]
            .as_array()
            .unwrap();
        assert_eq!(errors[0]["code"], json!("destination_list"));
    }
}
