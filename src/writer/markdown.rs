//! Pure Markdown rendering for per-group and run reports.
//!
//! Functions here take an immutable snapshot and return a `String`; they
//! never touch the filesystem or the model lock, so they are trivial to unit
//! test against the exact shapes in the report format.

use std::fmt::Write as _;

use crate::model::{Counts, GroupSnapshot, RunState, Status};

fn front_matter(pairs: &[(&str, String)]) -> String {
    let mut out = String::from("---\n");
    for (key, value) in pairs {
        let _ = writeln!(out, "{}: {}", key, value);
    }
    out.push_str("---\n");
    out
}

fn group_displayed_status(status: Status) -> &'static str {
    match status {
        Status::Pending => "PENDING",
        Status::Running => "RUNNING",
        Status::Pass | Status::Fail | Status::Skip => "COMPLETED",
    }
}

fn fmt_duration_ms(ms: Option<u64>) -> String {
    format!("{}ms", ms.unwrap_or(0))
}

fn fmt_duration(d: Option<std::time::Duration>) -> String {
    match d {
        Some(d) => format!("{:.2}s", d.as_secs_f64()),
        None => "0.00s".to_string(),
    }
}

fn counts_block(counts: Counts, label_zero_as: Option<&str>) -> String {
    let mut lines = Vec::new();
    if counts.passed > 0 {
        lines.push(format!("- Passed: {}", counts.passed));
    }
    if counts.failed > 0 {
        lines.push(format!("- Failed: {}", counts.failed));
    }
    if counts.skipped > 0 {
        lines.push(format!("- Skipped: {}", counts.skipped));
    }
    if lines.is_empty() {
        if let Some(zero) = label_zero_as {
            return zero.to_string();
        }
    }
    lines.join("\n")
}

/// Renders one group's `index.md`: front matter, status line, direct stats,
/// test cases, a subgroup table (recursive counts), and captured output.
pub fn render_group_report(snapshot: &GroupSnapshot, relative_report_links: &[(String, String)]) -> String {
    let group = &snapshot.group;
    let path = group.full_path().join(" › ");

    let mut out = front_matter(&[
        ("group", group.name.clone()),
        ("path", path.clone()),
        ("status", group_displayed_status(group.status).to_string()),
        ("created", group.created.to_rfc3339()),
        ("updated", group.updated.to_rfc3339()),
        ("duration", fmt_duration(group.duration)),
    ]);

    out.push('\n');
    let _ = writeln!(out, "# {}", group.name);
    out.push('\n');
    let _ = writeln!(out, "Status: **{}**", group.status.label());
    out.push('\n');

    let stats = counts_block(group.direct, None);
    if !stats.is_empty() {
        out.push_str("## Statistics\n\n");
        out.push_str(&stats);
        out.push_str("\n\n");
    }

    if !group.test_cases.is_empty() {
        out.push_str("## Test Cases\n\n");
        for case in &group.test_cases {
            let _ = writeln!(
                out,
                "{} {} ({})",
                case.status.glyph(),
                case.name,
                fmt_duration_ms(case.duration_ms)
            );
            if case.status == Status::Fail {
                if let Some(err) = &case.error {
                    out.push_str("```\n");
                    out.push_str(&err.message);
                    out.push_str("\n```\n");
                }
            }
        }
        out.push('\n');
    }

    if !snapshot.children.is_empty() {
        out.push_str("## Subgroups\n\n");
        out.push_str("| Status | Name | Tests | Report |\n");
        out.push_str("|---|---|---|---|\n");
        for child in &snapshot.children {
            let counts = child.group.display_counts();
            let report_link = relative_report_links
                .iter()
                .find(|(id, _)| id == &child.group.id.as_hex())
                .map(|(_, link)| link.clone())
                .unwrap_or_else(|| "./index.md".to_string());
            let _ = writeln!(
                out,
                "| {} | {} | {} | [{}]({}) |",
                child.group.status.label(),
                child.group.name,
                counts.total,
                "index.md",
                report_link
            );
        }
        out.push('\n');
    }

    if !group.stdout.is_empty() {
        out.push_str("## stdout\n\n```\n");
        out.push_str(&group.stdout);
        out.push_str("\n```\n\n");
    }
    if !group.stderr.is_empty() {
        out.push_str("## stderr\n\n```\n");
        out.push_str(&group.stderr);
        out.push_str("\n```\n\n");
    }

    out
}

/// Parameters needed to render the top-level run report, gathered by the
/// writer from [`RunState`] and the model's root snapshots.
pub struct RunReportInput<'a> {
    pub run: &'a RunState,
    pub roots: &'a [GroupSnapshot],
    pub root_links: &'a [(String, String)],
    pub pending_count: usize,
    pub wall_clock: std::time::Duration,
}

fn tests_cell(snapshot: &GroupSnapshot) -> String {
    let group = &snapshot.group;
    if !group.status.is_terminal() {
        let running = snapshot
            .children
            .iter()
            .filter(|c| c.group.status == Status::Running)
            .count() as u32;
        let counts = group.direct;
        let mut parts = Vec::new();
        if counts.passed > 0 {
            parts.push(format!("{} passed", counts.passed));
        }
        if counts.failed > 0 {
            parts.push(format!("{} failed", counts.failed));
        }
        if running > 0 {
            parts.push(format!("{} running", running));
        }
        if counts.skipped > 0 {
            parts.push(format!("{} skipped", counts.skipped));
        }
        if parts.is_empty() {
            let pending = snapshot
                .children
                .iter()
                .filter(|c| c.group.status == Status::Pending)
                .count()
                + group
                    .test_cases
                    .iter()
                    .filter(|t| t.status == Status::Pending)
                    .count();
            return format!("{pending} pending");
        }
        return parts.join(", ");
    }

    if !group.errors.is_empty() && group.test_cases.is_empty() && snapshot.children.is_empty() {
        return "setup failed".to_string();
    }

    let counts = group.display_counts();
    let mut parts = Vec::new();
    if counts.passed > 0 {
        parts.push(format!("{} passed", counts.passed));
    }
    if counts.failed > 0 {
        parts.push(format!("{} failed", counts.failed));
    }
    if counts.skipped > 0 {
        parts.push(format!("{} skipped", counts.skipped));
    }
    if parts.is_empty() {
        return "0 tests".to_string();
    }
    parts.join(", ")
}

/// Renders `test-run.md`.
pub fn render_run_report(input: &RunReportInput<'_>) -> String {
    let mut out = front_matter(&[
        ("run_id", input.run.run_id.clone()),
        ("run_path", input.run.run_dir.display().to_string()),
        ("detected_runner", input.run.detected_runner.clone()),
        ("modified_command", format!("\"{}\"", input.run.modified_command)),
        ("created", input.run.created.to_rfc3339()),
        ("updated", input.run.updated.to_rfc3339()),
        ("status", input.run.displayed(input.pending_count).to_string()),
    ]);

    out.push('\n');
    out.push_str("# Test Run\n\n");
    let _ = writeln!(out, "Command: `{}`", input.run.modified_command);
    out.push_str("\n[Full output](./output.log)\n\n");

    let mut totals = Counts::default();
    for root in input.roots {
        let counts = root.group.display_counts();
        totals.total += counts.total;
        totals.passed += counts.passed;
        totals.failed += counts.failed;
        totals.skipped += counts.skipped;
    }
    let running = totals.total.saturating_sub(totals.passed + totals.failed + totals.skipped);

    out.push_str("## Summary\n\n");
    let _ = writeln!(out, "- Total: {}", totals.total);
    let _ = writeln!(out, "- Completed: {}", totals.passed + totals.failed + totals.skipped);
    let _ = writeln!(out, "- Running: {}", running);
    let _ = writeln!(out, "- Passed: {}", totals.passed);
    let _ = writeln!(out, "- Failed: {}", totals.failed);
    let _ = writeln!(out, "- Skipped: {}", totals.skipped);
    let _ = writeln!(out, "- Duration: {:.2}s", input.wall_clock.as_secs_f64());
    out.push('\n');

    out.push_str("## Groups\n\n");
    out.push_str("| Status | Name | Tests | Duration | Report |\n");
    out.push_str("|---|---|---|---|---|\n");
    for root in input.roots {
        let link = input
            .root_links
            .iter()
            .find(|(id, _)| id == &root.group.id.as_hex())
            .map(|(_, link)| link.clone())
            .unwrap_or_else(|| "./reports/index.md".to_string());
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | [index.md]({}) |",
            root.group.status.label(),
            root.group.name,
            tests_cell(root),
            fmt_duration(root.group.duration),
            link
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::group_id;
    use crate::model::{Group, GroupSnapshot, RunStatus};

    fn empty_group(name: &str) -> Group {
        crate::model::test_support::new_group_for_test(group_id(&[], name), name.to_string(), vec![])
    }

    #[test]
    fn renders_zero_ms_duration() {
        let mut group = empty_group("t.js");
        group.status = Status::Pass;
        let mut case = crate::model::test_support::new_case_for_test(
            crate::identity::test_case_id(&["t.js".to_string()], "a"),
            "a".to_string(),
            group.id,
        );
        case.status = Status::Pass;
        case.duration_ms = Some(0);
        group.test_cases.push(case);

        let snapshot = GroupSnapshot {
            group,
            children: vec![],
        };
        let rendered = render_group_report(&snapshot, &[]);
        assert!(rendered.contains("(0ms)"));
    }

    #[test]
    fn run_report_front_matter_round_trips() {
        let run = RunState {
            run_id: "20260101T000000-brave-otter".to_string(),
            run_dir: std::path::PathBuf::from("/tmp/.3pio/runs/x"),
            detected_runner: "generic".to_string(),
            modified_command: "npm test".to_string(),
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
            status: RunStatus::Completed,
            error: None,
        };
        let input = RunReportInput {
            run: &run,
            roots: &[],
            root_links: &[],
            pending_count: 0,
            wall_clock: std::time::Duration::from_secs(1),
        };
        let rendered = render_run_report(&input);
        let front = rendered.split("---\n").nth(1).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(front).unwrap();
        assert_eq!(parsed["run_id"].as_str().unwrap(), run.run_id);
        assert_eq!(parsed["status"].as_str().unwrap(), "COMPLETED");
    }

    #[test]
    fn tests_cell_counts_unstarted_children_and_cases_as_pending() {
        let mut group = empty_group("suite.js");
        group.status = Status::Running;
        let mut case = crate::model::test_support::new_case_for_test(
            crate::identity::test_case_id(&["suite.js".to_string()], "a"),
            "a".to_string(),
            group.id,
        );
        case.status = Status::Pending;
        group.test_cases.push(case);

        let mut child = empty_group("nested");
        child.status = Status::Pending;
        let snapshot = GroupSnapshot {
            group,
            children: vec![GroupSnapshot {
                group: child,
                children: vec![],
            }],
        };

        assert_eq!(tests_cell(&snapshot), "2 pending");
    }
}
