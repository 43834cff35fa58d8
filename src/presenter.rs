//! Console Presenter (C9): the live, human-facing terminal view.
//!
//! Maintains one line per root group — label, name, elapsed time while
//! running, terminal label plus duration on completion, and (on Fail) the
//! first few failing case names with a pointer to that group's report — and
//! prints a final summary once the run ends. Writes only to the controlling
//! terminal via `indicatif`/`console`, mirroring the teacher's
//! `ConsoleReporter`; it never touches `output.log` or the report files
//! themselves.

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::identity::GroupId;
use crate::model::{ChangeKind, GroupSnapshot, ModelHandle, Notification, Status};
use crate::run::RunPaths;

const MAX_FAILED_NAMES: usize = 3;

const ALL_PASSED: &[&str] = &["All tests passed!"];
const PASSED_WITH_SKIPS: &[&str] = &["All tests passed (some skipped)."];
const ONLY_SKIPPED: &[&str] = &["Every test was skipped."];
const ANY_FAIL: &[&str] = &[
    "Some tests failed.",
    "Not quite there yet.",
    "A few tests need attention.",
];

fn status_label(status: Status) -> console::StyledObject<&'static str> {
    match status {
        Status::Pending => style("PENDING").dim(),
        Status::Running => style("RUNNING").cyan(),
        Status::Pass => style("PASS").green(),
        Status::Fail => style("FAIL").red().bold(),
        Status::Skip => style("SKIP").yellow(),
    }
}

fn fmt_duration(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.2}s", d.as_secs_f64()),
        None => "0.00s".to_string(),
    }
}

/// Prints the opening banner, before the child is spawned.
pub fn print_greeting(command_line: &str, run_report: &std::path::Path) {
    println!("Greetings! I will now execute the test command:");
    println!("`{command_line}`");
    println!();
    println!("Full report: {}", run_report.display());
    println!();
    println!("Beginning test execution now...");
    println!();
}

/// Owns one progress line per root group, created lazily as roots appear in
/// the model.
pub struct Presenter {
    multi: MultiProgress,
    model: ModelHandle,
    paths: RunPaths,
    bars: HashMap<GroupId, ProgressBar>,
    start: std::time::Instant,
}

impl Presenter {
    pub fn new(model: ModelHandle, paths: RunPaths) -> Self {
        Self {
            multi: MultiProgress::new(),
            model,
            paths,
            bars: HashMap::new(),
            start: std::time::Instant::now(),
        }
    }

    fn bar_for(&mut self, id: GroupId) -> &ProgressBar {
        self.bars.entry(id).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        })
    }

    fn relative_report_path(&self, snapshot: &GroupSnapshot) -> std::path::PathBuf {
        crate::identity::group_report_path(
            &self.paths.reports_dir,
            &snapshot.group.ancestors,
            &snapshot.group.name,
            crate::identity::DEFAULT_COMPONENT_CAP,
            crate::identity::DEFAULT_DEPTH_CAP,
        )
    }

    fn render_root(&mut self, snapshot: &GroupSnapshot) {
        let report_path = self.relative_report_path(snapshot);
        let group = snapshot.group.clone();
        let bar = self.bar_for(group.id);

        let line = format!("{} {}", status_label(group.status), group.name);
        bar.set_message(line);

        if group.status.is_terminal() {
            bar.disable_steady_tick();
            let mut final_line = format!(
                "{} {} ({})",
                status_label(group.status),
                group.name,
                fmt_duration(group.duration)
            );
            if group.status == Status::Fail {
                let failed: Vec<&str> = group
                    .test_cases
                    .iter()
                    .filter(|c| c.status == Status::Fail)
                    .map(|c| c.name.as_str())
                    .collect();
                for name in failed.iter().take(MAX_FAILED_NAMES) {
                    final_line.push_str(&format!("\n  x {name}"));
                }
                if failed.len() > MAX_FAILED_NAMES {
                    final_line.push_str(&format!("\n  + {} more", failed.len() - MAX_FAILED_NAMES));
                }
                final_line.push_str(&format!("\n  see {}", report_path.display()));
            }
            bar.finish_with_message(final_line);
        }
    }

    async fn refresh(&mut self) {
        let roots = self.model.snapshot_roots().await;
        for root in &roots {
            self.render_root(root);
        }
    }

    /// Drives the live view until `changes` closes (the run has ended).
    pub async fn run(mut self, mut changes: tokio::sync::broadcast::Receiver<Notification>) -> Self {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            match changes.recv().await {
                Ok(Notification { kind: ChangeKind::GroupChanged, .. })
                | Ok(Notification { kind: ChangeKind::RunShapeChanged, .. }) => {
                    self.refresh().await;
                }
                Err(RecvError::Lagged(_)) => {
                    self.refresh().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.refresh().await;
        self
    }

    /// Prints the closing summary block. Consumes `self` since every bar is
    /// finished by this point and there's nothing left to update.
    pub fn print_summary(self, outcome: SummaryOutcome) {
        drop(self.multi);

        println!();
        println!("{}", pick_closing(outcome));

        let mut results = format!("{} passed", outcome.passed);
        if outcome.failed > 0 {
            results.push_str(&format!(", {} failed", outcome.failed));
        }
        if outcome.skipped > 0 {
            results.push_str(&format!(", {} skipped", outcome.skipped));
        }
        results.push_str(&format!(", {} total", outcome.total));

        println!("Results:     {results}");
        println!("Total time:  {:.2}s", self.start.elapsed().as_secs_f64());
    }
}

/// The outcome counts needed to choose a closing message and render the
/// summary line, gathered by the orchestrator from the model's final state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryOutcome {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

fn pick_closing(outcome: SummaryOutcome) -> String {
    use rand::seq::SliceRandom;

    let pool: &[&str] = if outcome.failed > 0 {
        ANY_FAIL
    } else if outcome.total == 0 || outcome.total == outcome.skipped {
        ONLY_SKIPPED
    } else if outcome.skipped > 0 {
        PASSED_WITH_SKIPS
    } else {
        ALL_PASSED
    };
    let chosen = *pool.choose(&mut rand::thread_rng()).unwrap_or(&pool[0]);
    if outcome.failed > 0 {
        style(chosen).red().bold().to_string()
    } else {
        style(chosen).green().bold().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_passed_picks_the_positive_pool() {
        let outcome = SummaryOutcome {
            passed: 5,
            failed: 0,
            skipped: 0,
            total: 5,
        };
        let msg = pick_closing(outcome);
        assert!(console::strip_ansi_codes(&msg).contains("All tests passed"));
    }

    #[test]
    fn any_failure_picks_the_failure_pool() {
        let outcome = SummaryOutcome {
            passed: 2,
            failed: 1,
            skipped: 0,
            total: 3,
        };
        let msg = pick_closing(outcome);
        assert!(ANY_FAIL.iter().any(|p| console::strip_ansi_codes(&msg).contains(p)));
    }

    #[test]
    fn only_skipped_when_total_equals_skipped() {
        let outcome = SummaryOutcome {
            passed: 0,
            failed: 0,
            skipped: 4,
            total: 4,
        };
        let msg = pick_closing(outcome);
        assert!(console::strip_ansi_codes(&msg).contains("Every test was skipped"));
    }
}
