//! Orchestrator (C8): the run's top-level state machine.
//!
//! Drives {Init, Prepared, Running, Draining, Terminated} in sequence, owns
//! the child process, and wires every other component's channels together.
//! Phases beyond `Init`/`Prepared` are implicit in the control flow below
//! rather than tracked as an explicit enum value — there is exactly one
//! orchestrator per run and its state never needs to be inspected from
//! outside this function.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::{RwLock, broadcast, mpsc, watch};

use crate::config::RunConfig;
use crate::event::Event;
use crate::model::{self, ModelHandle, RunState, RunStatus};
use crate::presenter::{self, Presenter, SummaryOutcome};
use crate::run::{RunId, RunPaths};
use crate::runner;
use crate::sink::{self, OutputChunk, OutputSink};
use crate::writer::{self, Writer};
use crate::{ipc, native};

/// Exit code used when the child could not be spawned at all, distinct from
/// any code the child itself could produce (spec.md §6, §7 category 1).
pub const STARTUP_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn test command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs one full test command and materializes its execution into `.3pio/`.
pub struct Orchestrator {
    cwd: PathBuf,
    command: Vec<String>,
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(cwd: PathBuf, command: Vec<String>, config: RunConfig) -> Self {
        Self { cwd, command, config }
    }

    /// Drives Init through Terminated. Only a startup error (run directory
    /// creation, `output.log` creation, or the child failing to spawn) stops
    /// the run short; everything after the child starts is best-effort and
    /// recorded, never fatal, per spec.md §7. Returns the process exit code
    /// the binary should use.
    pub async fn run(self) -> Result<i32> {
        // --- Init ---
        let run_id = RunId::generate();
        let paths = RunPaths::new(&self.cwd, &run_id);
        paths
            .ensure_created()
            .with_context(|| format!("failed to create run directory under {}", paths.base_dir.display()))?;

        let model = ModelHandle::new();
        let (events_tx, events_rx) = mpsc::channel::<Event>(1024);
        let (changes_tx, _discard) = broadcast::channel(256);
        let writer_changes = changes_tx.subscribe();
        let presenter_changes = changes_tx.subscribe();
        let model_task = tokio::spawn(model::run_model(model.clone(), events_rx, changes_tx));

        // --- Prepared ---
        let detected = runner::detect_and_modify(&self.command);
        let run_state = Arc::new(RwLock::new(RunState {
            run_id: run_id.as_str().to_string(),
            run_dir: paths.run_dir.clone(),
            detected_runner: detected.kind.label().to_string(),
            modified_command: detected.command_line(),
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
            status: RunStatus::Running,
            error: None,
        }));

        let writer = Writer::new(
            model.clone(),
            paths.clone(),
            self.config.timing.group_debounce(),
            self.config.timing.run_debounce(),
            self.config.timing.max_wait(),
            self.config.report.component_cap,
            self.config.report.depth_cap,
        );
        let writer_task = tokio::spawn(writer::run(writer, writer_changes, run_state.clone()));

        let presenter = Presenter::new(model.clone(), paths.clone());
        let presenter_task = tokio::spawn(presenter.run(presenter_changes));

        presenter::print_greeting(&detected.command_line(), &paths.run_report);

        // Write the initial run report immediately so `test-run.md` exists
        // with the modified command recorded before the child produces any
        // output, per the Prepared-state responsibility in spec.md §4.8.
        write_run_report_now(&model, &paths, &self.config, &run_state).await;

        let (tailer_shutdown_tx, tailer_shutdown_rx) = watch::channel(false);
        let ipc_task = tokio::spawn(ipc::run(
            paths.ipc_file.clone(),
            self.config.timing.ipc_poll(),
            events_tx.clone(),
            tailer_shutdown_rx.clone(),
        ));
        // The source avoids tailing output.log for adapter-based runners on
        // Windows (spec.md §9); the generic stand-in always requests IPC, so
        // on Windows that makes C6 redundant with C5 rather than a second
        // producer worth running.
        let native_task = if detected.uses_ipc && cfg!(windows) {
            None
        } else {
            Some(tokio::spawn(native::run(
                paths.output_log.clone(),
                self.config.timing.native_poll(),
                events_tx.clone(),
                tailer_shutdown_rx.clone(),
            )))
        };
        // Our own clone must drop so the channel closes once both tailers
        // finish; they hold their own clones for the lifetime of their task.
        drop(events_tx);

        // --- Running ---
        let mut command = Command::new(&detected.modified_command[0]);
        command
            .args(&detected.modified_command[1..])
            .current_dir(&self.cwd)
            .env("THREEPIO_IPC_PATH", &paths.ipc_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = tailer_shutdown_tx.send(true);
                let _ = ipc_task.await;
                if let Some(native_task) = native_task {
                    let _ = native_task.await;
                }
                let _ = model_task.await;
                if let Ok(mut writer) = writer_task.await {
                    let mut state = run_state.write().await;
                    state.status = RunStatus::Errored;
                    state.error = Some(format!("failed to start test command: {source}"));
                    state.updated = chrono::Utc::now();
                    let snapshot = state.clone();
                    drop(state);
                    let _ = writer.finalize(&snapshot).await;
                }
                if let Ok(presenter) = presenter_task.await {
                    presenter.print_summary(SummaryOutcome::default());
                }
                return Err(OrchestratorError::Spawn {
                    command: detected.command_line(),
                    source,
                }
                .into());
            }
        };

        let sink = OutputSink::create(&paths.output_log)
            .await
            .context("failed to open output.log")?;
        let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(1024);
        let stdout = child.stdout.take().expect("child spawned with piped stdout");
        let stderr = child.stderr.take().expect("child spawned with piped stderr");
        sink::spawn_reader(stdout, chunk_tx.clone());
        sink::spawn_reader(stderr, chunk_tx.clone());
        drop(chunk_tx);
        let sink_task = tokio::spawn(async move {
            let mut sink = sink;
            let _ = sink.drain(chunk_rx).await;
            sink.close().await
        });

        let exit_status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::signal::ctrl_c() => {
                // Draining: first Ctrl-C forwards via the default Unix
                // process-group signal delivery and waits for the child to
                // exit on its own within the grace deadline. `ctrl_c()` is
                // one-shot, so the second wait below calls it again fresh
                // rather than re-polling the already-completed future.
                tokio::select! {
                    status = child.wait() => status,
                    _ = tokio::time::sleep(self.config.timing.drain_grace()) => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                    _ = tokio::signal::ctrl_c() => {
                        // Terminated: second Ctrl-C forces an immediate kill.
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        };
        let exit_status = exit_status.context("failed to wait on child process")?;
        let exit_code = exit_status.code().unwrap_or(1);

        // --- Terminated ---
        let _ = tailer_shutdown_tx.send(true);
        let _ = ipc_task.await;
        if let Some(native_task) = native_task {
            let _ = native_task.await;
        }
        sink_task
            .await
            .context("output sink task panicked")?
            .context("failed to close output.log")?;

        // Dropping every events_tx clone (done above and inside each tailer
        // task as it returns) closes the model's input channel, so this
        // always completes once both tailers have exited.
        model_task.await.context("model task panicked")?;

        let roots = model.snapshot_roots().await;
        let mut outcome = SummaryOutcome::default();
        for root in &roots {
            let counts = root.group.display_counts();
            outcome.passed += counts.passed;
            outcome.failed += counts.failed;
            outcome.skipped += counts.skipped;
            outcome.total += counts.total;
        }

        // Execution-error detection per spec.md §7 category 2: no groups
        // discovered plus a nonstandard exit code means the run never really
        // started, regardless of what the child's own exit code claims.
        let final_status = if roots.is_empty() && exit_code != 0 && exit_code != 1 {
            RunStatus::Errored
        } else {
            RunStatus::Completed
        };

        {
            let mut state = run_state.write().await;
            state.status = final_status;
            state.updated = chrono::Utc::now();
            if final_status == RunStatus::Errored {
                let tail = sink::read_tail(&paths.output_log, 4096).await.unwrap_or_default();
                eprintln!("No tests were discovered and the test command exited with code {exit_code}.");
                eprintln!("--- tail of output.log ---");
                eprintln!("{tail}");
                state.error = Some(format!(
                    "test command exited with code {exit_code} and discovered no tests"
                ));
            }
        }

        if let Ok(mut writer) = writer_task.await {
            let state = run_state.read().await.clone();
            let _ = writer.finalize(&state).await;
        }

        if let Ok(presenter) = presenter_task.await {
            presenter.print_summary(outcome);
        }

        Ok(exit_code)
    }
}

/// One-shot forced write of the run report, used at Prepared so
/// `test-run.md` exists with the modified command recorded even if the
/// child produces no output for a while.
async fn write_run_report_now(
    model: &ModelHandle,
    paths: &RunPaths,
    config: &RunConfig,
    run_state: &Arc<RwLock<RunState>>,
) {
    let mut writer = Writer::new(
        model.clone(),
        paths.clone(),
        config.timing.group_debounce(),
        config.timing.run_debounce(),
        config.timing.max_wait(),
        config.report.component_cap,
        config.report.depth_cap,
    );
    let state = run_state.read().await.clone();
    let _ = writer.finalize(&state).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        // Keep the test suite fast: shrink every debounce/poll interval well
        // below the defaults tuned for real test runners.
        config.timing.group_debounce_ms = 5;
        config.timing.run_debounce_ms = 5;
        config.timing.max_wait_ms = 50;
        config.timing.native_poll_ms = 5;
        config.timing.ipc_poll_ms = 5;
        config.timing.drain_grace_ms = 200;
        config
    }

    #[tokio::test]
    async fn mirrors_the_child_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path().to_path_buf(),
            vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            config(),
        );
        let exit_code = orchestrator.run().await.unwrap();
        assert_eq!(exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_mirrored_and_not_treated_as_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path().to_path_buf(),
            vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            config(),
        );
        let exit_code = orchestrator.run().await.unwrap();
        assert_eq!(exit_code, 7);
    }

    #[tokio::test]
    async fn an_unspawnable_command_returns_the_startup_failure_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path().to_path_buf(),
            vec!["this-binary-does-not-exist-anywhere".to_string()],
            config(),
        );
        let err = orchestrator.run().await.unwrap_err();
        assert!(err.downcast_ref::<OrchestratorError>().is_some());
    }

    #[tokio::test]
    async fn writes_a_run_report_under_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_path_buf();
        let orchestrator = Orchestrator::new(cwd.clone(), vec!["true".to_string()], config());
        orchestrator.run().await.unwrap();

        let runs_dir = cwd.join(".3pio").join("runs");
        let mut entries = std::fs::read_dir(&runs_dir).unwrap();
        let run_dir = entries.next().unwrap().unwrap().path();
        assert!(run_dir.join("test-run.md").exists());
        assert!(run_dir.join("output.log").exists());
    }

    #[tokio::test]
    async fn a_silent_failing_command_is_reported_as_errored() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_path_buf();
        let orchestrator = Orchestrator::new(
            cwd.clone(),
            vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
            config(),
        );
        let exit_code = orchestrator.run().await.unwrap();
        assert_eq!(exit_code, 2);

        let runs_dir = cwd.join(".3pio").join("runs");
        let run_dir = std::fs::read_dir(&runs_dir).unwrap().next().unwrap().unwrap().path();
        let report = std::fs::read_to_string(run_dir.join("test-run.md")).unwrap();
        assert!(report.contains("ERRORED"));
    }
}
