//! Report Writer (C4): turns model change notifications into debounced,
//! atomic writes of per-group `index.md` files and the top-level
//! `test-run.md`.
//!
//! Writes are coalesced rather than immediate: a burst of events for the same
//! group (common when a framework emits many `testCase` events back to back)
//! collapses into one render per debounce window instead of one per event.
//! Each group tracks its own small state machine — Idle, Pending (timer
//! running), Pending' (another change arrived mid-write, re-arm after), and
//! Writing — so a write in flight never observes a half-updated model and a
//! change during a write is never lost.

pub mod markdown;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use atomicwrites::AtomicFile;

use crate::identity::{group_report_path, GroupId};
use crate::model::{ChangeKind, GroupSnapshot, ModelHandle, Notification, RunState};
use crate::run::RunPaths;

use markdown::{render_group_report, render_run_report, RunReportInput};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("failed to write report at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    /// No timer running; the next change starts one.
    Idle,
    /// A debounce timer is running for this key; no write has started yet.
    Pending,
    /// A write is in flight and a further change has already arrived; once
    /// the write finishes, re-arm the timer immediately.
    WritingWithPendingFollowup,
    /// A write is in flight and nothing has changed since it started.
    Writing,
}

struct DebounceEntry {
    state: PendingState,
    deadline: Instant,
}

/// Owns write debouncing and dispatches the actual file writes. One instance
/// runs for the lifetime of a run, driven by [`run`].
pub struct Writer {
    model: ModelHandle,
    paths: RunPaths,
    group_debounce: Duration,
    run_debounce: Duration,
    max_wait: Duration,
    component_cap: usize,
    depth_cap: usize,
    group_entries: HashMap<GroupId, DebounceEntry>,
    group_first_pending: HashMap<GroupId, Instant>,
    run_entry: Option<DebounceEntry>,
    run_first_pending: Option<Instant>,
    start: Instant,
}

impl Writer {
    pub fn new(
        model: ModelHandle,
        paths: RunPaths,
        group_debounce: Duration,
        run_debounce: Duration,
        max_wait: Duration,
        component_cap: usize,
        depth_cap: usize,
    ) -> Self {
        Self {
            model,
            paths,
            group_debounce,
            run_debounce,
            max_wait,
            component_cap,
            depth_cap,
            group_entries: HashMap::new(),
            group_first_pending: HashMap::new(),
            run_entry: None,
            run_first_pending: None,
            start: Instant::now(),
        }
    }

    fn report_path(&self, snapshot: &GroupSnapshot) -> PathBuf {
        group_report_path(
            &self.paths.reports_dir,
            &snapshot.group.ancestors,
            &snapshot.group.name,
            self.component_cap,
            self.depth_cap,
        )
    }

    /// Registers that `group_id` changed, arming or extending its debounce
    /// timer. Called from the notification loop; does no I/O itself.
    fn mark_group_pending(&mut self, id: GroupId, now: Instant) {
        let first_seen = *self.group_first_pending.entry(id).or_insert(now);
        let capped = now + self.group_debounce.min(self.max_wait.saturating_sub(now - first_seen));
        let deadline = capped.max(now);

        match self.group_entries.get_mut(&id) {
            Some(entry) if entry.state == PendingState::Writing => {
                entry.state = PendingState::WritingWithPendingFollowup;
            }
            Some(entry) if entry.state == PendingState::WritingWithPendingFollowup => {}
            Some(entry) => {
                entry.state = PendingState::Pending;
                entry.deadline = deadline;
            }
            None => {
                self.group_entries.insert(
                    id,
                    DebounceEntry {
                        state: PendingState::Pending,
                        deadline,
                    },
                );
            }
        }
    }

    fn mark_run_pending(&mut self, now: Instant) {
        let first_seen = *self.run_first_pending.get_or_insert(now);
        let capped = now + self.run_debounce.min(self.max_wait.saturating_sub(now - first_seen));
        let deadline = capped.max(now);

        match &mut self.run_entry {
            Some(entry) if entry.state == PendingState::Writing => {
                entry.state = PendingState::WritingWithPendingFollowup;
            }
            Some(entry) if entry.state == PendingState::WritingWithPendingFollowup => {}
            Some(entry) => {
                entry.state = PendingState::Pending;
                entry.deadline = deadline;
            }
            None => {
                self.run_entry = Some(DebounceEntry {
                    state: PendingState::Pending,
                    deadline,
                });
            }
        }
    }

    /// Returns the earliest deadline across every pending group and the run
    /// report, for the driving loop to sleep until.
    fn next_deadline(&self) -> Option<Instant> {
        let group_min = self
            .group_entries
            .values()
            .filter(|e| e.state == PendingState::Pending)
            .map(|e| e.deadline)
            .min();
        let run_min = self
            .run_entry
            .as_ref()
            .filter(|e| e.state == PendingState::Pending)
            .map(|e| e.deadline);
        match (group_min, run_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Writes every group and the run report whose deadline has elapsed.
    /// Called whenever the driving loop wakes up, whether due to a deadline
    /// or a fresh notification.
    async fn flush_due(&mut self, now: Instant, run_state: &RunState) -> Result<(), WriterError> {
        let due_groups: Vec<GroupId> = self
            .group_entries
            .iter()
            .filter(|(_, e)| e.state == PendingState::Pending && e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due_groups {
            if let Some(entry) = self.group_entries.get_mut(&id) {
                entry.state = PendingState::Writing;
            }
            self.write_group(id).await?;
            self.group_first_pending.remove(&id);

            let followup = self
                .group_entries
                .get(&id)
                .map(|e| e.state == PendingState::WritingWithPendingFollowup)
                .unwrap_or(false);
            if followup {
                self.mark_group_pending(id, Instant::now());
            } else {
                self.group_entries.remove(&id);
            }
        }

        let run_due = self
            .run_entry
            .as_ref()
            .map(|e| e.state == PendingState::Pending && e.deadline <= now)
            .unwrap_or(false);
        if run_due {
            if let Some(entry) = &mut self.run_entry {
                entry.state = PendingState::Writing;
            }
            self.write_run_report(run_state).await?;
            self.run_first_pending = None;

            let followup = self
                .run_entry
                .as_ref()
                .map(|e| e.state == PendingState::WritingWithPendingFollowup)
                .unwrap_or(false);
            if followup {
                self.run_entry = None;
                self.mark_run_pending(Instant::now());
            } else {
                self.run_entry = None;
            }
        }

        Ok(())
    }

    async fn write_group(&self, id: GroupId) -> Result<(), WriterError> {
        let Some(snapshot) = self.model.snapshot(id).await else {
            return Ok(());
        };
        let links: Vec<(String, String)> = snapshot
            .children
            .iter()
            .map(|c| {
                let rel = pathdiff(&self.report_path(&snapshot), &self.report_path(c));
                (c.group.id.as_hex(), rel)
            })
            .collect();
        let content = render_group_report(&snapshot, &links);
        let path = self.report_path(&snapshot);
        write_atomic(&path, &content).await
    }

    async fn write_run_report(&self, run_state: &RunState) -> Result<(), WriterError> {
        let roots = self.model.snapshot_roots().await;
        let root_links: Vec<(String, String)> = roots
            .iter()
            .map(|r| {
                let rel = pathdiff(&self.paths.run_report, &self.report_path(r));
                (r.group.id.as_hex(), rel)
            })
            .collect();
        let pending_count = self
            .group_entries
            .values()
            .filter(|e| e.state != PendingState::Idle)
            .count();
        let input = RunReportInput {
            run: run_state,
            roots: &roots,
            root_links: &root_links,
            pending_count,
            wall_clock: self.start.elapsed(),
        };
        let content = render_run_report(&input);
        write_atomic(&self.paths.run_report, &content).await
    }

    /// Forces an immediate write of every tracked group and the run report,
    /// ignoring debounce state. Called once at shutdown so the final
    /// filesystem state always reflects the final model state.
    pub async fn finalize(&mut self, run_state: &RunState) -> Result<(), WriterError> {
        let ids: Vec<GroupId> = self.group_entries.keys().copied().collect();
        for id in ids {
            self.write_group(id).await?;
        }
        self.group_entries.clear();
        self.write_run_report(run_state).await?;
        self.run_entry = None;
        Ok(())
    }
}

fn pathdiff(from_file: &std::path::Path, to_file: &std::path::Path) -> String {
    let from_dir = from_file.parent().unwrap_or(from_file);
    let to_dir = to_file.parent().unwrap_or(to_file);

    let from_components: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to_dir.components().collect();

    let common = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    for _ in common..from_components.len() {
        parts.push("..".to_string());
    }
    for component in &to_components[common..] {
        parts.push(component.as_os_str().to_string_lossy().into_owned());
    }
    parts.push("index.md".to_string());

    if parts.is_empty() {
        "./index.md".to_string()
    } else {
        parts.join("/")
    }
}

async fn write_atomic(path: &std::path::Path, content: &str) -> Result<(), WriterError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| WriterError::Write {
                path: path.display().to_string(),
                source,
            })?;
    }
    let path = path.to_path_buf();
    let content = content.to_string();
    let display_path = path.display().to_string();
    tokio::task::spawn_blocking(move || {
        AtomicFile::new(&path, atomicwrites::AllowOverwrite)
            .write(|f| std::io::Write::write_all(f, content.as_bytes()))
    })
    .await
    .expect("writer task panicked")
    .map_err(|e| WriterError::Write {
        path: display_path,
        source: error_into_io(e),
    })
}

fn error_into_io(e: atomicwrites::Error<std::io::Error>) -> std::io::Error {
    match e {
        atomicwrites::Error::Internal(io) => io,
        atomicwrites::Error::User(io) => io,
    }
}

/// Drives the writer for the lifetime of a run: applies notifications to
/// debounce state, sleeps until the next deadline or the next notification
/// (whichever comes first), and flushes due writes. Exits once `changes`
/// closes, returning the writer so the orchestrator can run one final,
/// accurately-timed [`Writer::finalize`] pass itself — the broadcast channel
/// closes as soon as the model drains, which can race ahead of the
/// orchestrator settling the run's terminal status.
pub async fn run(
    mut writer: Writer,
    mut changes: tokio::sync::broadcast::Receiver<Notification>,
    run_state: std::sync::Arc<tokio::sync::RwLock<RunState>>,
) -> Writer {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let sleep_until = writer.next_deadline();
        let sleep = async {
            match sleep_until {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            notification = changes.recv() => {
                match notification {
                    Ok(Notification { kind: ChangeKind::GroupChanged, group_id: Some(id) }) => {
                        writer.mark_group_pending(id, Instant::now());
                        writer.mark_run_pending(Instant::now());
                    }
                    Ok(Notification { kind: ChangeKind::RunShapeChanged, .. }) => {
                        writer.mark_run_pending(Instant::now());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        // Missed notifications under a burst; the next deadline
                        // still fires and flushes whatever is tracked.
                    }
                    Err(RecvError::Closed) => break,
                }
                let state = run_state.read().await.clone();
                let _ = writer.flush_due(Instant::now(), &state).await;
            }
            _ = sleep => {
                let state = run_state.read().await.clone();
                let _ = writer.flush_due(Instant::now(), &state).await;
            }
        }
    }

    writer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunId, RunPaths};

    fn run_state() -> RunState {
        RunState {
            run_id: "20260101T000000-brave-otter".to_string(),
            run_dir: PathBuf::from("/tmp/x"),
            detected_runner: "generic".to_string(),
            modified_command: "npm test".to_string(),
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
            status: crate::model::RunStatus::Running,
            error: None,
        }
    }

    #[tokio::test]
    async fn flushes_a_group_report_after_the_debounce_window() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::generate();
        let paths = RunPaths::new(dir.path(), &run_id);
        paths.ensure_created().unwrap();

        let model = ModelHandle::new();
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(16);
        let (changes_tx, _changes_rx) = tokio::sync::broadcast::channel(64);
        tokio::spawn(crate::model::run_model(model.clone(), events_rx, changes_tx));

        events_tx
            .send(crate::event::Event::GroupDiscovered(crate::event::GroupPath {
                group_name: "t.js".to_string(),
                parent_names: vec![],
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = crate::identity::group_id(&[], "t.js");
        let mut writer = Writer::new(
            model.clone(),
            paths.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(500),
            100,
            20,
        );
        writer.mark_group_pending(id, Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.flush_due(Instant::now(), &run_state()).await.unwrap();

        let report_path = writer.report_path(&model.snapshot(id).await.unwrap());
        assert!(report_path.exists());
    }

    #[tokio::test]
    async fn finalize_writes_run_report_even_with_no_groups() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::generate();
        let paths = RunPaths::new(dir.path(), &run_id);
        paths.ensure_created().unwrap();

        let model = ModelHandle::new();
        let mut writer = Writer::new(
            model,
            paths.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(500),
            100,
            20,
        );
        writer.finalize(&run_state()).await.unwrap();
        assert!(paths.run_report.exists());
    }

    #[test]
    fn pathdiff_computes_relative_sibling_link() {
        let from = PathBuf::from("/run/reports/a/index.md");
        let to = PathBuf::from("/run/reports/a/b/index.md");
        assert_eq!(pathdiff(&from, &to), "b/index.md");
    }
}
