//! The hierarchical group model (C3): groups, test cases, and the tree that
//! owns them.
//!
//! Types in this module are plain data; the arena that owns and mutates them
//! lives in [`tree`]. Splitting the two keeps the data model testable (status
//! propagation, statistic rules) independent of the concurrency wrapper.

mod tree;

pub use tree::{ChangeKind, GroupTree, Notification};

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::event::TestError;
use crate::identity::{GroupId, TestCaseId};

/// A group or test case's lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Pass,
    Fail,
    Skip,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Pass | Status::Fail | Status::Skip)
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Status::Pending => "…",
            Status::Running => "›",
            Status::Pass => "✓",
            Status::Fail => "✕",
            Status::Skip => "○",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
            Status::Skip => "SKIP",
        }
    }
}

/// Recursive and direct aggregate counts stored on a [`Group`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}


/// A leaf test case attached to a [`Group`].
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: TestCaseId,
    pub name: String,
    pub parent_id: GroupId,
    pub status: Status,
    pub duration_ms: Option<u64>,
    pub error: Option<TestError>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl TestCase {
    fn new(id: TestCaseId, name: String, parent_id: GroupId) -> Self {
        Self {
            id,
            name,
            parent_id,
            status: Status::Pending,
            duration_ms: None,
            error: None,
            stdout: None,
            stderr: None,
        }
    }
}

/// A node in the test hierarchy. Owned exclusively by [`GroupTree`]; external
/// readers only ever see an immutable clone via a snapshot.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub ancestors: Vec<String>,
    pub status: Status,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub test_cases: Vec<TestCase>,
    pub children: Vec<GroupId>,
    pub stdout: String,
    pub stderr: String,
    pub errors: Vec<String>,
    pub direct: Counts,
    pub recursive: Counts,
    /// Totals supplied explicitly by a terminal `testGroupResult` event, which
    /// override recursively aggregated counts when present.
    pub authoritative_totals: Option<Counts>,
}

impl Group {
    fn new(id: GroupId, name: String, ancestors: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            ancestors,
            status: Status::Pending,
            created: now,
            updated: now,
            started: None,
            ended: None,
            duration: None,
            test_cases: Vec::new(),
            children: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            errors: Vec::new(),
            direct: Counts::default(),
            recursive: Counts::default(),
            authoritative_totals: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.ancestors.len()
    }

    pub fn full_path(&self) -> Vec<String> {
        let mut path = self.ancestors.clone();
        path.push(self.name.clone());
        path
    }

    /// The counts a report should display: authoritative totals if a
    /// `testGroupResult` supplied them, otherwise the recursively aggregated
    /// counts. Per spec, subgroup rows always use recursive counts.
    pub fn display_counts(&self) -> Counts {
        self.authoritative_totals.unwrap_or(self.recursive)
    }

    pub fn is_root(&self) -> bool {
        self.ancestors.is_empty()
    }
}

/// An immutable view of one group's subtree, captured under a brief read lock
/// so rendering can proceed without holding the model lock across I/O.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group: Group,
    pub children: Vec<GroupSnapshot>,
}

/// Process-wide run state: identifiers, timestamps, and overall status. Not
/// part of the group tree; tracked alongside it by the orchestrator.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub run_dir: std::path::PathBuf,
    pub detected_runner: String,
    pub modified_command: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Errored,
}

impl RunState {
    /// Maps internal status plus pending-file count to the displayed label,
    /// per the run-status table.
    pub fn displayed(&self, pending_count: usize) -> &'static str {
        match self.status {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed if pending_count > 0 => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Errored => "ERRORED",
        }
    }
}

/// Keyed lookup from `(path)` to a group, used internally by the tree to
/// resolve events without linear scans.
pub(crate) type PathKey = String;

pub(crate) fn path_key(ancestors: &[String], name: &str) -> PathKey {
    let mut key = ancestors.join("\u{1}");
    if !ancestors.is_empty() {
        key.push('\u{1}');
    }
    key.push_str(name);
    key
}

pub(crate) fn new_group(id: GroupId, name: String, ancestors: Vec<String>) -> Group {
    Group::new(id, name, ancestors)
}

pub(crate) fn new_test_case(id: TestCaseId, name: String, parent_id: GroupId) -> TestCase {
    TestCase::new(id, name, parent_id)
}

/// Helper for callers that need a path→display-name map, e.g. the writer
/// rendering breadcrumbs.
pub fn path_display(ancestors: &[String], name: &str) -> String {
    let mut parts: Vec<&str> = ancestors.iter().map(String::as_str).collect();
    parts.push(name);
    parts.join(" › ")
}

/// A cheap, shareable reference to the model. The tree itself lives behind a
/// single-writer-multi-reader lock; readers only ever hold it for the
/// duration of composing a [`GroupSnapshot`] (see [`run_model`]).
#[derive(Clone)]
pub struct ModelHandle {
    inner: std::sync::Arc<tokio::sync::RwLock<GroupTree>>,
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelHandle {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(tokio::sync::RwLock::new(GroupTree::new())),
        }
    }

    pub async fn snapshot_roots(&self) -> Vec<GroupSnapshot> {
        self.inner.read().await.snapshot_roots()
    }

    pub async fn snapshot(&self, id: GroupId) -> Option<GroupSnapshot> {
        self.inner.read().await.snapshot(id)
    }

    pub async fn root_count(&self) -> usize {
        self.inner.read().await.roots().len()
    }

    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision()
    }
}

/// The model's event-ingest actor: the single writer path. Applies each
/// event from `events` to the tree in order and emits a coalescable
/// [`Notification`] per changed group on `changes`. Exits when `events`
/// closes (both producers have shut down).
pub async fn run_model(
    handle: ModelHandle,
    mut events: tokio::sync::mpsc::Receiver<crate::event::Event>,
    changes: tokio::sync::broadcast::Sender<Notification>,
) {
    while let Some(event) = events.recv().await {
        let changed = {
            let mut tree = handle.inner.write().await;
            tree.apply(event)
        };
        for id in &changed {
            let _ = changes.send(Notification {
                kind: ChangeKind::GroupChanged,
                group_id: Some(*id),
            });
        }
        // Every event can move the run-level aggregate (pending count,
        // collected count, root shape) even when no single group's own
        // report changed, so the run report always gets a chance to refresh.
        let _ = changes.send(Notification {
            kind: ChangeKind::RunShapeChanged,
            group_id: None,
        });
    }
}

/// Constructors that bypass the tree, for unit tests in sibling modules
/// (e.g. Markdown rendering) that need a bare [`Group`]/[`TestCase`] without
/// driving a whole event sequence through [`GroupTree`].
#[cfg(test)]
pub(crate) mod test_support {
    use super::{Group, GroupId, TestCase, TestCaseId};

    pub fn new_group_for_test(id: GroupId, name: String, ancestors: Vec<String>) -> Group {
        Group::new(id, name, ancestors)
    }

    pub fn new_case_for_test(id: TestCaseId, name: String, parent_id: GroupId) -> TestCase {
        TestCase::new(id, name, parent_id)
    }
}
