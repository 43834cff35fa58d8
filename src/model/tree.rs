//! The arena that owns every [`Group`] and applies normalized events to it.
//!
//! Groups are stored in a `HashMap` keyed by [`GroupId`] — an indexed map
//! keyed on ID, as called for by the model's design notes — rather than
//! linked via owning pointers, so there are no reference cycles and no
//! unsafe code is needed to mutate ancestors while holding a handle to a
//! descendant.

use std::collections::HashMap;

use chrono::Utc;

use crate::event::{Event, GroupResultPayload, TestCasePayload, WireStatus};
use crate::identity::{group_id, test_case_id, GroupId};

use super::{new_group, new_test_case, path_key, Counts, Group, GroupSnapshot, PathKey, Status};

fn wire_to_status(status: WireStatus) -> Status {
    match status {
        WireStatus::Pass => Status::Pass,
        WireStatus::Fail => Status::Fail,
        WireStatus::Skip => Status::Skip,
    }
}

fn bucket_mut(counts: &mut Counts, status: Status) -> Option<&mut u32> {
    match status {
        Status::Pass => Some(&mut counts.passed),
        Status::Fail => Some(&mut counts.failed),
        Status::Skip => Some(&mut counts.skipped),
        Status::Pending | Status::Running => None,
    }
}

/// Keeps `counts.total == passed + failed + skipped` true as a test case's
/// status moves from `previous` to `new`. A case is counted into `total`
/// exactly once, the first time it becomes terminal; a later terminal-to-
/// terminal update (e.g. a duplicate event correcting the outcome) moves the
/// count between buckets without double-counting `total`.
fn adjust_direct_count(counts: &mut Counts, previous: Option<Status>, new: Status) {
    let was_terminal = previous.map(Status::is_terminal).unwrap_or(false);
    let is_terminal = new.is_terminal();

    if !was_terminal && is_terminal {
        counts.total += 1;
        if let Some(bucket) = bucket_mut(counts, new) {
            *bucket += 1;
        }
    } else if was_terminal && is_terminal {
        if let Some(prev) = previous
            && prev != new
        {
            if let Some(bucket) = bucket_mut(counts, prev) {
                *bucket = bucket.saturating_sub(1);
            }
            if let Some(bucket) = bucket_mut(counts, new) {
                *bucket += 1;
            }
        }
    }
}

/// What kind of change a [`Notification`] describes, for callers that want to
/// distinguish a terminal status change from mere output buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    GroupChanged,
    RunShapeChanged,
}

/// A coalescable notification that group `id` (or the run shape as a whole)
/// changed. The Writer and Presenter consume these to decide what to
/// re-render; they never inspect event payloads directly.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: ChangeKind,
    pub group_id: Option<GroupId>,
}

/// The hierarchical tree of groups, plus bookkeeping needed to resolve events
/// to nodes in O(1) and to keep identity idempotent.
pub struct GroupTree {
    groups: HashMap<GroupId, Group>,
    by_path: HashMap<PathKey, GroupId>,
    roots: Vec<GroupId>,
    collected: u32,
    revision: u64,
}

impl Default for GroupTree {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupTree {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            by_path: HashMap::new(),
            roots: Vec::new(),
            collected: 0,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn collected_count(&self) -> u32 {
        self.collected
    }

    pub fn roots(&self) -> &[GroupId] {
        &self.roots
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Ensures every prefix of `full_path` exists, creating any missing
    /// ancestor groups along the way. Idempotent: repeated calls with the
    /// same path never create a second group for any prefix.
    fn ensure_path(&mut self, full_path: &[String]) -> GroupId {
        let mut ancestors: Vec<String> = Vec::new();
        let mut last_id = None;

        for name in full_path {
            let id = group_id(&ancestors, name);
            let key = path_key(&ancestors, name);

            if !self.groups.contains_key(&id) {
                let group = new_group(id, name.clone(), ancestors.clone());
                self.groups.insert(id, group);
                self.by_path.insert(key, id);

                if let Some(parent) = last_id {
                    let parent_group = self.groups.get_mut(&parent).unwrap();
                    if !parent_group.children.contains(&id) {
                        parent_group.children.push(id);
                    }
                } else {
                    self.roots.push(id);
                }
            }

            last_id = Some(id);
            ancestors.push(name.clone());
        }

        last_id.expect("full_path must be non-empty")
    }

    fn touch(&mut self, id: GroupId) {
        if let Some(g) = self.groups.get_mut(&id) {
            g.updated = Utc::now();
        }
        self.revision += 1;
    }

    /// Applies one normalized event to the tree, returning the set of group
    /// IDs whose state changed (for notification purposes).
    pub fn apply(&mut self, event: Event) -> Vec<GroupId> {
        match event {
            Event::GroupDiscovered(p) => {
                let mut path = p.parent_names.clone();
                path.push(p.group_name.clone());
                let id = self.ensure_path(&path);
                self.touch(id);
                vec![id]
            }
            Event::GroupStart(p) => {
                let mut path = p.parent_names.clone();
                path.push(p.group_name.clone());
                let id = self.ensure_path(&path);
                let group = self.groups.get_mut(&id).unwrap();
                if matches!(group.status, Status::Pending) {
                    group.status = Status::Running;
                }
                if group.started.is_none() {
                    group.started = Some(Utc::now());
                }
                self.touch(id);
                vec![id]
            }
            Event::GroupResult(payload) => self.apply_group_result(payload),
            Event::GroupError(p) => {
                let mut path = p.parent_names.clone();
                path.push(p.group_name.clone());
                let id = self.ensure_path(&path);
                let group = self.groups.get_mut(&id).unwrap();
                group.errors.push(p.error_message);
                group.status = Status::Fail;
                group.ended = Some(Utc::now());
                self.touch(id);
                self.propagate_from(id)
            }
            Event::TestCase(payload) => self.apply_test_case(payload),
            Event::GroupStdout(p) => self.append_output(p.parent_names, p.group_name, p.chunk, true),
            Event::GroupStderr(p) => self.append_output(p.parent_names, p.group_name, p.chunk, false),
            Event::CollectionStart => vec![],
            Event::CollectionFinish(p) => {
                self.collected = p.collected;
                vec![]
            }
            Event::RunComplete => vec![],
        }
    }

    fn append_output(
        &mut self,
        parents: Vec<String>,
        name: String,
        chunk: String,
        is_stdout: bool,
    ) -> Vec<GroupId> {
        let key = path_key(&parents, &name);
        let Some(&id) = self.by_path.get(&key) else {
            return vec![];
        };
        let group = self.groups.get_mut(&id).unwrap();
        if is_stdout {
            group.stdout.push_str(&chunk);
        } else {
            group.stderr.push_str(&chunk);
        }
        self.touch(id);
        vec![id]
    }

    fn apply_group_result(&mut self, payload: GroupResultPayload) -> Vec<GroupId> {
        let mut path = payload.parent_names.clone();
        path.push(payload.group_name.clone());
        let id = self.ensure_path(&path);

        let now = Utc::now();
        let duration_ms = payload.duration;
        {
            let group = self.groups.get_mut(&id).unwrap();
            group.status = wire_to_status(payload.status);
            group.ended = Some(now);
            group.duration = Some(match duration_ms {
                Some(ms) => std::time::Duration::from_millis(ms),
                None => group
                    .started
                    .map(|s| (now - s).to_std().unwrap_or_default())
                    .unwrap_or_default(),
            });
            if let Some(totals) = payload.totals {
                group.authoritative_totals = Some(Counts {
                    total: totals.total,
                    passed: totals.passed,
                    failed: totals.failed,
                    skipped: totals.skipped,
                });
            }
        }

        self.touch(id);
        self.propagate_from(id)
    }

    fn apply_test_case(&mut self, payload: TestCasePayload) -> Vec<GroupId> {
        let parent_id = self.ensure_path(&payload.parent_names);
        let status = wire_to_status(payload.status);
        let case_id = test_case_id(&payload.parent_names, &payload.test_name);

        let group = self.groups.get_mut(&parent_id).unwrap();
        let existing = group.test_cases.iter_mut().find(|c| c.id == case_id);

        let previous_status = existing.as_ref().map(|c| c.status);

        if let Some(case) = existing {
            case.status = status;
            case.duration_ms = payload.duration;
            case.error = payload.error;
            case.stdout = payload.stdout;
            case.stderr = payload.stderr;
        } else {
            let mut case = new_test_case(case_id, payload.test_name.clone(), parent_id);
            case.status = status;
            case.duration_ms = payload.duration;
            case.error = payload.error;
            case.stdout = payload.stdout;
            case.stderr = payload.stderr;
            group.test_cases.push(case);
        }

        adjust_direct_count(&mut group.direct, previous_status, status);

        self.touch(parent_id);
        self.recompute_recursive(parent_id);
        self.propagate_from(parent_id)
    }

    /// Recomputes a group's recursive counts by summing its direct counts and
    /// every descendant's recursive (or authoritative) counts.
    fn recompute_recursive(&mut self, id: GroupId) {
        let children = self.groups.get(&id).map(|g| g.children.clone()).unwrap_or_default();
        let mut total = self.groups.get(&id).map(|g| g.direct).unwrap_or_default();

        for child_id in &children {
            if let Some(child) = self.groups.get(child_id) {
                let child_counts = child.display_counts();
                total.total += child_counts.total;
                total.passed += child_counts.passed;
                total.failed += child_counts.failed;
                total.skipped += child_counts.skipped;
            }
        }

        if let Some(group) = self.groups.get_mut(&id) {
            group.recursive = total;
        }
    }

    /// Walks ancestors from `id` upward, recomputing recursive counts and
    /// checking whether each ancestor has become terminal. Stops at the
    /// first ancestor that is not yet terminal (an ancestor that still has a
    /// non-terminal descendant cannot itself be terminal, by definition).
    fn propagate_from(&mut self, id: GroupId) -> Vec<GroupId> {
        let mut changed = vec![id];
        let mut current = id;

        loop {
            let ancestors = match self.groups.get(&current) {
                Some(g) => g.ancestors.clone(),
                None => break,
            };
            let Some(parent_name) = ancestors.last() else {
                break;
            };
            let grandparent_ancestors = &ancestors[..ancestors.len() - 1];
            let parent_key = path_key(grandparent_ancestors, parent_name);
            let Some(&parent_id) = self.by_path.get(&parent_key) else {
                break;
            };

            self.recompute_recursive(parent_id);

            let became_terminal = self.maybe_terminalize(parent_id);
            self.touch(parent_id);
            changed.push(parent_id);

            if !became_terminal {
                break;
            }
            current = parent_id;
        }

        changed
    }

    /// If every direct child group and direct test case of `id` is terminal,
    /// sets `id`'s status to the aggregated terminal label and returns true.
    /// A group with zero descendants is Skip, per the terminalization rule.
    fn maybe_terminalize(&mut self, id: GroupId) -> bool {
        let Some(group) = self.groups.get(&id) else {
            return false;
        };

        if group.status.is_terminal() {
            return true;
        }

        let children_terminal = group
            .children
            .iter()
            .all(|c| self.groups.get(c).map(|g| g.status.is_terminal()).unwrap_or(false));
        let cases_terminal = group.test_cases.iter().all(|c| c.status.is_terminal());

        if !children_terminal || !cases_terminal {
            return false;
        }

        let has_any_fail = group
            .children
            .iter()
            .any(|c| self.groups.get(c).map(|g| g.status == Status::Fail).unwrap_or(false))
            || group.test_cases.iter().any(|c| c.status == Status::Fail);

        let has_descendants = !group.children.is_empty() || !group.test_cases.is_empty();

        let all_skip = has_descendants
            && group
                .children
                .iter()
                .all(|c| self.groups.get(c).map(|g| g.status == Status::Skip).unwrap_or(true))
            && group.test_cases.iter().all(|c| c.status == Status::Skip);

        let label = if has_any_fail {
            Status::Fail
        } else if !has_descendants || all_skip {
            Status::Skip
        } else {
            Status::Pass
        };

        let group = self.groups.get_mut(&id).unwrap();
        group.status = label;
        if group.ended.is_none() {
            group.ended = Some(Utc::now());
        }
        true
    }

    /// Captures an immutable snapshot of a group and its full subtree.
    pub fn snapshot(&self, id: GroupId) -> Option<GroupSnapshot> {
        let group = self.groups.get(&id)?.clone();
        let children = group
            .children
            .iter()
            .filter_map(|c| self.snapshot(*c))
            .collect();
        Some(GroupSnapshot { group, children })
    }

    pub fn snapshot_roots(&self) -> Vec<GroupSnapshot> {
        self.roots.iter().filter_map(|id| self.snapshot(*id)).collect()
    }
}
