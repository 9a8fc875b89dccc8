#![forbid(unsafe_code)]

//! In-memory dependency graph over the task queue.
//!
//! The graph is rebuilt from the store whenever a worker starts and is kept
//! current by the worker afterwards. Edges point from a task to the tasks it
//! depends on; `children` is the reverse index used to release dependents when
//! a task completes. Dependencies on tasks the graph has not seen yet are
//! allowed and simply keep the dependent waiting.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::GwtaskError;
use crate::task::model::{Task, TaskStatus};

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_PRIORITY_BOOST_AFTER: Duration = Duration::from_secs(60 * 60);

/// Ranking bonus per full boost interval waited. Equal to the whole priority
/// range, so one interval of waiting outranks any freshly created task.
const PRIORITY_BOOST_STEP: u64 = 100;

#[derive(Debug, Clone)]
struct Node {
    task: Task,
    children: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    max_depth: usize,
    priority_boost_after: Duration,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, DEFAULT_PRIORITY_BOOST_AFTER)
    }
}

impl DependencyGraph {
    #[must_use]
    pub fn new(max_depth: usize, priority_boost_after: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            max_depth,
            priority_boost_after,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.nodes.get(id).map(|n| &n.task)
    }

    /// IDs of the tasks that directly depend on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts or refreshes a node.
    ///
    /// Returns the snapshots whose status changed as a side effect: the task
    /// itself when its pending/waiting state was normalized, and dependents
    /// released because the inserted task is already completed. On error the
    /// graph is left untouched.
    pub fn add_task(&mut self, mut task: Task) -> Result<Vec<Task>, GwtaskError> {
        let mut seen = HashSet::new();
        task.depends_on.retain(|d| seen.insert(d.clone()));

        if task.depends_on.iter().any(|d| d == &task.id) {
            return Err(GwtaskError::CycleDetected {
                task: task.id.clone(),
                path: vec![task.id.clone(), task.id.clone()],
            });
        }
        if let Some(path) = self.find_dependency_path(&task.depends_on, &task.id) {
            let mut full = vec![task.id.clone()];
            full.extend(path);
            return Err(GwtaskError::CycleDetected {
                task: task.id.clone(),
                path: full,
            });
        }

        let mut memo_up = HashMap::new();
        let mut memo_down = HashMap::new();
        let above = task
            .depends_on
            .iter()
            .map(|d| 1 + self.height(d, &mut memo_up))
            .max()
            .unwrap_or(0);
        let below = self.depth_below(&task.id, &mut memo_down);
        let depth = above + below;
        if depth > self.max_depth {
            return Err(GwtaskError::DepthExceeded {
                task: task.id.clone(),
                depth,
                max: self.max_depth,
            });
        }

        let id = task.id.clone();
        if let Some(old) = self.nodes.remove(&id) {
            for dep in &old.task.depends_on {
                if let Some(n) = self.nodes.get_mut(dep) {
                    n.children.remove(&id);
                }
            }
        }
        for dep in &task.depends_on {
            if let Some(n) = self.nodes.get_mut(dep) {
                n.children.insert(id.clone());
            }
        }
        let children: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|n| n.task.depends_on.contains(&id))
            .map(|n| n.task.id.clone())
            .collect();
        let status = task.status;
        self.nodes.insert(id.clone(), Node { task, children });

        let mut changed = Vec::new();
        if self.normalize(&id)
            && let Some(t) = self.get(&id)
        {
            changed.push(t.clone());
        }
        if status == TaskStatus::Completed {
            changed.extend(self.release_dependents(&id));
        }
        Ok(changed)
    }

    /// Applies a status transition to a known task.
    ///
    /// Returns dependents that moved from waiting to pending because the task
    /// completed. Dependencies cannot be changed here; re-add the task instead.
    pub fn update_task(&mut self, task: Task) -> Result<Vec<Task>, GwtaskError> {
        let node = self
            .nodes
            .get_mut(&task.id)
            .ok_or_else(|| GwtaskError::TaskNotFound(task.id.clone()))?;
        let from = node.task.status;
        let to = task.status;
        if !transition_allowed(from, to) {
            return Err(GwtaskError::InvalidTransition {
                task: task.id.clone(),
                from,
                to,
            });
        }
        let old_deps: BTreeSet<&String> = node.task.depends_on.iter().collect();
        let new_deps: BTreeSet<&String> = task.depends_on.iter().collect();
        if old_deps != new_deps {
            return Err(GwtaskError::Validation(format!(
                "task {}: dependencies cannot change through a status update",
                task.id
            )));
        }

        let id = task.id.clone();
        node.task = task;
        if to == TaskStatus::Completed && from != TaskStatus::Completed {
            return Ok(self.release_dependents(&id));
        }
        Ok(Vec::new())
    }

    /// Pending tasks by effective priority (desc), then creation time (asc), then ID.
    #[must_use]
    pub fn get_ready_tasks(&self, now: OffsetDateTime) -> Vec<Task> {
        let mut ready: Vec<(u64, &Task)> = self
            .nodes
            .values()
            .filter(|n| n.task.status == TaskStatus::Pending)
            .map(|n| (self.effective_priority(&n.task, now), &n.task))
            .collect();
        ready.sort_by(|(pa, a), (pb, b)| {
            pb.cmp(pa)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready.into_iter().map(|(_, t)| t.clone()).collect()
    }

    /// Ranking priority: the stored priority plus a bonus for each full boost
    /// interval the task has spent pending or waiting. Never persisted.
    #[must_use]
    pub fn effective_priority(&self, task: &Task, now: OffsetDateTime) -> u64 {
        let base = u64::from(task.priority);
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Waiting)
            || self.priority_boost_after.is_zero()
        {
            return base;
        }
        let waited = now - task.created_at;
        if waited.is_negative() {
            return base;
        }
        let waited_ms = u128::try_from(waited.whole_milliseconds()).unwrap_or(0);
        let steps = waited_ms / self.priority_boost_after.as_millis();
        let steps = u64::try_from(steps).unwrap_or(u64::MAX);
        base.saturating_add(steps.saturating_mul(PRIORITY_BOOST_STEP))
    }

    /// Waiting tasks that can never be released on their own because a
    /// dependency failed, paired with that dependency.
    #[must_use]
    pub fn blocked_by_failure(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .nodes
            .values()
            .filter(|n| n.task.status == TaskStatus::Waiting)
            .filter_map(|n| {
                n.task
                    .depends_on
                    .iter()
                    .find(|d| self.get(d).is_some_and(|t| t.status == TaskStatus::Failed))
                    .map(|d| (n.task.id.clone(), d.clone()))
            })
            .collect();
        out.sort();
        out
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|d| self.get(d).is_some_and(|t| t.status == TaskStatus::Completed))
    }

    fn normalize(&mut self, id: &str) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Waiting) {
            return false;
        }
        let want = if self.deps_completed(task) {
            TaskStatus::Pending
        } else {
            TaskStatus::Waiting
        };
        match self.nodes.get_mut(id) {
            Some(n) if n.task.status != want => {
                n.task.status = want;
                true
            }
            _ => false,
        }
    }

    fn release_dependents(&mut self, id: &str) -> Vec<Task> {
        let children = self.dependents(id);
        let mut released = Vec::new();
        for child in children {
            let ready = self
                .get(&child)
                .is_some_and(|t| t.status == TaskStatus::Waiting && self.deps_completed(t));
            if !ready {
                continue;
            }
            if let Some(n) = self.nodes.get_mut(&child) {
                n.task.status = TaskStatus::Pending;
                released.push(n.task.clone());
            }
        }
        released
    }

    /// Dependency path from any of `from` to `target`, following `depends_on`.
    fn find_dependency_path(&self, from: &[String], target: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        from.iter()
            .any(|start| self.dfs(start, target, &mut visited, &mut path))
            .then_some(path)
    }

    fn dfs(
        &self,
        cur: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(cur.to_owned());
        if cur == target {
            return true;
        }
        if visited.insert(cur.to_owned())
            && let Some(node) = self.nodes.get(cur)
        {
            for dep in &node.task.depends_on {
                if self.dfs(dep, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Longest chain of dependency edges above `id`. Unknown tasks are roots.
    fn height(&self, id: &str, memo: &mut HashMap<String, usize>) -> usize {
        if let Some(&h) = memo.get(id) {
            return h;
        }
        let h = self.nodes.get(id).map_or(0, |n| {
            n.task
                .depends_on
                .iter()
                .map(|d| 1 + self.height(d, memo))
                .max()
                .unwrap_or(0)
        });
        memo.insert(id.to_owned(), h);
        h
    }

    /// Longest chain of dependent edges below `id`.
    fn depth_below(&self, id: &str, memo: &mut HashMap<String, usize>) -> usize {
        if let Some(&d) = memo.get(id) {
            return d;
        }
        let d = self
            .nodes
            .values()
            .filter(|n| n.task.depends_on.iter().any(|dep| dep == id))
            .map(|n| 1 + self.depth_below(&n.task.id, memo))
            .max()
            .unwrap_or(0);
        memo.insert(id.to_owned(), d);
        d
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Completed, Failed, Pending, Running, Waiting};
    from == to
        || matches!(
            (from, to),
            (Pending, Running)
                | (Pending, Waiting)
                | (Waiting, Pending)
                | (Running, Completed)
                | (Running, Failed)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskResult;

    fn task(id: &str, priority: u8, deps: &[&str]) -> Task {
        let mut t = Task::new(id, id, format!("wt-{id}"));
        t.priority = priority;
        t.depends_on = deps.iter().map(|d| (*d).to_owned()).collect();
        t.status = Task::initial_status(&t.depends_on);
        t
    }

    fn complete(graph: &mut DependencyGraph, id: &str) -> Vec<Task> {
        let mut t = graph.get(id).cloned().unwrap();
        t.mark_running(t.session_name(), OffsetDateTime::now_utc());
        graph.update_task(t.clone()).unwrap();
        t.finish(
            TaskResult {
                exit_code: 0,
                duration_ms: 10,
                files_changed: Vec::new(),
                error: None,
            },
            OffsetDateTime::now_utc(),
        );
        graph.update_task(t).unwrap()
    }

    fn ready_ids(graph: &DependencyGraph) -> Vec<String> {
        graph
            .get_ready_tasks(OffsetDateTime::now_utc())
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    #[test]
    fn dependent_becomes_ready_once_dependency_completes() {
        let mut g = DependencyGraph::default();
        g.add_task(task("a", 50, &[])).unwrap();
        g.add_task(task("b", 90, &["a"])).unwrap();

        assert_eq!(ready_ids(&g), vec!["a"]);
        assert_eq!(g.get("b").unwrap().status, TaskStatus::Waiting);

        let released = complete(&mut g, "a");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, "b");
        assert_eq!(ready_ids(&g), vec!["b"]);
    }

    #[test]
    fn dependent_with_several_dependencies_waits_for_all() {
        let mut g = DependencyGraph::default();
        g.add_task(task("a", 50, &[])).unwrap();
        g.add_task(task("b", 50, &[])).unwrap();
        g.add_task(task("c", 50, &["a", "b"])).unwrap();

        assert!(complete(&mut g, "a").is_empty());
        assert_eq!(g.get("c").unwrap().status, TaskStatus::Waiting);
        let released = complete(&mut g, "b");
        assert_eq!(released.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn ready_order_is_priority_then_age_and_stable() {
        let now = OffsetDateTime::now_utc();
        let mut g = DependencyGraph::default();
        let mut older = task("older", 50, &[]);
        older.created_at = now - Duration::from_secs(30);
        let mut newer = task("newer", 50, &[]);
        newer.created_at = now;
        let mut urgent = task("urgent", 80, &[]);
        urgent.created_at = now;

        g.add_task(newer).unwrap();
        g.add_task(urgent).unwrap();
        g.add_task(older).unwrap();

        let first = ready_ids(&g);
        assert_eq!(first, vec!["urgent", "older", "newer"]);
        assert_eq!(ready_ids(&g), first);
    }

    #[test]
    fn long_waiting_task_outranks_fresh_high_priority_task() {
        let boost = Duration::from_secs(3600);
        let now = OffsetDateTime::now_utc();
        let mut g = DependencyGraph::new(DEFAULT_MAX_DEPTH, boost);

        let mut starving = task("starving", 10, &[]);
        starving.created_at = now - boost - Duration::from_secs(1);
        let mut fresh = task("fresh", 50, &[]);
        fresh.created_at = now;
        g.add_task(fresh).unwrap();
        g.add_task(starving.clone()).unwrap();

        let ids: Vec<String> = g.get_ready_tasks(now).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["starving", "fresh"]);
        // The bonus only affects ranking.
        assert_eq!(g.get("starving").unwrap().priority, 10);
        assert_eq!(g.effective_priority(&starving, now), 110);
    }

    #[test]
    fn cycle_is_rejected_without_mutating_edges() {
        let mut g = DependencyGraph::default();
        g.add_task(task("a", 50, &["b"])).unwrap();
        g.add_task(task("b", 50, &[])).unwrap();
        assert_eq!(g.dependents("b"), vec!["a"]);

        let err = g.add_task(task("b", 50, &["a"])).unwrap_err();
        match err {
            GwtaskError::CycleDetected { task, path } => {
                assert_eq!(task, "b");
                assert_eq!(path, vec!["b", "a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(g.get("b").unwrap().depends_on.is_empty());
        assert!(g.dependents("a").is_empty());
        assert_eq!(g.dependents("b"), vec!["a"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut g = DependencyGraph::default();
        let err = g.add_task(task("a", 50, &["a"])).unwrap_err();
        assert!(matches!(err, GwtaskError::CycleDetected { .. }));
        assert!(g.is_empty());
    }

    #[test]
    fn depth_limit_counts_dependency_edges() {
        let mut g = DependencyGraph::new(3, DEFAULT_PRIORITY_BOOST_AFTER);
        g.add_task(task("t0", 50, &[])).unwrap();
        g.add_task(task("t1", 50, &["t0"])).unwrap();
        g.add_task(task("t2", 50, &["t1"])).unwrap();
        g.add_task(task("t3", 50, &["t2"])).unwrap();

        let err = g.add_task(task("t4", 50, &["t3"])).unwrap_err();
        assert!(matches!(
            err,
            GwtaskError::DepthExceeded { depth: 4, max: 3, .. }
        ));
        assert!(!g.contains("t4"));
    }

    #[test]
    fn depth_limit_sees_chains_below_a_late_arrival() {
        let mut g = DependencyGraph::new(2, DEFAULT_PRIORITY_BOOST_AFTER);
        g.add_task(task("c", 50, &["b"])).unwrap();
        g.add_task(task("d", 50, &["c"])).unwrap();
        // b -> a would make a-b-c-d three edges long.
        let err = g.add_task(task("b", 50, &["a"])).unwrap_err();
        assert!(matches!(err, GwtaskError::DepthExceeded { depth: 3, .. }));
    }

    #[test]
    fn completed_dependency_loaded_later_releases_waiting_dependent() {
        let mut g = DependencyGraph::default();
        g.add_task(task("b", 50, &["a"])).unwrap();
        assert_eq!(g.get("b").unwrap().status, TaskStatus::Waiting);

        let mut a = task("a", 50, &[]);
        a.mark_running(a.session_name(), OffsetDateTime::now_utc());
        a.finish(
            TaskResult {
                exit_code: 0,
                duration_ms: 1,
                files_changed: Vec::new(),
                error: None,
            },
            OffsetDateTime::now_utc(),
        );
        let changed = g.add_task(a).unwrap();
        assert_eq!(changed.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(ready_ids(&g), vec!["b"]);
    }

    #[test]
    fn pending_task_with_unmet_dependencies_is_normalized_to_waiting() {
        let mut g = DependencyGraph::default();
        let mut t = task("x", 50, &["missing"]);
        t.status = TaskStatus::Pending;
        let changed = g.add_task(t).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, TaskStatus::Waiting);
        assert!(ready_ids(&g).is_empty());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut g = DependencyGraph::default();
        g.add_task(task("a", 50, &[])).unwrap();
        let mut t = g.get("a").cloned().unwrap();
        t.status = TaskStatus::Completed;
        let err = g.update_task(t).unwrap_err();
        assert!(matches!(
            err,
            GwtaskError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn failed_dependency_leaves_dependent_waiting_and_reported() {
        let mut g = DependencyGraph::default();
        g.add_task(task("a", 50, &[])).unwrap();
        g.add_task(task("b", 50, &["a"])).unwrap();

        let mut a = g.get("a").cloned().unwrap();
        a.mark_running(a.session_name(), OffsetDateTime::now_utc());
        g.update_task(a.clone()).unwrap();
        a.finish(
            TaskResult::failure(1, Duration::from_secs(1), "agent failed"),
            OffsetDateTime::now_utc(),
        );
        assert!(g.update_task(a).unwrap().is_empty());

        assert_eq!(g.get("b").unwrap().status, TaskStatus::Waiting);
        assert_eq!(
            g.blocked_by_failure(),
            vec![("b".to_owned(), "a".to_owned())]
        );
        assert!(ready_ids(&g).is_empty());
    }
}
