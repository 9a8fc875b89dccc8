#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::GwtaskError;
use crate::task::execution::{ExecutionEngine, UNKNOWN_EXIT_CODE};
use crate::task::graph::DependencyGraph;
use crate::task::model::{Task, TaskResult, TaskStatus};
use crate::task::resources::{ResourceManager, ResourceUsage, Slot};
use crate::task::storage::TaskStore;

/// How long cancelled executions get to acknowledge before the worker returns.
const CANCEL_SETTLE: Duration = Duration::from_secs(5);

const STALE_RUNNING_ERROR: &str =
    "worker stopped while the task was running; the task is not retried";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_dir: PathBuf,
    pub max_parallel: usize,
    pub category_limits: BTreeMap<String, usize>,
    pub poll_interval: Duration,
    pub max_dependency_depth: usize,
    pub priority_boost_after: Duration,
    pub shutdown_grace: Duration,
    pub log_retention_days: u64,
    pub auto_cleanup: bool,
}

impl WorkerConfig {
    /// Worker settings from `cfg`; `parallel` overrides `tasks.max_parallel`.
    pub fn from_config(cfg: &Config, parallel: Option<usize>) -> anyhow::Result<Self> {
        let timings = cfg.tasks.timings()?;
        let max_parallel = parallel.unwrap_or(cfg.tasks.max_parallel);
        if max_parallel == 0 {
            anyhow::bail!("parallelism must be at least 1");
        }
        Ok(Self {
            queue_dir: crate::config::expand_path(&cfg.tasks.queue_dir)?,
            max_parallel,
            category_limits: cfg.tasks.category_limits.clone(),
            poll_interval: timings.poll_interval,
            max_dependency_depth: cfg.tasks.max_dependency_depth,
            priority_boost_after: timings.priority_boost_after,
            shutdown_grace: timings.shutdown_grace,
            log_retention_days: cfg.tasks.log_retention_days,
            auto_cleanup: cfg.tasks.auto_cleanup,
        })
    }
}

/// Coordinates the queue: owns the dependency graph and the resource slots
/// and hands ready tasks to the execution engine.
#[derive(Clone)]
pub struct Worker {
    store: TaskStore,
    graph: Arc<Mutex<DependencyGraph>>,
    resources: ResourceManager,
    engine: Arc<ExecutionEngine>,
    cfg: WorkerConfig,
    /// Running tasks whose sessions outlived the previous worker, in load order.
    resumable: Arc<Mutex<Vec<Task>>>,
    reported_blocked: Arc<Mutex<HashSet<String>>>,
}

impl Worker {
    #[must_use]
    pub fn new(store: TaskStore, engine: Arc<ExecutionEngine>, cfg: WorkerConfig) -> Self {
        Self {
            store,
            graph: Arc::new(Mutex::new(DependencyGraph::new(
                cfg.max_dependency_depth,
                cfg.priority_boost_after,
            ))),
            resources: ResourceManager::new(cfg.max_parallel, cfg.category_limits.clone()),
            engine,
            cfg,
            resumable: Arc::new(Mutex::new(Vec::new())),
            reported_blocked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    #[must_use]
    pub fn resource_usage(&self) -> ResourceUsage {
        self.resources.in_use()
    }

    /// The graph's view of a task.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<Task> {
        self.graph().get(id).cloned()
    }

    fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        lock(&self.graph)
    }

    /// Rebuilds the graph from the store.
    ///
    /// A task left running by a previous worker is monitored again when its
    /// session is still alive, and failed otherwise. Tasks are never re-run.
    pub async fn load(&self) -> anyhow::Result<()> {
        self.store.ensure_dir()?;
        let mut tasks = self.store.list_all()?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut loaded = 0usize;
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                match self.engine.session_alive(&task).await {
                    Ok(true) => {
                        tracing::info!(task_id = %task.id, session = task.session_id.as_deref().unwrap_or_default(), "session still alive; resuming monitoring");
                        if self.add_to_graph(task.clone()) {
                            lock(&self.resumable).push(task);
                            loaded += 1;
                        }
                        continue;
                    }
                    Ok(false) => {
                        tracing::warn!(task_id = %task.id, "task was running when the previous worker stopped; marking failed");
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "cannot check the session of a stale task; marking failed");
                    }
                }
                fail_stale(&mut task, OffsetDateTime::now_utc());
                self.persist(&task);
            }
            if self.add_to_graph(task) {
                loaded += 1;
            }
        }
        tracing::info!(tasks = loaded, "task graph loaded");
        Ok(())
    }

    /// Adds tasks created since the last scan.
    pub fn refresh(&self) -> anyhow::Result<usize> {
        let mut fresh: Vec<Task> = {
            let graph = self.graph();
            self.store
                .list_all()?
                .into_iter()
                .filter(|t| !graph.contains(&t.id))
                .collect()
        };
        fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut added = 0;
        for task in fresh {
            if task.status == TaskStatus::Running {
                // Another worker owns it.
                tracing::warn!(task_id = %task.id, "skipping task already running elsewhere");
                continue;
            }
            let id = task.id.clone();
            if self.add_to_graph(task) {
                tracing::debug!(task_id = %id, "picked up new task");
                added += 1;
            }
        }
        Ok(added)
    }

    fn add_to_graph(&self, task: Task) -> bool {
        let id = task.id.clone();
        let changed = match self.graph().add_task(task) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "skipping task");
                return false;
            }
        };
        for t in &changed {
            self.persist(t);
        }
        true
    }

    /// Dispatches ready tasks in priority order until one does not fit.
    ///
    /// Sessions to resume take slots before any new task starts. Returns the
    /// IDs that were started or resumed. Executions are spawned on `inflight`
    /// and observe `cancel`.
    pub fn tick(
        &self,
        inflight: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<String>> {
        let mut dispatched = Vec::new();
        if !self.resume_pending(inflight, cancel, &mut dispatched) {
            return Ok(dispatched);
        }

        let now = OffsetDateTime::now_utc();
        let ready = self.graph().get_ready_tasks(now);

        for task in ready {
            if !self.resources.can_acquire(&task.category) {
                tracing::debug!(task_id = %task.id, category = %task.category, "no free slot; waiting for next tick");
                break;
            }
            let slot = match self.resources.try_acquire_slot(&task.category, &task.id) {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::debug!(task_id = %task.id, error = %e, "slot taken concurrently");
                    break;
                }
            };

            let mut running = task;
            running.mark_running(running.session_name(), now);
            if let Err(e) = self.graph().update_task(running.clone()) {
                tracing::warn!(task_id = %running.id, error = %e, "cannot start task");
                continue;
            }
            self.persist(&running);

            tracing::info!(
                task_id = %running.id,
                name = %running.display_name(),
                priority = running.priority,
                category = %running.category,
                session = running.session_id.as_deref().unwrap_or_default(),
                "dispatching task"
            );
            dispatched.push(running.id.clone());

            let worker = self.clone();
            let cancel = cancel.clone();
            inflight.spawn(async move {
                let outcome = worker.engine.execute_task(&cancel, &running).await;
                worker.complete(running, slot, outcome);
            });
        }
        Ok(dispatched)
    }

    /// Hands resumable sessions back to the engine. Returns false while one
    /// still waits for a slot.
    fn resume_pending(
        &self,
        inflight: &mut JoinSet<()>,
        cancel: &CancellationToken,
        dispatched: &mut Vec<String>,
    ) -> bool {
        loop {
            let Some(task) = lock(&self.resumable).first().cloned() else {
                return true;
            };
            let slot = match self.resources.try_acquire_slot(&task.category, &task.id) {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::debug!(task_id = %task.id, error = %e, "no free slot to resume task");
                    return false;
                }
            };
            lock(&self.resumable).remove(0);

            tracing::info!(task_id = %task.id, category = %task.category, "resuming task");
            dispatched.push(task.id.clone());
            let worker = self.clone();
            let cancel = cancel.clone();
            inflight.spawn(async move {
                let outcome = worker.engine.resume_task(&cancel, &task).await;
                worker.complete(task, slot, outcome);
            });
        }
    }

    /// Records the outcome of one execution and releases its dependents.
    pub fn complete(&self, mut task: Task, slot: Slot, outcome: Result<TaskResult, GwtaskError>) {
        slot.release();

        let now = OffsetDateTime::now_utc();
        let result = match outcome {
            Ok(result) => result,
            Err(GwtaskError::Cancelled) => {
                tracing::info!(task_id = %task.id, "execution cancelled; task left running");
                return;
            }
            Err(e) => TaskResult::failure(1, elapsed_since(task.started_at, now), e.to_string()),
        };
        task.finish(result, now);
        self.persist(&task);

        match &task.result {
            Some(r) if r.succeeded() => tracing::info!(
                task_id = %task.id,
                duration_ms = r.duration_ms,
                files_changed = r.files_changed.len(),
                "task completed"
            ),
            Some(r) => tracing::warn!(
                task_id = %task.id,
                exit_code = r.exit_code,
                error = r.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            None => {}
        }

        let released = match self.graph().update_task(task.clone()) {
            Ok(released) => released,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "failed to update task graph");
                Vec::new()
            }
        };
        for t in &released {
            tracing::info!(task_id = %t.id, after = %task.id, "dependencies completed; task is pending");
            self.persist(t);
        }
        if task.status == TaskStatus::Failed {
            self.report_blocked();
        }
    }

    /// Logs each task blocked by a failed dependency once per run.
    pub fn report_blocked(&self) -> Vec<(String, String)> {
        let blocked = self.graph().blocked_by_failure();
        let mut reported = lock(&self.reported_blocked);
        for (task_id, failed) in &blocked {
            if reported.insert(task_id.clone()) {
                tracing::warn!(task_id = %task_id, failed_dependency = %failed, "task is blocked by a failed dependency");
            }
        }
        blocked
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save(task) {
            tracing::error!(task_id = %task.id, error = %format!("{e:#}"), "failed to persist task");
        }
    }

    /// Runs until `shutdown` is cancelled or a stop is requested.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let queue_dir = self.cfg.queue_dir.clone();
        std::fs::create_dir_all(&queue_dir)
            .with_context(|| format!("failed to create {}", queue_dir.display()))?;
        let _guard = WorkerGuard::acquire(&queue_dir)?;

        if self.cfg.auto_cleanup && self.cfg.log_retention_days > 0 {
            match self
                .engine
                .history()
                .prune_older_than(self.cfg.log_retention_days)
            {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "pruned old execution logs"),
                Err(e) => tracing::warn!(error = %e, "execution log cleanup failed"),
            }
        }

        self.load().await?;
        self.report_blocked();
        tracing::info!(
            queue_dir = %queue_dir.display(),
            max_parallel = self.cfg.max_parallel,
            poll_interval = ?self.cfg.poll_interval,
            "worker started"
        );

        let stop_file = stop_path(&queue_dir);
        let exec_cancel = CancellationToken::new();
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Some(res) = inflight.join_next() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "execution task panicked");
                    }
                    continue;
                }
            }

            if stop_file.exists() {
                tracing::info!("stop requested");
                break;
            }

            tracing::trace!("polling task store");
            if let Err(e) = self.refresh() {
                tracing::warn!(error = %format!("{e:#}"), "failed to rescan task store");
            }
            if let Err(e) = self.tick(&mut inflight, &exec_cancel) {
                tracing::error!(error = %format!("{e:#}"), "dispatch failed");
            }
        }

        self.shutdown(inflight, exec_cancel).await;
        tracing::info!("worker stopped");
        Ok(())
    }

    async fn shutdown(&self, mut inflight: JoinSet<()>, exec_cancel: CancellationToken) {
        if inflight.is_empty() {
            return;
        }
        let grace = self.cfg.shutdown_grace;
        if !grace.is_zero() {
            tracing::info!(in_flight = inflight.len(), ?grace, "waiting for running tasks");
            let drained =
                tokio::time::timeout(grace, async { while inflight.join_next().await.is_some() {} })
                    .await;
            if drained.is_ok() {
                return;
            }
        }

        tracing::info!(in_flight = inflight.len(), "abandoning running tasks");
        exec_cancel.cancel();
        // Without a grace period only session kills are worth waiting for.
        if !grace.is_zero() || self.engine.kills_session_on_cancel() {
            let _ = tokio::time::timeout(CANCEL_SETTLE, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
        }
        inflight.detach_all();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn elapsed_since(start: Option<OffsetDateTime>, now: OffsetDateTime) -> Duration {
    start
        .and_then(|s| Duration::try_from(now - s).ok())
        .unwrap_or_default()
}

fn fail_stale(task: &mut Task, now: OffsetDateTime) {
    if task.session_id.is_none() {
        task.session_id = Some(task.session_name());
    }
    let elapsed = elapsed_since(task.started_at, now);
    task.finish(
        TaskResult::failure(UNKNOWN_EXIT_CODE, elapsed, STALE_RUNNING_ERROR),
        now,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLock {
    pub pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub stop_requested: bool,
    pub counts: BTreeMap<String, usize>,
    pub active_sessions: Vec<String>,
    pub blocked: usize,
}

#[must_use]
pub fn lock_path(queue_dir: &Path) -> PathBuf {
    queue_dir.join("worker.lock")
}

#[must_use]
pub fn stop_path(queue_dir: &Path) -> PathBuf {
    queue_dir.join("worker.stop")
}

pub fn load_worker_lock(queue_dir: &Path) -> anyhow::Result<Option<WorkerLock>> {
    let path = lock_path(queue_dir);
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let lock: WorkerLock = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(lock))
}

pub fn worker_status(queue_dir: &Path, tasks: &[Task]) -> anyhow::Result<WorkerStatusReport> {
    let lock = load_worker_lock(queue_dir)?;
    let stop_requested = stop_path(queue_dir).exists();

    let mut counts: BTreeMap<String, usize> = TaskStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_owned(), 0))
        .collect();
    for t in tasks {
        *counts.entry(t.status.as_str().to_owned()).or_insert(0) += 1;
    }

    let active_sessions = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .filter_map(|t| t.session_id.clone())
        .collect();

    let mut graph = DependencyGraph::default();
    for t in tasks {
        let _ = graph.add_task(t.clone());
    }

    Ok(WorkerStatusReport {
        running: lock.is_some(),
        pid: lock.as_ref().map(|l| l.pid),
        started_at: lock.as_ref().map(|l| l.started_at),
        stop_requested,
        counts,
        active_sessions,
        blocked: graph.blocked_by_failure().len(),
    })
}

/// Asks a running worker to stop and waits up to `timeout` for it to exit.
pub async fn request_stop(queue_dir: &Path, timeout: Duration) -> anyhow::Result<bool> {
    let lock = load_worker_lock(queue_dir)?;
    if lock.is_none() {
        return Ok(false);
    }
    let stop = stop_path(queue_dir);
    std::fs::write(&stop, b"stop\n")
        .with_context(|| format!("failed to write {}", stop.display()))?;

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !lock_path(queue_dir).exists() {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(false)
}

struct WorkerGuard {
    lock_file: PathBuf,
    stop_file: PathBuf,
}

impl WorkerGuard {
    fn acquire(queue_dir: &Path) -> anyhow::Result<Self> {
        let lock_file = lock_path(queue_dir);
        let stop_file = stop_path(queue_dir);
        let mut f = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => anyhow::bail!(
                "worker already running ({} exists; remove it if no worker is alive)",
                lock_file.display()
            ),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", lock_file.display()));
            }
        };
        // A stop request left over from an earlier run must not end this one.
        let _ = std::fs::remove_file(&stop_file);
        let guard = Self {
            lock_file,
            stop_file,
        };

        let lock = WorkerLock {
            pid: std::process::id(),
            started_at: OffsetDateTime::now_utc(),
        };
        f.write_all(&serde_json::to_vec_pretty(&lock)?)
            .with_context(|| format!("failed to write {}", guard.lock_file.display()))?;
        Ok(guard)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_file);
        let _ = std::fs::remove_file(&self.stop_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_running_tasks_fail_with_a_result() {
        let mut t = Task::new("a1", "demo", "wt");
        t.mark_running(t.session_name(), OffsetDateTime::now_utc());
        fail_stale(&mut t, OffsetDateTime::now_utc());
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.result.as_ref().map(|r| r.exit_code), Some(UNKNOWN_EXIT_CODE));
        t.check_invariants().unwrap();
    }

    #[test]
    fn status_report_counts_sessions_and_blocked_tasks() {
        let td = tempfile::tempdir().expect("tempdir");

        let mut failed = Task::new("a", "a", "wt-a");
        failed.mark_running(failed.session_name(), OffsetDateTime::now_utc());
        failed.finish(
            TaskResult::failure(2, Duration::from_secs(1), "boom"),
            OffsetDateTime::now_utc(),
        );
        let mut blocked = Task::new("b", "b", "wt-b");
        blocked.depends_on = vec!["a".to_owned()];
        blocked.status = TaskStatus::Waiting;
        let mut running = Task::new("c", "c", "wt-c");
        running.mark_running(running.session_name(), OffsetDateTime::now_utc());

        let report = worker_status(td.path(), &[failed, blocked, running]).unwrap();
        assert!(!report.running);
        assert_eq!(report.counts.get("failed"), Some(&1));
        assert_eq!(report.counts.get("pending"), Some(&0));
        assert_eq!(report.active_sessions, vec!["gwtask-c".to_owned()]);
        assert_eq!(report.blocked, 1);
    }

    #[test]
    fn lock_is_exclusive_and_removed_on_drop() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(stop_path(td.path()), b"stop\n").unwrap();
        {
            let _guard = WorkerGuard::acquire(td.path()).unwrap();
            assert!(!stop_path(td.path()).exists());
            assert!(WorkerGuard::acquire(td.path()).is_err());
            let lock = load_worker_lock(td.path()).unwrap().unwrap();
            assert_eq!(lock.pid, std::process::id());
        }
        assert!(!lock_path(td.path()).exists());
    }

    #[tokio::test]
    async fn request_stop_without_worker_is_a_no_op() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(!request_stop(td.path(), Duration::from_millis(10)).await.unwrap());
        assert!(!stop_path(td.path()).exists());
    }
}
