#![forbid(unsafe_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::worktree::{ChangeTracker, WorktreeProvider};
use crate::error::GwtaskError;
use crate::mux::{SessionBackend, SessionHandle, SessionMetadata};
use crate::task::history::{ExecutionLog, ExecutionRecord, ExecutionStatus};
use crate::task::model::{Runner, Task, TaskResult, duration_millis};
use crate::task::prompt::{CompletionMarker, build_prompt, compose_command};

/// Exit code recorded when the agent's real status is unknown.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub monitor_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive monitoring rounds with a failed probe before the task fails.
    pub max_probe_failures: u32,
    pub capture_lines: usize,
    pub execution_timeout: Option<Duration>,
    pub kill_session_on_cancel: bool,
    pub kill_session_on_exit: bool,
    pub claude_executable: String,
    pub codex_executable: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            max_probe_failures: 5,
            capture_lines: 200,
            execution_timeout: None,
            kill_session_on_cancel: false,
            kill_session_on_exit: false,
            claude_executable: "claude".to_owned(),
            codex_executable: "codex".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let timings = cfg.tasks.timings()?;
        Ok(Self {
            monitor_interval: timings.monitor_interval,
            probe_timeout: timings.probe_timeout,
            max_probe_failures: cfg.tasks.max_probe_failures,
            capture_lines: cfg.mux.capture_lines,
            execution_timeout: timings.execution_timeout,
            kill_session_on_cancel: cfg.tasks.kill_session_on_cancel,
            kill_session_on_exit: cfg.tasks.kill_session_on_exit,
            claude_executable: cfg.tasks.claude_executable.clone(),
            codex_executable: cfg.tasks.codex_executable.clone(),
        })
    }

    fn executable(&self, runner: Runner) -> &str {
        match runner {
            Runner::Claude => &self.claude_executable,
            Runner::Codex => &self.codex_executable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Marker,
    Gone,
    ProcessExited,
}

#[derive(Debug)]
struct Monitored {
    end: SessionEnd,
    marker: Option<CompletionMarker>,
    output: String,
}

enum Interrupted {
    Cancelled,
    TimedOut(Duration),
    MonitorFailed(GwtaskError),
}

/// A session being watched, with what is needed to judge its outcome.
struct Supervised {
    handle: SessionHandle,
    workdir: PathBuf,
    baseline: Option<String>,
    record: ExecutionRecord,
    started: Instant,
}

/// Runs one task to a terminal determination inside a multiplexer session.
pub struct ExecutionEngine {
    sessions: Arc<dyn SessionBackend>,
    worktrees: Arc<dyn WorktreeProvider>,
    changes: Arc<dyn ChangeTracker>,
    history: ExecutionLog,
    cfg: EngineConfig,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionBackend>,
        worktrees: Arc<dyn WorktreeProvider>,
        changes: Arc<dyn ChangeTracker>,
        history: ExecutionLog,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            sessions,
            worktrees,
            changes,
            history,
            cfg,
        }
    }

    #[must_use]
    pub fn history(&self) -> &ExecutionLog {
        &self.history
    }

    #[must_use]
    pub fn kills_session_on_cancel(&self) -> bool {
        self.cfg.kill_session_on_cancel
    }

    /// Executes `task`, which must already carry its reserved session name.
    ///
    /// Returns `Err(Cancelled)` when `cancel` fires; every other error means
    /// the task failed.
    pub async fn execute_task(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GwtaskError> {
        let started = Instant::now();
        let session_name = task.session_id.clone().unwrap_or_else(|| task.session_name());

        let workdir = self.resolve_worktree(cancel, task).await?;
        let prompt = build_prompt(task);
        let command = compose_command(task.runner, self.cfg.executable(task.runner), &prompt);
        let baseline = self.baseline(task, &workdir).await;

        let mut record = ExecutionRecord {
            session_id: session_name.clone(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            runner: task.runner,
            prompt,
            working_directory: workdir.to_string_lossy().to_string(),
            baseline: baseline.clone(),
            status: ExecutionStatus::Running,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            exit_code: None,
            error: None,
        };
        self.save_record(&record);

        let handle = {
            let sessions = Arc::clone(&self.sessions);
            let name = session_name.clone();
            let dir = workdir.clone();
            let metadata = SessionMetadata {
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                worktree: task.worktree.clone(),
            };
            blocking(move || sessions.create_session(&name, &dir, &command, &metadata)).await
        };
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                record.finish(ExecutionStatus::Failed, None, Some(e.to_string()));
                self.save_record(&record);
                return Err(e);
            }
        };
        tracing::info!(task_id = %task.id, session = %handle, workdir = %workdir.display(), "session started");

        let run = Supervised {
            handle,
            workdir,
            baseline,
            record,
            started,
        };
        self.supervise(cancel, task, run).await
    }

    /// Whether the session of a task left running by an earlier worker is still alive.
    pub async fn session_alive(&self, task: &Task) -> Result<bool, GwtaskError> {
        let handle = SessionHandle(task.session_id.clone().unwrap_or_else(|| task.session_name()));
        self.probe("session_exists", move |s| s.session_exists(&handle))
            .await
    }

    /// Takes over monitoring of a session started by an earlier worker.
    ///
    /// The stored execution record supplies the working directory and baseline;
    /// without one the worktree is resolved again and changed files are not reported.
    pub async fn resume_task(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GwtaskError> {
        let session_name = task.session_id.clone().unwrap_or_else(|| task.session_name());
        let elapsed = task
            .started_at
            .and_then(|s| Duration::try_from(OffsetDateTime::now_utc() - s).ok())
            .unwrap_or_default();
        let started = Instant::now().checked_sub(elapsed).unwrap_or_else(Instant::now);

        let (workdir, record) = match self.history.load(&session_name) {
            Ok(mut record) => {
                record.status = ExecutionStatus::Running;
                (PathBuf::from(&record.working_directory), record)
            }
            Err(e) => {
                tracing::debug!(session = %session_name, error = %format!("{e:#}"), "no execution record; resolving worktree again");
                let workdir = self.resolve_worktree(cancel, task).await?;
                let record = ExecutionRecord {
                    session_id: session_name.clone(),
                    task_id: task.id.clone(),
                    task_name: task.name.clone(),
                    runner: task.runner,
                    prompt: build_prompt(task),
                    working_directory: workdir.to_string_lossy().to_string(),
                    baseline: None,
                    status: ExecutionStatus::Running,
                    start_time: task.started_at.unwrap_or_else(OffsetDateTime::now_utc),
                    end_time: None,
                    exit_code: None,
                    error: None,
                };
                (workdir, record)
            }
        };
        self.save_record(&record);
        tracing::info!(task_id = %task.id, session = %session_name, "resumed monitoring of running session");

        let run = Supervised {
            handle: SessionHandle(session_name),
            workdir,
            baseline: record.baseline.clone(),
            record,
            started,
        };
        self.supervise(cancel, task, run).await
    }

    async fn supervise(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        run: Supervised,
    ) -> Result<TaskResult, GwtaskError> {
        let Supervised {
            handle,
            workdir,
            baseline,
            mut record,
            started,
        } = run;

        let deadline = async {
            match self.cfg.execution_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit.saturating_sub(started.elapsed())).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };
        let monitored = tokio::select! {
            () = cancel.cancelled() => Err(Interrupted::Cancelled),
            limit = deadline => Err(Interrupted::TimedOut(limit)),
            m = self.monitor(&handle) => m.map_err(Interrupted::MonitorFailed),
        };

        let monitored = match monitored {
            Ok(m) => m,
            Err(Interrupted::Cancelled) => {
                if self.cfg.kill_session_on_cancel {
                    self.kill_session(&handle).await;
                }
                record.finish(ExecutionStatus::Cancelled, None, None);
                self.save_record(&record);
                return Err(GwtaskError::Cancelled);
            }
            Err(Interrupted::TimedOut(limit)) => {
                tracing::warn!(task_id = %task.id, session = %handle, ?limit, "execution timed out");
                self.save_final_output(&handle).await;
                self.kill_session(&handle).await;
                let err = GwtaskError::ExecutionTimedOut(limit);
                record.finish(ExecutionStatus::Failed, None, Some(err.to_string()));
                self.save_record(&record);
                return Err(err);
            }
            Err(Interrupted::MonitorFailed(err)) => {
                tracing::error!(task_id = %task.id, session = %handle, error = %err, "giving up on session");
                record.finish(ExecutionStatus::Failed, None, Some(err.to_string()));
                self.save_record(&record);
                return Err(err);
            }
        };

        if let Err(e) = self.history.save_output(handle.as_str(), &monitored.output) {
            tracing::warn!(session = %handle, error = %e, "failed to store session output");
        }
        tracing::debug!(task_id = %task.id, end = ?monitored.end, "monitoring finished");

        let mut result = match &monitored.marker {
            Some(m) if m.success => TaskResult {
                exit_code: m.exit_code,
                duration_ms: 0,
                files_changed: Vec::new(),
                error: None,
            },
            Some(m) => TaskResult::failure(
                m.exit_code,
                Duration::ZERO,
                format!("agent reported failure ({})", m.subtype),
            ),
            None => TaskResult::failure(
                UNKNOWN_EXIT_CODE,
                Duration::ZERO,
                "session ended without a completion marker (aborted)",
            ),
        };

        if let Some(baseline) = baseline {
            let changes = Arc::clone(&self.changes);
            let dir = workdir.clone();
            match blocking(move || changes.changed_files_since(&dir, &baseline)).await {
                Ok(files) => result.files_changed = files,
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to list changed files"),
            }
        }

        if result.succeeded() && task.auto_commit {
            let changes = Arc::clone(&self.changes);
            let dir = workdir.clone();
            let message = format!("gwtask {}: {}", task.id, task.display_name());
            if let Err(e) = blocking(move || changes.commit_all(&dir, &message)).await {
                result.exit_code = 1;
                result.error = Some(format!("auto-commit failed: {e}"));
            }
        }

        if self.cfg.kill_session_on_exit {
            self.kill_session(&handle).await;
        }

        result.duration_ms = duration_millis(started.elapsed());
        let status = match (&monitored.marker, result.succeeded()) {
            (_, true) => ExecutionStatus::Completed,
            (None, false) => ExecutionStatus::Aborted,
            (Some(_), false) => ExecutionStatus::Failed,
        };
        record.finish(status, Some(result.exit_code), result.error.clone());
        self.save_record(&record);
        Ok(result)
    }

    async fn baseline(&self, task: &Task, workdir: &Path) -> Option<String> {
        let changes = Arc::clone(&self.changes);
        let dir = workdir.to_path_buf();
        match blocking(move || changes.baseline(&dir)).await {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "no baseline; changed files will not be reported");
                None
            }
        }
    }

    async fn resolve_worktree(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<PathBuf, GwtaskError> {
        let Some(repository) = task.repository.as_deref().filter(|r| !r.trim().is_empty()) else {
            return Err(GwtaskError::WorktreeUnavailable {
                name: task.worktree.clone(),
                reason: "task has no repository".to_owned(),
            });
        };
        let worktrees = Arc::clone(&self.worktrees);
        let repository = PathBuf::from(repository);
        let name = task.worktree.clone();
        let base = task.base_branch.clone();
        let resolve = blocking(move || {
            worktrees.resolve_or_create(Path::new(&repository), &name, base.as_deref())
        });
        let resolved = until_cancelled(cancel, resolve).await?;
        resolved.map_err(|e| match e {
            GwtaskError::WorktreeUnavailable { .. } => e,
            other => GwtaskError::WorktreeUnavailable {
                name: task.worktree.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Polls the session until it ends.
    ///
    /// A round in which any probe fails is tolerated; `max_probe_failures`
    /// such rounds in a row end monitoring with an error.
    async fn monitor(&self, handle: &SessionHandle) -> Result<Monitored, GwtaskError> {
        let mut ticker = tokio::time::interval(self.cfg.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut output = String::new();
        let mut seen_agent = false;
        let mut failed_rounds = 0u32;

        loop {
            ticker.tick().await;

            let err = match self.poll_once(handle, &mut output, &mut seen_agent).await {
                Ok(Some(end)) => {
                    return Ok(Monitored {
                        end,
                        marker: CompletionMarker::find_last(&output),
                        output,
                    });
                }
                Ok(None) => {
                    failed_rounds = 0;
                    continue;
                }
                Err(e) => e,
            };

            failed_rounds += 1;
            tracing::warn!(session = %handle, error = %err, attempt = failed_rounds, "session probe failed");
            if failed_rounds >= self.cfg.max_probe_failures.max(1) {
                return Err(GwtaskError::Session(format!(
                    "monitoring failed after {failed_rounds} consecutive probe failures: {err}"
                )));
            }
        }
    }

    /// One monitoring round. `Ok(None)` means the session is still running.
    async fn poll_once(
        &self,
        handle: &SessionHandle,
        output: &mut String,
        seen_agent: &mut bool,
    ) -> Result<Option<SessionEnd>, GwtaskError> {
        let h = handle.clone();
        if !self.probe("session_exists", move |s| s.session_exists(&h)).await? {
            return Ok(Some(SessionEnd::Gone));
        }

        *output = self.capture(handle).await?;
        if CompletionMarker::find_last(output).is_some() {
            return Ok(Some(SessionEnd::Marker));
        }

        let h = handle.clone();
        let Some(name) = self.probe("process", move |s| s.current_process_name(&h)).await? else {
            return Ok(None);
        };
        let name = name.trim();
        let exited = name.is_empty() || (*seen_agent && SHELLS.contains(&name));
        if !name.is_empty() && !SHELLS.contains(&name) {
            *seen_agent = true;
        }
        tracing::trace!(session = %handle, process = name, "foreground process");
        if !exited {
            return Ok(None);
        }
        // The pane may have printed its last lines after the capture above.
        match self.capture(handle).await {
            Ok(last) => *output = last,
            Err(e) => tracing::warn!(session = %handle, error = %e, "final capture failed"),
        }
        Ok(Some(SessionEnd::ProcessExited))
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<String, GwtaskError> {
        let h = handle.clone();
        let lines = self.cfg.capture_lines;
        self.probe("capture", move |s| s.capture_recent_output(&h, lines))
            .await
    }

    async fn probe<T, F>(&self, what: &'static str, f: F) -> Result<T, GwtaskError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionBackend) -> Result<T, GwtaskError> + Send + 'static,
    {
        let sessions = Arc::clone(&self.sessions);
        let after = self.cfg.probe_timeout;
        match tokio::time::timeout(after, blocking(move || f(sessions.as_ref()))).await {
            Ok(res) => res,
            Err(_) => Err(GwtaskError::ProbeTimeout { what, after }),
        }
    }

    async fn save_final_output(&self, handle: &SessionHandle) {
        match self.capture(handle).await {
            Ok(output) => {
                if let Err(e) = self.history.save_output(handle.as_str(), &output) {
                    tracing::warn!(session = %handle, error = %e, "failed to store session output");
                }
            }
            Err(e) => tracing::warn!(session = %handle, error = %e, "capture probe failed"),
        }
    }

    async fn kill_session(&self, handle: &SessionHandle) {
        let h = handle.clone();
        match self.probe("kill", move |s| s.kill(&h)).await {
            Ok(()) => tracing::debug!(session = %handle, "session killed"),
            Err(e) => tracing::warn!(session = %handle, error = %e, "failed to kill session"),
        }
    }

    fn save_record(&self, record: &ExecutionRecord) {
        if let Err(e) = self.history.save(record) {
            tracing::error!(session = %record.session_id, error = %e, "failed to save execution record");
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, GwtaskError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GwtaskError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GwtaskError::Other(format!("blocking task failed: {e}")))?
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, GwtaskError> {
    tokio::select! {
        () = cancel.cancelled() => Err(GwtaskError::Cancelled),
        v = fut => Ok(v),
    }
}
