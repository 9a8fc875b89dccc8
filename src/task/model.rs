#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::GwtaskError;

pub const DEFAULT_CATEGORY: &str = "development";
pub const DEFAULT_PRIORITY: u8 = 50;
pub const SESSION_PREFIX: &str = "gwtask-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Waiting,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    #[must_use]
    pub fn has_started(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = GwtaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let want = s.trim().to_lowercase();
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == want)
            .ok_or_else(|| {
                GwtaskError::Validation(format!(
                    "unknown status '{s}' (use pending|waiting|running|completed|failed)"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Runner {
    #[default]
    Claude,
    Codex,
}

impl Runner {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Runner::Claude => "claude",
            Runner::Codex => "codex",
        }
    }
}

impl FromStr for Runner {
    type Err = GwtaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(Runner::Claude),
            "codex" => Ok(Runner::Codex),
            other => Err(GwtaskError::Validation(format!(
                "unsupported runner '{other}' (use claude|codex)"
            ))),
        }
    }
}

/// Outcome of one execution, present only once a task is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResult {
    #[must_use]
    pub fn failure(exit_code: i32, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            duration_ms: duration_millis(duration),
            files_changed: Vec::new(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub runner: Runner,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub verify: Vec<String>,
    #[serde(default)]
    pub auto_commit: bool,

    pub worktree: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,

    pub priority: u8,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    pub status: TaskStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_owned()
}

impl Task {
    /// A fresh task in its initial state: pending without dependencies, waiting otherwise.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            runner: Runner::default(),
            prompt: String::new(),
            files: Vec::new(),
            verify: Vec::new(),
            auto_commit: false,
            worktree: worktree.into(),
            repository: None,
            base_branch: None,
            priority: DEFAULT_PRIORITY,
            depends_on: Vec::new(),
            category: default_category(),
            created_at: OffsetDateTime::now_utc(),
            status: TaskStatus::Pending,
            session_id: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        id.chars().take(6).collect()
    }

    #[must_use]
    pub fn initial_status(depends_on: &[String]) -> TaskStatus {
        if depends_on.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Waiting
        }
    }

    #[must_use]
    pub fn session_name(&self) -> String {
        format!("{SESSION_PREFIX}{}", self.id)
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Marks the task running under `session`, reserving the handle before the session exists.
    pub fn mark_running(&mut self, session: String, now: OffsetDateTime) {
        self.status = TaskStatus::Running;
        self.session_id = Some(session);
        self.started_at = Some(now);
        self.completed_at = None;
        self.result = None;
    }

    pub fn finish(&mut self, result: TaskResult, now: OffsetDateTime) {
        self.status = if result.succeeded() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.completed_at = Some(now);
        self.result = Some(result);
    }

    /// Checks the status/result/session linkage invariants of a stored record.
    pub fn check_invariants(&self) -> Result<(), GwtaskError> {
        if self.status.is_terminal() != self.result.is_some() {
            return Err(GwtaskError::Validation(format!(
                "task {}: result must be present exactly when the task is terminal (status {})",
                self.id, self.status
            )));
        }
        if self.status.has_started() != self.session_id.is_some() {
            return Err(GwtaskError::Validation(format!(
                "task {}: session must be present exactly when the task has started (status {})",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

#[must_use]
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_status_follows_dependencies() {
        assert_eq!(Task::initial_status(&[]), TaskStatus::Pending);
        assert_eq!(
            Task::initial_status(&["abc".to_owned()]),
            TaskStatus::Waiting
        );
    }

    #[test]
    fn finish_sets_terminal_state_and_keeps_invariants() {
        let mut t = Task::new("a1", "demo", "feature/demo");
        t.mark_running(t.session_name(), OffsetDateTime::now_utc());
        t.check_invariants().unwrap();

        t.finish(
            TaskResult::failure(2, Duration::from_secs(3), "boom"),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.result.as_ref().map(|r| r.exit_code), Some(2));
        t.check_invariants().unwrap();
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Running".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn missing_category_defaults_to_development() {
        let t = Task::new("a1", "demo", "wt");
        let mut v = serde_json::to_value(&t).unwrap();
        v.as_object_mut().unwrap().remove("category");
        let back: Task = serde_json::from_value(v).unwrap();
        assert_eq!(back.category, DEFAULT_CATEGORY);
    }
}
