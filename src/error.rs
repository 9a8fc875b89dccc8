#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::task::model::TaskStatus;

#[derive(Debug, Error)]
pub enum GwtaskError {
    #[error("not inside a git repository")]
    NotInGitRepo,

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("{0} is required but was not found in PATH")]
    MuxNotFound(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("invalid task: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("multiple tasks match pattern '{pattern}': {}", candidates.join(", "))]
    AmbiguousTask {
        pattern: String,
        candidates: Vec<String>,
    },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { task: String, path: Vec<String> },

    #[error("dependency chain through task {task} is {depth} deep (max {max})")]
    DepthExceeded {
        task: String,
        depth: usize,
        max: usize,
    },

    #[error("task {task}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("no free slot for category '{category}'")]
    ResourceExhausted { category: String },

    #[error("worktree '{name}' is unavailable: {reason}")]
    WorktreeUnavailable { name: String, reason: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("session probe '{what}' timed out after {after:?}")]
    ProbeTimeout { what: &'static str, after: Duration },

    #[error("execution timed out after {0:?}")]
    ExecutionTimedOut(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}
