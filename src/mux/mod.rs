#![forbid(unsafe_code)]

pub mod tmux;
pub mod zellij;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{MuxBackendKind, MuxConfig};
use crate::error::GwtaskError;

/// Opaque identifier of a running session, as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub task_id: String,
    pub task_name: String,
    pub worktree: String,
}

/// A persistent, named execution context that outlives the worker process.
///
/// Methods block; async callers run them on the blocking pool.
pub trait SessionBackend: Send + Sync {
    fn id(&self) -> &'static str;

    fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionHandle, GwtaskError>;

    fn session_exists(&self, handle: &SessionHandle) -> Result<bool, GwtaskError>;

    /// Foreground process of the session. `Some("")` means nothing is running
    /// any more; `None` means the backend cannot tell.
    fn current_process_name(&self, handle: &SessionHandle) -> Result<Option<String>, GwtaskError>;

    fn capture_recent_output(
        &self,
        handle: &SessionHandle,
        lines: usize,
    ) -> Result<String, GwtaskError>;

    fn kill(&self, handle: &SessionHandle) -> Result<(), GwtaskError>;

    fn attach(&self, handle: &SessionHandle) -> Result<(), GwtaskError>;
}

#[must_use]
pub fn backend_from_config(cfg: &MuxConfig, shell: &str) -> Arc<dyn SessionBackend> {
    match cfg.backend {
        MuxBackendKind::Tmux => Arc::new(tmux::TmuxBackend::new(
            cfg.tmux_command.clone(),
            shell.to_owned(),
        )),
        MuxBackendKind::Zellij => Arc::new(zellij::ZellijBackend::new(
            cfg.zellij_command.clone(),
            shell.to_owned(),
        )),
    }
}

/// Keeps the last `lines` lines of captured output.
#[must_use]
pub fn tail_lines(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_the_end() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 3), "");
    }
}
