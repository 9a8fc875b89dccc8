#![forbid(unsafe_code)]

use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::error::GwtaskError;
use crate::mux::{SessionBackend, SessionHandle, SessionMetadata};

#[derive(Debug, Clone)]
pub struct TmuxBackend {
    pub tmux_command: String,
    pub shell: String,
}

impl TmuxBackend {
    #[must_use]
    pub fn new(tmux_command: String, shell: String) -> Self {
        Self {
            tmux_command,
            shell,
        }
    }

    fn output(&self, args: &[&str]) -> Result<Output, GwtaskError> {
        Command::new(&self.tmux_command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GwtaskError::MuxNotFound("tmux"),
                _ => GwtaskError::Session(format!("failed to run tmux: {e}")),
            })
    }

    fn run(&self, args: &[&str]) -> Result<String, GwtaskError> {
        let out = self.output(args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(GwtaskError::Session(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

fn session_target(handle: &SessionHandle) -> String {
    format!("={handle}")
}

fn pane_target(handle: &SessionHandle) -> String {
    format!("={handle}:")
}

impl SessionBackend for TmuxBackend {
    fn id(&self) -> &'static str {
        "tmux"
    }

    fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionHandle, GwtaskError> {
        let handle = SessionHandle(name.to_owned());
        if self.session_exists(&handle)? {
            return Err(GwtaskError::Session(format!(
                "tmux session '{name}' already exists"
            )));
        }
        let cwd = working_dir.to_string_lossy();
        self.run(&["new-session", "-d", "-s", name, "-c", &cwd, "-x", "220", "-y", "50"])?;

        // The pane must survive the agent exiting so its output can still be read.
        let target = session_target(&handle);
        self.run(&["set-option", "-w", "-t", &target, "remain-on-exit", "on"])?;
        for (key, value) in [
            ("@gwtask_task_id", metadata.task_id.as_str()),
            ("@gwtask_task_name", metadata.task_name.as_str()),
            ("@gwtask_worktree", metadata.worktree.as_str()),
        ] {
            if let Err(e) = self.run(&["set-option", "-t", &target, key, value]) {
                tracing::debug!(session = name, key, error = %e, "failed to tag tmux session");
            }
        }

        let pane = pane_target(&handle);
        self.run(&[
            "respawn-pane",
            "-k",
            "-t",
            &pane,
            "-c",
            &cwd,
            &self.shell,
            "-lc",
            command,
        ])?;
        Ok(handle)
    }

    fn session_exists(&self, handle: &SessionHandle) -> Result<bool, GwtaskError> {
        // Exits non-zero both when the session is missing and when no server runs.
        let out = self.output(&["has-session", "-t", &session_target(handle)])?;
        Ok(out.status.success())
    }

    fn current_process_name(&self, handle: &SessionHandle) -> Result<Option<String>, GwtaskError> {
        let out = self.run(&[
            "display-message",
            "-p",
            "-t",
            &pane_target(handle),
            "#{?pane_dead,,#{pane_current_command}}",
        ])?;
        Ok(Some(out.trim().to_owned()))
    }

    fn capture_recent_output(
        &self,
        handle: &SessionHandle,
        lines: usize,
    ) -> Result<String, GwtaskError> {
        let start = format!("-{lines}");
        self.run(&[
            "capture-pane",
            "-p",
            "-J",
            "-t",
            &pane_target(handle),
            "-S",
            &start,
        ])
    }

    fn kill(&self, handle: &SessionHandle) -> Result<(), GwtaskError> {
        self.run(&["kill-session", "-t", &session_target(handle)])?;
        Ok(())
    }

    fn attach(&self, handle: &SessionHandle) -> Result<(), GwtaskError> {
        let status = Command::new(&self.tmux_command)
            .args(["attach-session", "-t", &session_target(handle)])
            .status()
            .map_err(|e| GwtaskError::Session(format!("failed to run tmux attach: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(GwtaskError::Session(format!(
                "tmux attach failed with exit code {code}",
                code = status.code().unwrap_or(1)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn failed_tmux_commands_surface_as_errors() {
        // `false` stands in for a tmux that rejects every command.
        let tmux = TmuxBackend::new("false".to_owned(), "/bin/sh".to_owned());
        let err = tmux.kill(&SessionHandle("gwtask-a".to_owned())).unwrap_err();
        assert!(err.to_string().contains("tmux kill-session failed"));
    }

    #[test]
    fn missing_tmux_binary_is_reported() {
        let tmux = TmuxBackend::new("gwtask-no-such-tmux".to_owned(), "/bin/sh".to_owned());
        let err = tmux.kill(&SessionHandle("gwtask-a".to_owned())).unwrap_err();
        assert!(matches!(err, GwtaskError::MuxNotFound("tmux")));
    }
}
