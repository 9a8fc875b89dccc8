#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use uuid::Uuid;

use crate::error::GwtaskError;
use crate::mux::{SessionBackend, SessionHandle, SessionMetadata, tail_lines};

#[derive(Debug, Clone)]
pub struct ZellijBackend {
    pub zellij_command: String,
    pub shell: String,
}

impl ZellijBackend {
    #[must_use]
    pub fn new(zellij_command: String, shell: String) -> Self {
        Self {
            zellij_command,
            shell,
        }
    }

    fn ensure_available(&self) -> Result<(), GwtaskError> {
        match Command::new(&self.zellij_command)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GwtaskError::MuxNotFound("zellij"))
            }
            Err(e) => Err(GwtaskError::Session(format!("failed to run zellij: {e}"))),
        }
    }

    fn status_ok(&self, args: &[&str], what: &str) -> Result<(), GwtaskError> {
        let status = Command::new(&self.zellij_command)
            .args(args)
            .stdin(std::process::Stdio::null())
            .status()
            .map_err(|e| GwtaskError::Session(format!("failed to run zellij {what}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(GwtaskError::Session(format!(
                "zellij {what} failed with exit code {code}",
                code = status.code().unwrap_or(1)
            )))
        }
    }

    fn live_sessions(&self) -> Result<Vec<String>, GwtaskError> {
        self.ensure_available()?;
        let out = Command::new(&self.zellij_command)
            .args(["list-sessions", "--no-formatting"])
            .output()
            .map_err(|e| GwtaskError::Session(format!("failed to run zellij: {e}")))?;

        // zellij exits non-zero when no sessions exist.
        if !out.status.success() {
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("EXITED"))
            .filter_map(|l| l.split_whitespace().next().map(str::to_owned))
            .collect())
    }

    fn dump_path(handle: &SessionHandle) -> PathBuf {
        std::env::temp_dir().join(format!(
            "gwtask-dump-{handle}-{}.txt",
            Uuid::new_v4().simple()
        ))
    }
}

impl SessionBackend for ZellijBackend {
    fn id(&self) -> &'static str {
        "zellij"
    }

    fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionHandle, GwtaskError> {
        self.ensure_available()?;
        if self.live_sessions()?.iter().any(|s| s == name) {
            return Err(GwtaskError::Session(format!(
                "zellij session '{name}' already exists"
            )));
        }
        self.status_ok(&["attach", "--create-background", name], "attach")?;

        let pane_name = if metadata.task_name.trim().is_empty() {
            metadata.task_id.as_str()
        } else {
            metadata.task_name.as_str()
        };
        let cwd = working_dir.to_string_lossy();
        // No --close-on-exit: the exited pane keeps its output for the monitor.
        self.status_ok(
            &[
                "--session",
                name,
                "run",
                "--cwd",
                &cwd,
                "-n",
                pane_name,
                "--",
                &self.shell,
                "-lc",
                command,
            ],
            "run",
        )?;
        Ok(SessionHandle(name.to_owned()))
    }

    fn session_exists(&self, handle: &SessionHandle) -> Result<bool, GwtaskError> {
        Ok(self.live_sessions()?.iter().any(|s| s == handle.as_str()))
    }

    fn current_process_name(&self, _handle: &SessionHandle) -> Result<Option<String>, GwtaskError> {
        // zellij does not expose the foreground command of a pane.
        Ok(None)
    }

    fn capture_recent_output(
        &self,
        handle: &SessionHandle,
        lines: usize,
    ) -> Result<String, GwtaskError> {
        self.ensure_available()?;
        let path = Self::dump_path(handle);
        let path_str = path.to_string_lossy().to_string();
        self.status_ok(
            &[
                "--session",
                handle.as_str(),
                "action",
                "dump-screen",
                "--full",
                &path_str,
            ],
            "dump-screen",
        )?;
        let data = std::fs::read_to_string(&path).map_err(|e| GwtaskError::IoPath {
            path: path.clone(),
            source: e,
        });
        let _ = std::fs::remove_file(&path);
        Ok(tail_lines(&data?, lines))
    }

    fn kill(&self, handle: &SessionHandle) -> Result<(), GwtaskError> {
        self.ensure_available()?;
        self.status_ok(&["kill-session", handle.as_str()], "kill-session")
    }

    fn attach(&self, handle: &SessionHandle) -> Result<(), GwtaskError> {
        self.ensure_available()?;
        let status = Command::new(&self.zellij_command)
            .args(["attach", handle.as_str()])
            .status()
            .map_err(|e| GwtaskError::Session(format!("failed to run zellij attach: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(GwtaskError::Session(format!(
                "zellij attach failed with exit code {code}",
                code = status.code().unwrap_or(1)
            )))
        }
    }
}
