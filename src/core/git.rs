#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::GwtaskError;

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    pub fn from_cwd() -> Result<Self, GwtaskError> {
        let cwd = std::env::current_dir()
            .map_err(|e| GwtaskError::Other(format!("failed to get cwd: {e}")))?;
        Self::from_dir(&cwd)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, GwtaskError> {
        let repo_root = find_repo_root(dir).ok_or(GwtaskError::NotInGitRepo)?;
        Ok(Self { repo_root })
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn list_worktrees_porcelain(&self) -> Result<String, GwtaskError> {
        self.run(&["worktree", "list", "--porcelain"])
    }

    #[must_use]
    pub fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.run_raw(&["show-ref", "--verify", "--quiet", &reference])
            .is_ok_and(|out| out.status.success())
    }

    /// Checks out an existing `branch` at `path`.
    pub fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), GwtaskError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    /// Creates `branch` from `base` (or HEAD) and checks it out at `path`.
    pub fn add_worktree_from_base(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&str>,
    ) -> Result<(), GwtaskError> {
        let path = path.to_string_lossy();
        if let Some(base) = base {
            let _ = self.run(&["worktree", "add", "-b", branch, &path, base])?;
        } else {
            let _ = self.run(&["worktree", "add", "-b", branch, &path])?;
        }
        Ok(())
    }

    pub fn head_commit(&self, dir: &Path) -> Result<String, GwtaskError> {
        Ok(self.run_in_dir(dir, &["rev-parse", "HEAD"])?.trim().to_owned())
    }

    pub fn run(&self, args: &[&str]) -> Result<String, GwtaskError> {
        self.run_in_dir(&self.repo_root, args)
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, GwtaskError> {
        run_git(&self.repo_root, args)
    }

    pub fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String, GwtaskError> {
        let out = run_git(dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(GwtaskError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<Output, GwtaskError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GwtaskError::GitNotFound,
            _ => GwtaskError::Other(format!("failed to run git: {e}")),
        })
}

#[must_use]
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(".git");
        if candidate.is_dir() || candidate.is_file() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}
