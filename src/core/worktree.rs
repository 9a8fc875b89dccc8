#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{self as config_util, WorktreeConfig};
use crate::core::git::Git;
use crate::error::GwtaskError;

/// Maps a logical worktree name to a working directory, creating it if needed.
pub trait WorktreeProvider: Send + Sync {
    fn resolve_or_create(
        &self,
        repository: &Path,
        name: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, GwtaskError>;
}

/// Snapshots and diffs the files of a working directory.
pub trait ChangeTracker: Send + Sync {
    fn baseline(&self, dir: &Path) -> Result<String, GwtaskError>;

    /// Tracked files that differ from `baseline` plus untracked files, sorted.
    fn changed_files_since(&self, dir: &Path, baseline: &str) -> Result<Vec<String>, GwtaskError>;

    fn commit_all(&self, dir: &Path, message: &str) -> Result<(), GwtaskError>;
}

#[derive(Debug, Clone)]
pub struct GitWorktreeProvider {
    base_dir: String,
    auto_create: bool,
    sanitize: BTreeMap<String, String>,
}

impl GitWorktreeProvider {
    #[must_use]
    pub fn new(cfg: &WorktreeConfig) -> Self {
        Self {
            base_dir: cfg.base_dir.clone(),
            auto_create: cfg.auto_create,
            sanitize: cfg.sanitize.clone(),
        }
    }

    fn worktree_path(&self, git: &Git, name: &str) -> Result<PathBuf, GwtaskError> {
        let base = config_util::expand_path(&self.base_dir)
            .map_err(|e| GwtaskError::Config(format!("{e:#}")))?;
        let repo = git
            .repo_root()
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("repo");
        Ok(base
            .join(sanitize_for_filesystem(repo))
            .join(sanitize_name(name, &self.sanitize)))
    }
}

impl WorktreeProvider for GitWorktreeProvider {
    fn resolve_or_create(
        &self,
        repository: &Path,
        name: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, GwtaskError> {
        let unavailable = |reason: String| GwtaskError::WorktreeUnavailable {
            name: name.to_owned(),
            reason,
        };
        let git = Git::from_dir(repository)
            .map_err(|e| unavailable(format!("{}: {e}", repository.display())))?;

        let listing = git.list_worktrees_porcelain()?;
        if let Some(entry) = parse_worktree_porcelain(&listing)
            .into_iter()
            .find(|e| e.branch == name)
        {
            tracing::debug!(worktree = name, path = %entry.path, "using existing worktree");
            return Ok(PathBuf::from(entry.path));
        }

        if !self.auto_create {
            return Err(unavailable(
                "no worktree is checked out for this branch and auto_create is off".to_owned(),
            ));
        }

        let path = self.worktree_path(&git, name)?;
        if path.exists() && !is_empty_dir(&path) {
            return Err(unavailable(format!(
                "{} exists and is not an empty directory",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GwtaskError::IoPath {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let added = if git.branch_exists(name) {
            git.add_worktree(&path, name)
        } else {
            git.add_worktree_from_base(&path, name, base_branch)
        };
        added.map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(worktree = name, path = %path.display(), "created worktree");
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitChangeTracker;

impl GitChangeTracker {
    fn git(dir: &Path) -> Result<Git, GwtaskError> {
        Git::from_dir(dir)
    }
}

impl ChangeTracker for GitChangeTracker {
    fn baseline(&self, dir: &Path) -> Result<String, GwtaskError> {
        Self::git(dir)?.head_commit(dir)
    }

    fn changed_files_since(&self, dir: &Path, baseline: &str) -> Result<Vec<String>, GwtaskError> {
        let git = Self::git(dir)?;
        let diff = git.run_in_dir(dir, &["diff", "--name-only", baseline])?;
        let untracked = git.run_in_dir(dir, &["ls-files", "--others", "--exclude-standard"])?;

        let mut files: Vec<String> = diff
            .lines()
            .chain(untracked.lines())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn commit_all(&self, dir: &Path, message: &str) -> Result<(), GwtaskError> {
        let git = Self::git(dir)?;
        let _ = git.run_in_dir(dir, &["add", "-A"])?;
        let staged = git.run_in_dir(dir, &["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            tracing::debug!(dir = %dir.display(), "nothing to commit");
            return Ok(());
        }
        let _ = git.run_in_dir(dir, &["commit", "-m", message])?;
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut it| it.next().is_none())
}

/// Applies the configured replacements, then strips anything a path cannot hold.
#[must_use]
pub fn sanitize_name(name: &str, sanitize: &BTreeMap<String, String>) -> String {
    let mut s = name.to_owned();
    for (from, to) in sanitize {
        s = s.replace(from.as_str(), to);
    }
    sanitize_for_filesystem(&s)
}

fn sanitize_for_filesystem(input: &str) -> String {
    let out: String = input
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect();
    match out.as_str() {
        "" | "." | ".." => "_".to_owned(),
        _ => out,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PorcelainEntry {
    path: String,
    branch: String,
    head: String,
}

fn parse_worktree_porcelain(out: &str) -> Vec<PorcelainEntry> {
    let mut entries: Vec<PorcelainEntry> = Vec::new();
    let mut cur: Option<PorcelainEntry> = None;

    for line in out.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(cur.take());
            cur = Some(PorcelainEntry {
                path: path.to_owned(),
                branch: String::new(),
                head: String::new(),
            });
        } else if let Some(entry) = cur.as_mut() {
            if let Some(branch) = line.strip_prefix("branch ") {
                branch
                    .trim()
                    .trim_start_matches("refs/heads/")
                    .clone_into(&mut entry.branch);
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                head.trim().clone_into(&mut entry.head);
            }
        }
    }
    entries.extend(cur);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_list_porcelain() {
        let out = r#"worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.worktrees/feature
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature/test

worktree /repo/.worktrees/detached
HEAD 3333333333333333333333333333333333333333
detached
"#;

        let entries = parse_worktree_porcelain(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            PorcelainEntry {
                path: "/repo".to_owned(),
                branch: "main".to_owned(),
                head: "1111111111111111111111111111111111111111".to_owned(),
            }
        );
        assert_eq!(entries[1].branch, "feature/test");
        assert_eq!(entries[2].branch, "");
    }

    #[test]
    fn sanitizes_worktree_names() {
        let cfg = WorktreeConfig::default();
        assert_eq!(sanitize_name("feature/auth login", &cfg.sanitize), "feature-auth-login");
        assert_eq!(sanitize_name("fix:bug\\x", &cfg.sanitize), "fix-bug-x");
        assert_eq!(sanitize_name("..", &BTreeMap::new()), "_");
    }
}
