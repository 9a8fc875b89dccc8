#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Command;

use gwtask::config::WorktreeConfig;
use gwtask::core::worktree::{
    ChangeTracker, GitChangeTracker, GitWorktreeProvider, WorktreeProvider,
};
use gwtask::error::GwtaskError;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn init_repo(root: &Path) -> std::path::PathBuf {
    let repo = root.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir repo");
    run(&repo, &["init"]);
    run(&repo, &["config", "user.email", "test@example.com"]);
    run(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    run(&repo, &["add", "."]);
    run(&repo, &["commit", "-m", "init"]);
    repo
}

fn provider(root: &Path, auto_create: bool) -> GitWorktreeProvider {
    GitWorktreeProvider::new(&WorktreeConfig {
        base_dir: root.join("worktrees").to_string_lossy().to_string(),
        auto_create,
        ..WorktreeConfig::default()
    })
}

#[test]
fn creates_then_reuses_a_worktree() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = init_repo(td.path());
    let provider = provider(td.path(), true);

    let created = provider
        .resolve_or_create(&repo, "feature/test", None)
        .expect("create worktree");
    assert!(created.ends_with("repo/feature-test"));
    assert!(created.join("README.md").exists());

    let reused = provider
        .resolve_or_create(&repo, "feature/test", None)
        .expect("reuse worktree");
    assert_eq!(
        reused.canonicalize().unwrap(),
        created.canonicalize().unwrap()
    );
}

#[test]
fn missing_worktree_without_auto_create_is_unavailable() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = init_repo(td.path());

    let err = provider(td.path(), false)
        .resolve_or_create(&repo, "feature/nope", None)
        .unwrap_err();
    assert!(matches!(err, GwtaskError::WorktreeUnavailable { .. }));
}

#[test]
fn tracks_and_commits_agent_changes() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = init_repo(td.path());
    let dir = provider(td.path(), true)
        .resolve_or_create(&repo, "agent/work", None)
        .expect("create worktree");

    let tracker = GitChangeTracker;
    let baseline = tracker.baseline(&dir).expect("baseline");
    assert!(tracker.changed_files_since(&dir, &baseline).unwrap().is_empty());

    std::fs::write(dir.join("README.md"), "hello again\n").expect("write");
    std::fs::write(dir.join("notes.txt"), "todo\n").expect("write");
    assert_eq!(
        tracker.changed_files_since(&dir, &baseline).unwrap(),
        vec!["README.md".to_owned(), "notes.txt".to_owned()]
    );

    tracker.commit_all(&dir, "agent changes").expect("commit");
    let log = Command::new("git")
        .args(["log", "-1", "--format=%s"])
        .current_dir(&dir)
        .output()
        .expect("git log");
    assert_eq!(String::from_utf8_lossy(&log.stdout).trim(), "agent changes");
    // Nothing left to commit is not an error.
    tracker.commit_all(&dir, "empty").expect("no-op commit");
}

fn run(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
