#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::task::model::Runner;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// One execution of one task, keyed by its session name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub session_id: String,
    pub task_id: String,
    pub task_name: String,
    pub runner: Runner,
    #[serde(default)]
    pub prompt: String,
    pub working_directory: String,
    /// Commit the worktree was at when the session started.
    #[serde(default)]
    pub baseline: Option<String>,
    pub status: ExecutionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        self.status = status;
        self.end_time = Some(OffsetDateTime::now_utc());
        self.exit_code = exit_code;
        self.error = error;
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    base: PathBuf,
}

impl ExecutionLog {
    #[must_use]
    pub fn new(queue_dir: &Path) -> Self {
        Self {
            base: queue_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.log_dir().join("metadata")
    }

    #[must_use]
    pub fn output_path(&self, session_id: &str) -> PathBuf {
        self.log_dir().join(format!("{session_id}.log"))
    }

    #[must_use]
    pub fn record_path(&self, session_id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{session_id}.json"))
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        let dir = self.metadata_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))
    }

    pub fn save(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.ensure_dirs()?;
        let path = self.record_path(&record.session_id);
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &data)
    }

    pub fn save_output(&self, session_id: &str, output: &str) -> anyhow::Result<()> {
        self.ensure_dirs()?;
        write_atomic(&self.output_path(session_id), output.as_bytes())
    }

    pub fn load(&self, session_id: &str) -> anyhow::Result<ExecutionRecord> {
        let path = self.record_path(session_id);
        let data =
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// All readable records, newest first.
    pub fn list(&self) -> anyhow::Result<Vec<ExecutionRecord>> {
        let dir = self.metadata_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records: Vec<ExecutionRecord> = Vec::new();
        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice(&data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable execution record"),
            }
        }

        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }

    pub fn read_output(&self, session_id: &str) -> anyhow::Result<String> {
        let path = self.output_path(session_id);
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    pub fn delete(&self, session_id: &str) {
        let _ = std::fs::remove_file(self.output_path(session_id));
        let _ = std::fs::remove_file(self.record_path(session_id));
    }

    /// Removes finished records started more than `days` ago. Returns how many went.
    pub fn prune_older_than(&self, days: u64) -> anyhow::Result<usize> {
        const MAX_DAYS: i64 = i64::MAX / 86_400;
        let days = i64::try_from(days).unwrap_or(MAX_DAYS).min(MAX_DAYS);
        let cutoff = OffsetDateTime::now_utc()
            .checked_sub(time::Duration::days(days))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        let mut removed = 0;
        for record in self.list()? {
            if record.status == ExecutionStatus::Running || record.start_time >= cutoff {
                continue;
            }
            self.delete(&record.session_id);
            removed += 1;
        }
        Ok(removed)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, started: OffsetDateTime, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            session_id: session.to_owned(),
            task_id: session.trim_start_matches("gwtask-").to_owned(),
            task_name: "demo".to_owned(),
            runner: Runner::Claude,
            prompt: "do it".to_owned(),
            working_directory: "/tmp/wt".to_owned(),
            baseline: None,
            status,
            start_time: started,
            end_time: None,
            exit_code: None,
            error: None,
        }
    }

    #[test]
    fn saves_lists_newest_first_and_keeps_output() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = ExecutionLog::new(td.path());
        let now = OffsetDateTime::now_utc();

        let mut older = record("gwtask-a", now - time::Duration::hours(2), ExecutionStatus::Running);
        older.finish(ExecutionStatus::Completed, Some(0), None);
        log.save(&older).unwrap();
        log.save(&record("gwtask-b", now, ExecutionStatus::Running)).unwrap();
        log.save_output("gwtask-a", "line 1\nline 2").unwrap();

        let listed = log.list().unwrap();
        assert_eq!(
            listed.iter().map(|r| r.session_id.as_str()).collect::<Vec<_>>(),
            vec!["gwtask-b", "gwtask-a"]
        );
        assert_eq!(log.load("gwtask-a").unwrap(), older);
        assert_eq!(log.read_output("gwtask-a").unwrap(), "line 1\nline 2");
    }

    #[test]
    fn prune_keeps_recent_and_running_records() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = ExecutionLog::new(td.path());
        let long_ago = OffsetDateTime::now_utc() - time::Duration::days(40);

        log.save(&record("gwtask-old", long_ago, ExecutionStatus::Failed)).unwrap();
        log.save_output("gwtask-old", "bye").unwrap();
        log.save(&record("gwtask-live", long_ago, ExecutionStatus::Running)).unwrap();
        log.save(&record("gwtask-new", OffsetDateTime::now_utc(), ExecutionStatus::Completed))
            .unwrap();

        assert_eq!(log.prune_older_than(30).unwrap(), 1);
        let left: Vec<String> = log.list().unwrap().into_iter().map(|r| r.session_id).collect();
        assert_eq!(left, vec!["gwtask-new".to_owned(), "gwtask-live".to_owned()]);
        assert!(!log.output_path("gwtask-old").exists());
    }
}
