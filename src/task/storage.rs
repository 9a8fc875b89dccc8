#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use uuid::Uuid;

use crate::error::GwtaskError;
use crate::task::model::Task;

/// One JSON file per task under the queue directory.
///
/// Writes go through a unique temp file and a rename, so readers never see a
/// partial record. Saves of the same ID are serialized; saves of different IDs
/// only contend on the brief lookup of their per-ID lock.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TaskStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create task queue dir {}", self.dir.display()))
    }

    pub fn save(&self, task: &Task) -> anyhow::Result<()> {
        let path = self.task_path(&task.id)?;
        self.ensure_dir()?;
        let data = serde_json::to_vec_pretty(task)?;

        let lock = self.lock_for(&task.id);
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("task lock for {} poisoned", task.id))?;

        let tmp = self
            .dir
            .join(format!(".task-{}.{}.tmp", task.id, Uuid::new_v4().simple()));
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("failed to rename {} -> {}", tmp.display(), path.display())
            });
        }
        Ok(())
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Task> {
        let path = self.task_path(id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GwtaskError::TaskNotFound(id.to_owned()).into());
            }
            Err(e) => {
                return Err(GwtaskError::IoPath { path, source: e }.into());
            }
        };
        let task: Task = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(task)
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.task_path(id).is_ok_and(|p| p.exists())
    }

    /// Every readable task, highest priority first then oldest first.
    pub fn list_all(&self) -> anyhow::Result<Vec<Task>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks: Vec<Task> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|n| n.starts_with("task-") && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                    continue;
                }
            };
            match serde_json::from_slice::<Task>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed task record");
                }
            }
        }
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_owned()).or_default())
    }

    fn task_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        validate_task_id(id)?;
        Ok(self.dir.join(format!("task-{id}.json")))
    }
}

pub fn validate_task_id(id: &str) -> Result<(), GwtaskError> {
    if id.trim().is_empty() {
        return Err(GwtaskError::Validation("task ID is required".to_owned()));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(GwtaskError::Validation(format!(
            "invalid task ID '{id}': must not contain path separators"
        )));
    }
    if id.contains("..") {
        return Err(GwtaskError::Validation(format!(
            "invalid task ID '{id}': must not contain '..'"
        )));
    }
    Ok(())
}
