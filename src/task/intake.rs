#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::GwtaskError;
use crate::task::graph::DependencyGraph;
use crate::task::model::{DEFAULT_CATEGORY, DEFAULT_PRIORITY, Runner, Task};
use crate::task::storage::{TaskStore, validate_task_id};

pub const BATCH_FILE_VERSION: &str = "1.0";

/// A request to queue one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRequest {
    /// Generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub worktree: String,
    pub repository: Option<String>,
    pub base_branch: Option<String>,
    pub priority: u8,
    pub depends_on: Vec<String>,
    pub prompt: String,
    pub files: Vec<String>,
    pub verify: Vec<String>,
    pub auto_commit: bool,
    pub category: Option<String>,
    pub runner: Runner,
}

impl TaskRequest {
    #[must_use]
    pub fn new(name: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worktree: worktree.into(),
            priority: DEFAULT_PRIORITY,
            ..Self::default()
        }
    }

    /// Checks the request and turns it into a fresh task record.
    pub fn into_task(self, now: OffsetDateTime) -> Result<Task, GwtaskError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(GwtaskError::Validation("task name is required".to_owned()));
        }
        let worktree = self.worktree.trim();
        if worktree.is_empty() {
            return Err(GwtaskError::Validation("worktree must be specified".to_owned()));
        }
        if !(1..=100).contains(&self.priority) {
            return Err(GwtaskError::Validation(format!(
                "priority must be between 1 and 100, got {}",
                self.priority
            )));
        }
        let id = self.id.unwrap_or_else(Task::new_id);
        validate_task_id(&id)?;
        for dep in &self.depends_on {
            validate_task_id(dep)?;
        }

        let mut task = Task::new(id, name, worktree);
        task.runner = self.runner;
        task.prompt = self.prompt;
        task.files = self.files;
        task.verify = self.verify;
        task.auto_commit = self.auto_commit;
        task.repository = non_empty(self.repository);
        task.base_branch = non_empty(self.base_branch);
        task.priority = self.priority;
        task.status = Task::initial_status(&self.depends_on);
        task.depends_on = self.depends_on;
        task.category = non_empty(self.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_owned());
        task.created_at = now;
        Ok(task)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

/// The YAML batch format.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    pub version: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub default_config: Option<BatchConfig>,
    pub tasks: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub auto_commit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repository: String,
    pub worktree: String,
    #[serde(default)]
    pub base_branch: String,
    /// Unset means the default priority.
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub files_to_focus: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub runner: Option<Runner>,
    #[serde(default)]
    pub config: Option<BatchConfig>,
}

impl BatchFile {
    pub fn parse(data: &str) -> Result<Self, GwtaskError> {
        let file: BatchFile = serde_yaml::from_str(data)
            .map_err(|e| GwtaskError::Validation(format!("malformed task file: {e}")))?;
        if file.version.trim() != BATCH_FILE_VERSION {
            return Err(GwtaskError::Validation(format!(
                "unsupported task file version: {} (expected {BATCH_FILE_VERSION})",
                file.version
            )));
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read task file: {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("invalid task file: {}", path.display()))
    }

    /// Expands entries into requests. `runner` and `repository` fill in what
    /// the file leaves unset.
    pub fn into_requests(
        self,
        runner: Runner,
        repository: Option<&str>,
    ) -> Result<Vec<TaskRequest>, GwtaskError> {
        let file_repo = non_empty(Some(self.repository)).or_else(|| repository.map(str::to_owned));
        let default_auto_commit = self.default_config.as_ref().is_some_and(|c| c.auto_commit);

        let mut seen = HashSet::new();
        let mut requests = Vec::with_capacity(self.tasks.len());
        for entry in self.tasks {
            let id = entry.id.trim().to_owned();
            if id.is_empty() {
                return Err(GwtaskError::Validation("task ID is required".to_owned()));
            }
            if !seen.insert(id.clone()) {
                return Err(GwtaskError::Validation(format!(
                    "duplicate task ID in file: {id}"
                )));
            }
            let name = if entry.name.trim().is_empty() {
                id.clone()
            } else {
                entry.name
            };
            requests.push(TaskRequest {
                id: Some(id),
                name,
                worktree: entry.worktree,
                repository: non_empty(Some(entry.repository)).or_else(|| file_repo.clone()),
                base_branch: Some(entry.base_branch),
                priority: entry.priority.unwrap_or(DEFAULT_PRIORITY),
                depends_on: entry.depends_on,
                prompt: entry.prompt,
                files: entry.files_to_focus,
                verify: entry.verification_commands,
                auto_commit: entry
                    .config
                    .as_ref()
                    .map_or(default_auto_commit, |c| c.auto_commit),
                category: Some(entry.category),
                runner: entry.runner.unwrap_or(runner),
            });
        }
        Ok(requests)
    }
}

/// Validates and stores one task.
pub fn create_task(store: &TaskStore, max_depth: usize, request: TaskRequest) -> anyhow::Result<Task> {
    let mut created = create_batch(store, max_depth, vec![request])?;
    created
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no task was created"))
}

/// Validates every request against the stored queue, then stores them all.
///
/// Nothing is written unless every request passes, including the cycle and
/// depth checks against the tasks already queued.
pub fn create_batch(
    store: &TaskStore,
    max_depth: usize,
    requests: Vec<TaskRequest>,
) -> anyhow::Result<Vec<Task>> {
    let now = OffsetDateTime::now_utc();
    let mut tasks = Vec::with_capacity(requests.len());
    let mut seen = HashSet::new();
    for request in requests {
        let task = request.into_task(now)?;
        if !seen.insert(task.id.clone()) {
            return Err(GwtaskError::Validation(format!("duplicate task ID: {}", task.id)).into());
        }
        if store.exists(&task.id) {
            return Err(
                GwtaskError::Validation(format!("task ID already exists: {}", task.id)).into(),
            );
        }
        tasks.push(task);
    }

    let mut graph = DependencyGraph::new(max_depth, crate::task::graph::DEFAULT_PRIORITY_BOOST_AFTER);
    let mut existing = store.list_all()?;
    existing.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    for task in existing {
        let id = task.id.clone();
        if let Err(e) = graph.add_task(task) {
            tracing::warn!(task_id = %id, error = %e, "ignoring stored task in dependency check");
        }
    }
    for task in &mut tasks {
        graph.add_task(task.clone())?;
        // The graph knows whether the dependencies are already complete.
        if let Some(normalized) = graph.get(&task.id) {
            task.status = normalized.status;
        }
    }

    store.ensure_dir()?;
    for task in &tasks {
        store.save(task)?;
        tracing::info!(task_id = %task.id, name = %task.name, status = %task.status, "task queued");
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskStatus;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let td = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::new(td.path().join("tasks"));
        (td, store)
    }

    fn request(id: &str, deps: &[&str]) -> TaskRequest {
        TaskRequest {
            id: Some(id.to_owned()),
            depends_on: deps.iter().map(|d| (*d).to_owned()).collect(),
            ..TaskRequest::new(format!("task {id}"), format!("wt-{id}"))
        }
    }

    #[test]
    fn rejects_invalid_requests_before_storing() {
        let (_td, store) = store();

        let mut r = request("a", &[]);
        r.priority = 0;
        assert!(create_task(&store, 5, r).is_err());

        let mut r = request("a", &[]);
        r.priority = 101;
        assert!(create_task(&store, 5, r).is_err());

        let mut r = request("a", &[]);
        r.name = "  ".to_owned();
        assert!(create_task(&store, 5, r).is_err());

        let mut r = request("a", &[]);
        r.worktree = String::new();
        assert!(create_task(&store, 5, r).is_err());

        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn sets_initial_status_from_dependencies() {
        let (_td, store) = store();
        let a = create_task(&store, 5, request("a", &[])).unwrap();
        let b = create_task(&store, 5, request("b", &["a"])).unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(b.status, TaskStatus::Waiting);
        assert_eq!(store.load("b").unwrap().status, TaskStatus::Waiting);
    }

    #[test]
    fn rejects_existing_ids_and_cycles_against_the_queue() {
        let (_td, store) = store();
        create_task(&store, 5, request("a", &["b"])).unwrap();

        assert!(create_task(&store, 5, request("a", &[])).is_err());

        let err = create_task(&store, 5, request("b", &["a"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GwtaskError>(),
            Some(GwtaskError::CycleDetected { .. })
        ));
        assert!(!store.exists("b"));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (_td, store) = store();
        let err = create_batch(
            &store,
            2,
            vec![request("a", &[]), request("b", &["a"]), request("c", &["b"]), request("d", &["c"])],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GwtaskError>(),
            Some(GwtaskError::DepthExceeded { .. })
        ));
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn parses_batch_files() {
        let yaml = r#"
version: "1.0"
repository: /src/app
default_config:
  auto_commit: true
tasks:
  - id: schema
    name: Add schema
    worktree: feature/schema
    priority: 80
    prompt: Create the tables.
    files_to_focus: [db/schema.sql]
    verification_commands: ["make test"]
  - id: api
    worktree: feature/api
    depends_on: [schema]
    config:
      auto_commit: false
"#;
        let file = BatchFile::parse(yaml).unwrap();
        let requests = file.into_requests(Runner::Codex, None).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].priority, 80);
        assert!(requests[0].auto_commit);
        assert_eq!(requests[0].repository.as_deref(), Some("/src/app"));
        assert_eq!(requests[0].runner, Runner::Codex);
        assert_eq!(requests[1].name, "api");
        assert_eq!(requests[1].priority, DEFAULT_PRIORITY);
        assert!(!requests[1].auto_commit);

        let (_td, store) = store();
        let created = create_batch(&store, 5, requests).unwrap();
        assert_eq!(created[0].files, vec!["db/schema.sql".to_owned()]);
        assert_eq!(created[1].status, TaskStatus::Waiting);
        assert_eq!(created[1].base_branch, None);
    }

    #[test]
    fn rejects_bad_batch_files() {
        assert!(BatchFile::parse("version: \"2.0\"\ntasks: []\n").is_err());
        assert!(BatchFile::parse("tasks: [").is_err());

        let dup = "version: \"1.0\"\ntasks:\n  - {id: a, worktree: w}\n  - {id: a, worktree: w}\n";
        let file = BatchFile::parse(dup).unwrap();
        assert!(file.into_requests(Runner::Claude, None).is_err());
    }

    #[test]
    fn explicit_zero_priority_in_batch_is_rejected() {
        let yaml = "version: \"1.0\"\ntasks:\n  - {id: a, worktree: w, priority: 0}\n  - {id: b, worktree: w}\n";
        let requests = BatchFile::parse(yaml)
            .unwrap()
            .into_requests(Runner::Claude, Some("/src/app"))
            .unwrap();
        assert_eq!(requests[0].priority, 0);
        assert_eq!(requests[1].priority, DEFAULT_PRIORITY);

        let (_td, store) = store();
        let err = create_batch(&store, 5, requests).unwrap_err();
        assert!(format!("{err:#}").contains("priority must be between 1 and 100"));
        assert!(store.list_all().unwrap().is_empty());
    }
}
