#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::core::git::Git;
use crate::core::worktree::{GitChangeTracker, GitWorktreeProvider};
use crate::mux::{self, SessionHandle};
use crate::output::table::Table;
use crate::task::execution::{EngineConfig, ExecutionEngine};
use crate::task::history::{ExecutionLog, ExecutionRecord};
use crate::task::intake::{self, BatchFile, TaskRequest};
use crate::task::model::{DEFAULT_PRIORITY, Runner, Task, TaskStatus};
use crate::task::query;
use crate::task::storage::TaskStore;
use crate::task::worker::{self, Worker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "gwtask",
    version,
    about = "Queue AI coding tasks across git worktrees and run them in tmux or zellij"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Task(TaskArgs),
    Worker(WorkerArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Add(TaskAddArgs),
    List(TaskListArgs),
    Show(TaskShowArgs),
    Attach(TaskShowArgs),
    Logs(TaskLogsArgs),
}

#[derive(Debug, Parser)]
pub struct TaskAddArgs {
    /// Task NAME
    pub name: Option<String>,

    #[arg(short = 'w', long = "worktree")]
    pub worktree: Option<String>,
    /// Repository the worktree belongs to (defaults to the current one)
    #[arg(long = "repo")]
    pub repo: Option<String>,
    /// Start point for a new worktree branch
    #[arg(long = "base")]
    pub base: Option<String>,
    #[arg(short = 'p', long = "priority", default_value_t = DEFAULT_PRIORITY)]
    pub priority: u8,
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
    #[arg(long = "prompt", default_value = "")]
    pub prompt: String,
    #[arg(long = "files")]
    pub files: Vec<String>,
    #[arg(long = "verify")]
    pub verify: Vec<String>,
    #[arg(long = "auto-commit")]
    pub auto_commit: bool,
    #[arg(long = "category")]
    pub category: Option<String>,
    /// claude or codex (defaults to tasks.runner)
    #[arg(long = "runner")]
    pub runner: Option<String>,
    /// Add every task from a YAML batch file
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct TaskListArgs {
    #[arg(long = "filter")]
    pub filter: Option<String>,
    #[arg(long = "priority-min", default_value_t = 0)]
    pub priority_min: u8,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json", conflicts_with = "csv")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskShowArgs {
    pub pattern: String,
}

#[derive(Debug, Parser)]
pub struct TaskLogsArgs {
    pub pattern: Option<String>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub cmd: WorkerCmd,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCmd {
    Start(WorkerStartArgs),
    Stop(WorkerStopArgs),
    Status(WorkerStatusArgs),
}

#[derive(Debug, Parser)]
pub struct WorkerStartArgs {
    /// Maximum tasks running at once (defaults to tasks.max_parallel)
    #[arg(long = "parallel")]
    pub parallel: Option<usize>,
}

#[derive(Debug, Parser)]
pub struct WorkerStopArgs {
    #[arg(long = "timeout", default_value = "5m")]
    pub timeout: String,
}

#[derive(Debug, Parser)]
pub struct WorkerStatusArgs {
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json")]
    pub json: bool,
}

pub async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("GWTASK_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Config(args) => cmd_config(args),
        Commands::Task(args) => cmd_task(args).await,
        Commands::Worker(args) => cmd_worker(args).await,
    }
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => print!("{}", config::list_resolved_toml()?),
        ConfigCmd::Set(set) => {
            config::set_value_string(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'gwtask config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn load_cfg() -> anyhow::Result<Config> {
    tokio::task::spawn_blocking(|| config::load().map(|(cfg, _paths)| cfg))
        .await
        .context("config loader panicked")?
}

fn queue_dir(cfg: &Config) -> anyhow::Result<PathBuf> {
    config::expand_path(&cfg.tasks.queue_dir)
}

async fn cmd_task(args: TaskArgs) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg().await?;
    let queue_dir = queue_dir(&cfg)?;
    let store = TaskStore::new(queue_dir.clone());

    match args.cmd {
        TaskCmd::Add(a) => task_add(&cfg, &store, a)?,
        TaskCmd::List(a) => task_list(&store, &a)?,
        TaskCmd::Show(a) => print_task_details(&query::find_by_pattern(&store, &a.pattern)?),
        TaskCmd::Attach(a) => task_attach(&cfg, &store, &a.pattern).await?,
        TaskCmd::Logs(a) => task_logs(&store, &ExecutionLog::new(&queue_dir), &a)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn task_add(cfg: &Config, store: &TaskStore, args: TaskAddArgs) -> anyhow::Result<()> {
    let runner: Runner = args
        .runner
        .as_deref()
        .unwrap_or(&cfg.tasks.runner)
        .parse()?;
    let max_depth = cfg.tasks.max_dependency_depth;

    if let Some(file) = args.file.as_deref() {
        let batch = BatchFile::load(file)?;
        let default_repo = match args.repo.as_deref() {
            Some(r) => Some(resolve_repository_root(r)?),
            None if batch.repository.trim().is_empty() => resolve_repository_root("").ok(),
            None => Some(resolve_repository_root(batch.repository.trim())?),
        };
        let requests = batch.into_requests(runner, default_repo.as_deref())?;
        let created = intake::create_batch(store, max_depth, requests)?;
        for task in &created {
            print_created(task);
            println!();
        }
        println!(
            "Successfully added {} tasks from {}",
            created.len(),
            file.display()
        );
        return Ok(());
    }

    let name = args.name.unwrap_or_default();
    if name.trim().is_empty() {
        anyhow::bail!("task name is required when not using --file flag");
    }
    let request = TaskRequest {
        id: None,
        name,
        worktree: args.worktree.unwrap_or_default(),
        repository: Some(resolve_repository_root(args.repo.as_deref().unwrap_or(""))?),
        base_branch: args.base,
        priority: args.priority,
        depends_on: args.depends_on,
        prompt: args.prompt,
        files: args.files,
        verify: args.verify,
        auto_commit: args.auto_commit,
        category: args.category,
        runner,
    };
    let task = intake::create_task(store, max_depth, request)?;
    print_created(&task);
    Ok(())
}

fn print_created(task: &Task) {
    println!(
        "Task '{}' added successfully (ID: {})",
        task.display_name(),
        task.id
    );
    if let Some(repo) = task.repository.as_deref() {
        println!("  Repository: {repo}");
    }
    println!(
        "  Worktree: {}, Priority: {}, Status: {}",
        task.worktree, task.priority, task.status
    );
    if !task.depends_on.is_empty() {
        println!("  Dependencies: {}", task.depends_on.join(", "));
    }
}

fn task_list(store: &TaskStore, args: &TaskListArgs) -> anyhow::Result<()> {
    let mut tasks = query::list_all(store)?;
    if let Some(filter) = args.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        tasks = query::filter_by_status(&tasks, filter)?;
    }
    if args.priority_min > 0 {
        tasks = query::filter_by_min_priority(&tasks, args.priority_min);
    }

    if args.json {
        return print_json(&tasks);
    }

    if args.csv {
        let mut t = Table::new([
            "task_id",
            "name",
            "worktree",
            "status",
            "priority",
            "category",
            "dependencies",
            "duration",
        ]);
        for task in &tasks {
            t.row([
                task.id.clone(),
                task.name.clone(),
                task.worktree.clone(),
                task.status.to_string(),
                task.priority.to_string(),
                task.category.clone(),
                task.depends_on.join(" "),
                task_duration_string(task),
            ]);
        }
        t.write_csv()?;
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let mut headers = vec!["TASK", "NAME", "WORKTREE", "STATUS", "PRIORITY", "DEPS", "DURATION"];
    if args.verbose {
        headers.extend(["CATEGORY", "SESSION", "PROMPT"]);
    }
    let mut t = Table::new(headers)
        .align_right("PRIORITY")
        .align_right("DURATION");
    for task in &tasks {
        let mut row = vec![
            format!("{} {}", task_status_icon(task.status), task.id),
            truncate(task.display_name(), 40),
            task.worktree.clone(),
            task.status.to_string(),
            task.priority.to_string(),
            if task.depends_on.is_empty() {
                "-".to_owned()
            } else {
                task.depends_on.join(",")
            },
            task_duration_string(task),
        ];
        if args.verbose {
            row.push(task.category.clone());
            row.push(task.session_id.clone().unwrap_or_else(|| "-".to_owned()));
            row.push(if task.prompt.trim().is_empty() {
                "-".to_owned()
            } else {
                truncate(&task.prompt, 60)
            });
        }
        t.row(row);
    }
    t.print()?;
    Ok(())
}

fn print_task_details(task: &Task) {
    println!("Task: {} (ID: {})", task.display_name(), task.id);
    println!("Status: {}", task.status);
    println!("Priority: {}", task.priority);
    println!("Category: {}", task.category);
    println!("Runner: {}", task.runner.as_str());
    if let Some(repo) = task.repository.as_deref() {
        println!("Repository: {repo}");
    }
    println!("Worktree: {}", task.worktree);
    if let Some(base) = task.base_branch.as_deref() {
        println!("Base branch: {base}");
    }
    println!("Created: {}", format_time(task.created_at));
    if let Some(started) = task.started_at {
        println!("Started: {}", format_time(started));
    }
    if let Some(done) = task.completed_at {
        println!("Completed: {}", format_time(done));
    }
    if let Some(session) = task.session_id.as_deref() {
        println!("Session: {session}");
    }
    if !task.depends_on.is_empty() {
        println!("Dependencies: {}", task.depends_on.join(", "));
    }

    if !task.prompt.trim().is_empty() {
        println!("\nPrompt:\n{}", task.prompt);
    }
    if !task.files.is_empty() {
        println!("\nFiles:");
        for f in &task.files {
            println!("- {f}");
        }
    }
    if !task.verify.is_empty() {
        println!("\nVerification Commands:");
        for cmd in &task.verify {
            println!("- {cmd}");
        }
    }

    if let Some(result) = task.result.as_ref() {
        println!("\nResult:");
        println!("  Exit code: {}", result.exit_code);
        println!("  Duration: {}", format_std_duration(result.duration()));
        if !result.files_changed.is_empty() {
            println!("  Files changed:");
            for f in &result.files_changed {
                println!("    {f}");
            }
        }
        if let Some(err) = result.error.as_deref() {
            println!("  Error: {err}");
        }
    }
}

async fn task_attach(cfg: &Config, store: &TaskStore, pattern: &str) -> anyhow::Result<()> {
    let task = query::find_by_pattern(store, pattern)?;
    let Some(session) = task.session_id.clone() else {
        anyhow::bail!("task {} has not started yet (status {})", task.id, task.status);
    };
    let backend = mux::backend_from_config(&cfg.mux, &cfg.tasks.shell);
    let handle = SessionHandle(session);
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        if !backend.session_exists(&handle)? {
            anyhow::bail!("session {handle} no longer exists");
        }
        backend.attach(&handle)?;
        Ok(())
    })
    .await
    .context("attach panicked")?
}

fn task_logs(store: &TaskStore, log: &ExecutionLog, args: &TaskLogsArgs) -> anyhow::Result<()> {
    let Some(pattern) = args.pattern.as_deref() else {
        let records = log.list()?;
        if args.json {
            return print_json(&records);
        }
        if records.is_empty() {
            println!("No executions found.");
            return Ok(());
        }
        let mut t = Table::new(["SESSION", "TASK", "STATUS", "STARTED", "EXIT"]).align_right("EXIT");
        for r in &records {
            t.row([
                r.session_id.clone(),
                truncate(&r.task_name, 40),
                r.status.as_str().to_owned(),
                format_time(r.start_time),
                r.exit_code.map_or_else(|| "-".to_owned(), |c| c.to_string()),
            ]);
        }
        t.print()?;
        return Ok(());
    };

    let task = query::find_by_pattern(store, pattern)?;
    let Some(session) = task.session_id.as_deref() else {
        anyhow::bail!("task {} has not run yet", task.id);
    };
    let record = log.load(session)?;
    if args.json {
        return print_json(&record);
    }
    print_execution(&record);
    match log.read_output(session) {
        Ok(output) => println!("\nOutput:\n{output}"),
        Err(_) => println!("\nNo captured output."),
    }
    Ok(())
}

fn print_execution(r: &ExecutionRecord) {
    println!("Session: {}", r.session_id);
    println!("Task: {} (ID: {})", r.task_name, r.task_id);
    println!("Runner: {}", r.runner.as_str());
    println!("Working directory: {}", r.working_directory);
    println!("Status: {}", r.status.as_str());
    println!("Started: {}", format_time(r.start_time));
    if let Some(end) = r.end_time {
        println!("Ended: {}", format_time(end));
    }
    if let Some(code) = r.exit_code {
        println!("Exit code: {code}");
    }
    if let Some(err) = r.error.as_deref() {
        println!("Error: {err}");
    }
}

async fn cmd_worker(args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg().await?;
    let queue_dir = queue_dir(&cfg)?;

    match args.cmd {
        WorkerCmd::Start(start) => worker_start(&cfg, start).await?,
        WorkerCmd::Stop(stop) => worker_stop(&queue_dir, &stop).await?,
        WorkerCmd::Status(status) => worker_status(&queue_dir, &status)?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn worker_start(cfg: &Config, args: WorkerStartArgs) -> anyhow::Result<()> {
    let wcfg = WorkerConfig::from_config(cfg, args.parallel)?;
    let engine = ExecutionEngine::new(
        mux::backend_from_config(&cfg.mux, &cfg.tasks.shell),
        Arc::new(GitWorktreeProvider::new(&cfg.worktree)),
        Arc::new(GitChangeTracker),
        ExecutionLog::new(&wcfg.queue_dir),
        EngineConfig::from_config(cfg)?,
    );

    println!("Starting worker (max parallel: {})", wcfg.max_parallel);
    let store = TaskStore::new(wcfg.queue_dir.clone());
    let worker = Worker::new(store, Arc::new(engine), wcfg);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
        }
        on_signal.cancel();
    });

    worker.run(shutdown).await?;
    println!("Worker stopped.");
    Ok(())
}

async fn worker_stop(queue_dir: &Path, args: &WorkerStopArgs) -> anyhow::Result<()> {
    let timeout = config::parse_duration(&args.timeout)?;

    if worker::load_worker_lock(queue_dir)?.is_none() {
        println!("No worker running.");
        return Ok(());
    }

    if worker::request_stop(queue_dir, timeout).await? {
        println!("Worker stopped.");
        return Ok(());
    }
    anyhow::bail!("timed out waiting for worker to stop (timeout: {timeout:?})")
}

fn worker_status(queue_dir: &Path, args: &WorkerStatusArgs) -> anyhow::Result<()> {
    let tasks = TaskStore::new(queue_dir.to_path_buf()).list_all()?;
    let report = worker::worker_status(queue_dir, &tasks)?;

    if args.json {
        return print_json(&report);
    }

    println!("Worker running: {}", report.running);
    if let Some(pid) = report.pid {
        println!("PID: {pid}");
    }
    if let Some(started) = report.started_at {
        println!("Started: {}", format_time(started));
    }
    println!("Stop requested: {}", report.stop_requested);
    println!("Active sessions: {}", report.active_sessions.len());
    println!("Blocked by failed dependencies: {}", report.blocked);

    if args.verbose {
        println!("\nTask counts:");
        for (k, v) in &report.counts {
            println!("  {k}: {v}");
        }
        if !report.active_sessions.is_empty() {
            println!("\nSessions:");
            for s in &report.active_sessions {
                println!("  {s}");
            }
        }
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_repository_root(repo: &str) -> anyhow::Result<String> {
    let git = if repo.trim().is_empty() {
        Git::from_cwd()?
    } else {
        let p = config::expand_path(repo)?;
        Git::from_dir(&p).map_err(|_| anyhow::anyhow!("not a git repository: {repo}"))?
    };
    Ok(git.repo_root().to_string_lossy().to_string())
}

fn task_status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "○",
        TaskStatus::Waiting => "⏳",
        TaskStatus::Running => "●",
        TaskStatus::Completed => "✓",
        TaskStatus::Failed => "✗",
    }
}

fn task_duration_string(task: &Task) -> String {
    let Some(start) = task.started_at else {
        return "-".to_owned();
    };
    let end = task.completed_at.unwrap_or_else(OffsetDateTime::now_utc);
    if end < start {
        return "-".to_owned();
    }
    format_duration(end - start)
}

fn format_std_duration(d: std::time::Duration) -> String {
    time::Duration::try_from(d).map_or_else(|_| "-".to_owned(), format_duration)
}

fn format_duration(d: time::Duration) -> String {
    if d < time::Duration::minutes(1) {
        return format!("{}s", d.whole_seconds());
    }
    if d < time::Duration::hours(1) {
        return format!("{}m", d.whole_minutes());
    }
    let hours = d.whole_hours();
    let minutes = (d - time::Duration::hours(hours)).whole_minutes();
    format!("{hours}h {minutes}m")
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_owned())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_add_flags() {
        let cli = Cli::try_parse_from([
            "gwtask",
            "task",
            "add",
            "Fix login",
            "-w",
            "feature/login",
            "-p",
            "80",
            "--depends-on",
            "abc123",
            "--verify",
            "cargo test",
            "--auto-commit",
            "--runner",
            "codex",
        ])
        .unwrap();
        let Commands::Task(TaskArgs {
            cmd: TaskCmd::Add(add),
        }) = cli.cmd
        else {
            panic!("expected task add");
        };
        assert_eq!(add.name.as_deref(), Some("Fix login"));
        assert_eq!(add.priority, 80);
        assert_eq!(add.depends_on, vec!["abc123".to_owned()]);
        assert!(add.auto_commit);
        assert_eq!(add.runner.as_deref(), Some("codex"));
    }

    #[test]
    fn list_output_formats_are_exclusive() {
        assert!(Cli::try_parse_from(["gwtask", "task", "list", "--json", "--csv"]).is_err());
        assert!(Cli::try_parse_from(["gwtask", "worker", "start", "--parallel", "2"]).is_ok());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(time::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(time::Duration::minutes(5)), "5m");
        assert_eq!(format_duration(time::Duration::minutes(125)), "2h 5m");
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
