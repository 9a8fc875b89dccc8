#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::GwtaskError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub worktree: WorktreeConfig,
    pub mux: MuxConfig,
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    pub base_dir: String,
    pub auto_create: bool,
    pub sanitize: BTreeMap<String, String>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        let mut sanitize = BTreeMap::new();
        sanitize.insert("/".to_owned(), "-".to_owned());
        sanitize.insert(":".to_owned(), "-".to_owned());
        sanitize.insert(" ".to_owned(), "-".to_owned());
        Self {
            base_dir: "~/worktrees".to_owned(),
            auto_create: true,
            sanitize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MuxConfig {
    pub backend: MuxBackendKind,
    pub tmux_command: String,
    pub zellij_command: String,
    pub capture_lines: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            backend: MuxBackendKind::Tmux,
            tmux_command: "tmux".to_owned(),
            zellij_command: "zellij".to_owned(),
            capture_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MuxBackendKind {
    Tmux,
    Zellij,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TasksConfig {
    pub queue_dir: String,
    pub runner: String,
    pub claude_executable: String,
    pub codex_executable: String,
    pub max_parallel: usize,
    pub category_limits: BTreeMap<String, usize>,
    pub poll_interval: String,
    pub monitor_interval: String,
    pub probe_timeout: String,
    /// Consecutive failed monitoring rounds before a task is failed.
    pub max_probe_failures: u32,
    pub max_dependency_depth: usize,
    pub priority_boost_after: String,
    /// Empty means no limit.
    pub execution_timeout: String,
    pub kill_session_on_cancel: bool,
    pub kill_session_on_exit: bool,
    pub shutdown_grace: String,
    pub log_retention_days: u64,
    pub auto_cleanup: bool,
    pub shell: String,
}

impl Default for TasksConfig {
    fn default() -> Self {
        let mut category_limits = BTreeMap::new();
        category_limits.insert("development".to_owned(), 2);
        Self {
            queue_dir: "~/.config/gwtask/tasks".to_owned(),
            runner: "claude".to_owned(),
            claude_executable: "claude".to_owned(),
            codex_executable: "codex".to_owned(),
            max_parallel: 3,
            category_limits,
            poll_interval: "5s".to_owned(),
            monitor_interval: "5s".to_owned(),
            probe_timeout: "10s".to_owned(),
            max_probe_failures: 5,
            max_dependency_depth: 5,
            priority_boost_after: "1h".to_owned(),
            execution_timeout: String::new(),
            kill_session_on_cancel: false,
            kill_session_on_exit: false,
            shutdown_grace: "0s".to_owned(),
            log_retention_days: 30,
            auto_cleanup: true,
            shell: "/bin/sh".to_owned(),
        }
    }
}

/// Parsed scheduler timings from [`TasksConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTimings {
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
    pub probe_timeout: Duration,
    pub priority_boost_after: Duration,
    pub execution_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl TasksConfig {
    pub fn timings(&self) -> anyhow::Result<TaskTimings> {
        let execution_timeout = if self.execution_timeout.trim().is_empty() {
            None
        } else {
            Some(parse_duration(&self.execution_timeout).context("tasks.execution_timeout")?)
        };
        Ok(TaskTimings {
            poll_interval: parse_duration(&self.poll_interval).context("tasks.poll_interval")?,
            monitor_interval: parse_duration(&self.monitor_interval)
                .context("tasks.monitor_interval")?,
            probe_timeout: parse_duration(&self.probe_timeout).context("tasks.probe_timeout")?,
            priority_boost_after: parse_duration(&self.priority_boost_after)
                .context("tasks.priority_boost_after")?,
            execution_timeout,
            shutdown_grace: parse_duration(&self.shutdown_grace).context("tasks.shutdown_grace")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

/// `~/.config/gwtask/config.toml`. On Windows the platform config directory is
/// used unless that file already exists.
pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let home = home_dir().context("failed to determine home directory")?;
    let xdg = home.join(".config").join("gwtask").join("config.toml");
    if cfg!(windows) && !xdg.exists() {
        let proj = ProjectDirs::from("com", "gwtask", "gwtask")
            .context("failed to determine platform config directory")?;
        return Ok(ConfigPaths {
            config_file: proj.config_dir().join("config.toml"),
        });
    }
    Ok(ConfigPaths { config_file: xdg })
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    let rest = match input {
        "~" => "",
        _ => match input.strip_prefix("~/") {
            Some(rest) => rest,
            None => return input.to_owned(),
        },
    };
    match home_dir() {
        Some(home) => home.join(rest).to_string_lossy().to_string(),
        None => input.to_owned(),
    }
}

/// Expands `~` and environment variables; relative results are resolved
/// against the current directory.
pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let p = PathBuf::from(expand_env_vars(&expand_tilde(input.trim())));
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // $VAR and ${VAR}; unknown variables stay as written.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

/// Parses `<n>[ms|s|m|h|d|w]`; a bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;

    let secs = |mult: u64| {
        n.checked_mul(mult)
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow::anyhow!("duration too large: {s}"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" | "" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        "d" => secs(24 * 60 * 60),
        "w" => secs(7 * 24 * 60 * 60),
        _ => anyhow::bail!("unsupported duration unit in '{s}' (use ms|s|m|h|d|w)"),
    }
}

/// Loads and validates the user config; a missing file means defaults.
pub fn load() -> anyhow::Result<(Config, ConfigPaths)> {
    let paths = default_paths()?;
    let cfg = ConfigFile::open(&paths.config_file)?.config()?;
    Ok((cfg, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    get_value_string_at_path(&default_paths()?.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    set_value_string_at_path(&default_paths()?.config_file, key, value)
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let cfg = ConfigFile::open(path)?.config()?;
    Ok(lookup_value(&cfg, key)?.map(|v| match v {
        toml::Value::String(s) => s,
        toml::Value::Table(t) => toml::to_string(&t).unwrap_or_default().trim_end().to_owned(),
        other => other.to_string(),
    }))
}

/// Sets one dotted key, keeping the rest of the file (comments included) as written.
pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let mut file = ConfigFile::open(path)?;
    file.config()?;
    file.set(key, parse_value_for_key(key, value)?)?;
    file.config()
        .with_context(|| format!("refusing to write {key} = {value}"))?;
    file.save()
}

/// A config file opened for editing.
struct ConfigFile {
    path: PathBuf,
    doc: toml_edit::DocumentMut,
}

impl ConfigFile {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let doc = match std::fs::read_to_string(path) {
            Ok(raw) => raw
                .parse::<toml_edit::DocumentMut>()
                .with_context(|| format!("failed to parse TOML in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml_edit::DocumentMut::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// The validated config this document describes.
    fn config(&self) -> anyhow::Result<Config> {
        let cfg: Config = toml::from_str(&self.doc.to_string())
            .with_context(|| format!("invalid config in {}", self.path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn set(&mut self, key: &str, value: toml_edit::Item) -> anyhow::Result<()> {
        let mut segments = key.split('.').filter(|p| !p.is_empty()).peekable();
        let mut table = self.doc.as_table_mut();
        while let Some(seg) = segments.next() {
            if segments.peek().is_none() {
                table.insert(seg, value);
                return Ok(());
            }
            let entry = table.entry(seg).or_insert_with(|| {
                let mut t = toml_edit::Table::new();
                t.set_implicit(true);
                toml_edit::Item::Table(t)
            });
            table = entry.as_table_mut().ok_or_else(|| {
                GwtaskError::Config(format!("cannot set {key}: '{seg}' is not a table"))
            })?;
        }
        Err(GwtaskError::InvalidConfigKey(key.to_owned()).into())
    }

    fn save(&self) -> anyhow::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let tmp = self.path.with_extension(format!("toml.{}.tmp", std::process::id()));
        std::fs::write(&tmp, self.doc.to_string())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            let _ = std::fs::remove_file(&tmp);
            format!("failed to replace {}", self.path.display())
        })
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), GwtaskError> {
        if self.worktree.base_dir.trim().is_empty() {
            return Err(GwtaskError::Config(
                "worktree.base_dir must not be empty".to_owned(),
            ));
        }
        if self.mux.capture_lines == 0 {
            return Err(GwtaskError::Config(
                "mux.capture_lines must be >= 1".to_owned(),
            ));
        }
        let t = &self.tasks;
        if t.max_parallel == 0 {
            return Err(GwtaskError::Config(
                "tasks.max_parallel must be >= 1".to_owned(),
            ));
        }
        if let Some((name, _)) = t.category_limits.iter().find(|(_, v)| **v == 0) {
            return Err(GwtaskError::Config(format!(
                "tasks.category_limits.{name} must be >= 1"
            )));
        }
        if t.max_dependency_depth == 0 {
            return Err(GwtaskError::Config(
                "tasks.max_dependency_depth must be >= 1".to_owned(),
            ));
        }
        if t.max_probe_failures == 0 {
            return Err(GwtaskError::Config(
                "tasks.max_probe_failures must be >= 1".to_owned(),
            ));
        }
        if t.runner.parse::<crate::task::model::Runner>().is_err() {
            return Err(GwtaskError::Config(format!(
                "tasks.runner must be claude or codex, got '{}'",
                t.runner
            )));
        }
        if t.shell.trim().is_empty() {
            return Err(GwtaskError::Config("tasks.shell must not be empty".to_owned()));
        }
        let timings = t
            .timings()
            .map_err(|e| GwtaskError::Config(format!("{e:#}")))?;
        for (key, d) in [
            ("tasks.poll_interval", timings.poll_interval),
            ("tasks.monitor_interval", timings.monitor_interval),
            ("tasks.probe_timeout", timings.probe_timeout),
        ] {
            if d.is_zero() {
                return Err(GwtaskError::Config(format!("{key} must be > 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    String,
    Duration,
    Enum(&'static [&'static str]),
}

fn key_type(key: &str) -> Option<KeyType> {
    // Dynamic keys (maps)
    if key.starts_with("worktree.sanitize.") {
        return Some(KeyType::String);
    }
    if key.starts_with("tasks.category_limits.") {
        return Some(KeyType::Int);
    }

    Some(match key {
        "worktree.base_dir"
        | "mux.tmux_command"
        | "mux.zellij_command"
        | "tasks.queue_dir"
        | "tasks.claude_executable"
        | "tasks.codex_executable"
        | "tasks.shell" => KeyType::String,

        "worktree.auto_create"
        | "tasks.kill_session_on_cancel"
        | "tasks.kill_session_on_exit"
        | "tasks.auto_cleanup" => KeyType::Bool,

        "mux.capture_lines"
        | "tasks.max_parallel"
        | "tasks.max_dependency_depth"
        | "tasks.max_probe_failures"
        | "tasks.log_retention_days" => KeyType::Int,

        "tasks.poll_interval"
        | "tasks.monitor_interval"
        | "tasks.probe_timeout"
        | "tasks.priority_boost_after"
        | "tasks.execution_timeout"
        | "tasks.shutdown_grace" => KeyType::Duration,

        "mux.backend" => KeyType::Enum(&["tmux", "zellij"]),
        "tasks.runner" => KeyType::Enum(&["claude", "codex"]),

        _ => return None,
    })
}

fn parse_value_for_key(key: &str, value: &str) -> anyhow::Result<toml_edit::Item> {
    if key == "worktree.sanitize" || key == "tasks.category_limits" {
        return Err(GwtaskError::InvalidConfigValue {
            key: key.to_owned(),
            msg: format!("set individual entries via {key}.<name>"),
        }
        .into());
    }
    let key_type = key_type(key).ok_or_else(|| GwtaskError::InvalidConfigKey(key.to_owned()))?;
    let invalid = |msg: String| GwtaskError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::Duration => {
            let v = value.trim();
            // Only the execution timeout may be cleared.
            if !(v.is_empty() && key == "tasks.execution_timeout") {
                parse_duration(v).map_err(|e| invalid(format!("{e:#}")))?;
            }
            toml_edit::value(v)
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(invalid(format!("must be one of: {}", allowed.join(", "))).into());
            }
            toml_edit::value(v)
        }
    };
    Ok(item)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    let n = s
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))?;
    if n < 0 {
        return Err(format!("expected a non-negative integer, got {n}"));
    }
    Ok(n)
}

fn lookup_value(cfg: &Config, key: &str) -> anyhow::Result<Option<toml::Value>> {
    let mut v = toml::Value::try_from(cfg).context("failed to render config")?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        let toml::Value::Table(mut table) = v else {
            return Ok(None);
        };
        match table.remove(seg) {
            Some(next) => v = next,
            None => return Ok(None),
        }
    }
    Ok(Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
        let timings = Config::default().tasks.timings().unwrap();
        assert_eq!(timings.poll_interval, Duration::from_secs(5));
        assert_eq!(timings.priority_boost_after, Duration::from_secs(3600));
        assert_eq!(timings.execution_timeout, None);
    }

    #[test]
    fn config_validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.tasks.max_parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tasks.category_limits.insert("review".to_owned(), 0);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tasks.max_probe_failures = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tasks.poll_interval = "0s".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tasks.execution_timeout = "soon".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "tasks.max_parallel", "6").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "tasks.max_parallel")
                .unwrap()
                .as_deref(),
            Some("6")
        );

        set_value_string_at_path(&path, "tasks.category_limits.review", "1").unwrap();
        set_value_string_at_path(&path, "mux.backend", "zellij").unwrap();
        set_value_string_at_path(&path, "tasks.execution_timeout", "2h").unwrap();

        assert!(set_value_string_at_path(&path, "mux.backend", "screen").is_err());
        assert!(set_value_string_at_path(&path, "tasks.poll_interval", "often").is_err());
        assert!(set_value_string_at_path(&path, "tasks.nope", "1").is_err());

        let cfg = ConfigFile::open(&path).unwrap().config().unwrap();
        assert_eq!(cfg.tasks.max_parallel, 6);
        assert_eq!(cfg.tasks.category_limits.get("review"), Some(&1));
        assert_eq!(cfg.tasks.category_limits.get("development"), Some(&2));
        assert_eq!(cfg.mux.backend, MuxBackendKind::Zellij);
        assert_eq!(
            cfg.tasks.timings().unwrap().execution_timeout,
            Some(Duration::from_secs(7200))
        );
    }
}
