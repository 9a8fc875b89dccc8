#![forbid(unsafe_code)]

use std::fmt::Write as _;

use serde::Deserialize;

use crate::task::model::{Runner, Task};

/// Renders the agent instructions for `task`. Pure and deterministic.
#[must_use]
pub fn build_prompt(task: &Task) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task: {}", task.display_name());
    out.push('\n');

    let body = task.prompt.trim();
    if body.is_empty() {
        out.push_str(task.name.trim());
    } else {
        out.push_str(body);
    }
    out.push('\n');

    if !task.files.is_empty() {
        out.push_str("\n## Files to focus on\n");
        for f in &task.files {
            let _ = writeln!(out, "- {f}");
        }
    }

    if !task.verify.is_empty() {
        out.push_str("\n## Verification\nRun these commands and make sure they pass:\n");
        for cmd in &task.verify {
            let _ = writeln!(out, "- `{cmd}`");
        }
    }

    out.push_str(
        "\n## Success criteria\n\
         Complete the task above in this working directory without asking for input. \
         Leave the tree in a state where every verification command passes.\n",
    );
    out
}

/// Builds the shell command that runs `runner` non-interactively and then
/// prints a completion marker carrying the agent's exit status.
#[must_use]
pub fn compose_command(runner: Runner, executable: &str, prompt: &str) -> String {
    let exe = shell_quote(executable);
    let prompt = shell_quote(prompt);
    let agent = match runner {
        Runner::Claude => format!(
            "{exe} --dangerously-skip-permissions --output-format stream-json --verbose -p {prompt}"
        ),
        Runner::Codex => format!(
            "{exe} exec --dangerously-bypass-approvals-and-sandbox --color never --json {prompt}"
        ),
    };
    format!("{agent}; {MARKER_TRAILER}")
}

const MARKER_TRAILER: &str = concat!(
    "gwtask_rc=$?; ",
    "if [ \"$gwtask_rc\" -eq 0 ]; then ",
    "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"exit_code\":0}'; ",
    "else ",
    "printf '{\"type\":\"result\",\"subtype\":\"error_exit\",\"is_error\":true,\"exit_code\":%d}\\n' \"$gwtask_rc\"; ",
    "fi"
);

/// Single-quotes `s` for POSIX shells.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A `"type":"result"` record found in session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarker {
    pub subtype: String,
    pub success: bool,
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct RawMarker {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    exit_code: Option<i32>,
}

impl CompletionMarker {
    fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') || !line.contains("\"result\"") {
            return None;
        }
        let raw: RawMarker = serde_json::from_str(line).ok()?;
        if raw.kind != "result" {
            return None;
        }
        let subtype = raw.subtype.unwrap_or_default();
        let success = subtype == "success" && raw.is_error != Some(true);
        let exit_code = match (success, raw.exit_code) {
            (true, code) => code.unwrap_or(0),
            (false, Some(code)) if code != 0 => code,
            (false, _) => 1,
        };
        Some(Self {
            subtype,
            success,
            exit_code,
        })
    }

    /// The last marker in `output`, if any.
    #[must_use]
    pub fn find_last(output: &str) -> Option<Self> {
        output.lines().rev().find_map(Self::from_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let mut t = Task::new("a1b2c3", "Add login", "feature/login");
        t.prompt = "Implement the login form.".to_owned();
        t.files = vec!["src/login.rs".to_owned()];
        t.verify = vec!["cargo test".to_owned()];
        t
    }

    #[test]
    fn prompt_has_sections_in_order() {
        let p = build_prompt(&task());
        let idx = |needle: &str| p.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(idx("# Task: Add login") < idx("Implement the login form."));
        assert!(idx("Implement the login form.") < idx("## Files to focus on"));
        assert!(idx("- src/login.rs") < idx("## Verification"));
        assert!(idx("- `cargo test`") < idx("## Success criteria"));
        assert_eq!(p, build_prompt(&task()));
    }

    #[test]
    fn prompt_falls_back_to_name_and_skips_empty_sections() {
        let t = Task::new("a1", "Fix the flaky test", "wt");
        let p = build_prompt(&t);
        assert!(p.contains("\nFix the flaky test\n"));
        assert!(!p.contains("Files to focus on"));
        assert!(!p.contains("## Verification"));
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn composes_runner_commands() {
        let claude = compose_command(Runner::Claude, "claude", "don't stop");
        assert!(claude.starts_with(
            r"'claude' --dangerously-skip-permissions --output-format stream-json --verbose -p 'don'\''t stop'; "
        ));
        assert!(!claude.trim_end().ends_with(';'));

        let codex = compose_command(Runner::Codex, "/opt/codex", "go");
        assert!(codex.starts_with(
            "'/opt/codex' exec --dangerously-bypass-approvals-and-sandbox --color never --json 'go'; "
        ));
        assert!(codex.contains("\"type\":\"result\""));
    }

    #[test]
    fn classifies_markers() {
        let ok = CompletionMarker::find_last(
            "noise\n{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"done\"}\n",
        )
        .unwrap();
        assert!(ok.success);
        assert_eq!(ok.exit_code, 0);

        let err = CompletionMarker::find_last(
            "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":true}",
        )
        .unwrap();
        assert!(!err.success);
        assert_eq!(err.exit_code, 1);

        let exited = CompletionMarker::find_last(
            "{\"type\":\"result\",\"subtype\":\"error_exit\",\"is_error\":true,\"exit_code\":3}",
        )
        .unwrap();
        assert_eq!(exited.exit_code, 3);
        assert_eq!(exited.subtype, "error_exit");

        assert!(CompletionMarker::find_last("{\"type\":\"assistant\"}\nplain text").is_none());
    }

    #[test]
    fn last_marker_wins() {
        let out = "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false}\n\
                   {\"type\":\"result\",\"subtype\":\"error_exit\",\"is_error\":true,\"exit_code\":2}\n";
        let m = CompletionMarker::find_last(out).unwrap();
        assert!(!m.success);
        assert_eq!(m.exit_code, 2);
    }
}
