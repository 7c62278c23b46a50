//! Claude Code agent plugin.
//!
//! Activity classification works on captured terminal text: spinner and
//! status lines mean the tool is working, a permission or question menu
//! means it is waiting for a human, a bare prompt box means it finished
//! its turn. Deeper probes use the pane process tree and Claude's own
//! JSONL session log under `~/.claude/projects/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{Agent, AgentError, AgentLaunchConfig};
use crate::session::{ActivityState, AgentInfo, RuntimeHandle, Session};

/// Probe commands are quick or broken.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A log entry younger than this counts as "still processing".
const PROCESSING_WINDOW: Duration = Duration::from_secs(120);

/// Lines of terminal output examined for activity markers.
const ACTIVITY_WINDOW_LINES: usize = 15;

/// Lines examined for the prompt box (it sits at the very bottom).
const PROMPT_WINDOW_LINES: usize = 5;

static ACTIVITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"esc to interrupt",
        r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
        r"(?i)^\s*(thinking|pondering|crafting|wrangling|simmering)",
        r"Running…",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static WAITING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"Do you want to",
        r"Would you like to",
        r"❯\s+1\.\s+Yes",
        r"\(y/n\)",
        r"Waiting for your input",
        r"Permission required",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"^\s*>\s*$", r"^\s*❯\s*$", r"^│\s*>\s*│?\s*$"]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
});

static EXITED_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| {
        [r"command not found", r"\$\s*$"]
            .iter()
            .map(|p| Regex::new(p).expect("static regex"))
            .collect()
    });

pub struct ClaudeAgent {
    /// Root of Claude's per-project session logs.
    projects_dir: PathBuf,
}

impl Default for ClaudeAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeAgent {
    pub fn new() -> Self {
        let projects_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects");
        Self { projects_dir }
    }

    pub fn with_projects_dir(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    /// Claude encodes the workspace path into the log directory name by
    /// replacing path separators and dots with dashes.
    fn log_dir_for(&self, session: &Session) -> PathBuf {
        let encoded = session
            .workspace_path
            .to_string_lossy()
            .replace(['/', '.'], "-");
        self.projects_dir.join(encoded)
    }

    fn newest_log(&self, session: &Session) -> Option<PathBuf> {
        let dir = self.log_dir_for(session);
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, path)| path)
    }

    fn read_log_tail(&self, session: &Session) -> Option<LogTail> {
        let path = self.newest_log(session)?;
        let contents = std::fs::read_to_string(&path).ok()?;

        let mut tail = LogTail::default();
        for line in contents.lines() {
            let Ok(entry) = serde_json::from_str::<LogEntry>(line) else {
                continue;
            };
            if let Some(ts) = entry.timestamp {
                tail.last_entry_at = Some(ts);
            }
            if entry.entry_type.as_deref() == Some("summary") {
                if let Some(summary) = entry.summary {
                    tail.summary = Some(summary);
                }
            }
            if let Some(cost) = entry.cost_usd {
                tail.total_cost += cost;
                tail.saw_cost = true;
            }
        }
        Some(tail)
    }
}

#[derive(Debug, Default)]
struct LogTail {
    summary: Option<String>,
    last_entry_at: Option<DateTime<Utc>>,
    total_cost: f64,
    saw_cost: bool,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    summary: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "costUSD")]
    cost_usd: Option<f64>,
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    fn launch_command(&self, config: &AgentLaunchConfig) -> String {
        let mut command = String::from("claude");

        if let Some(args) = config
            .options
            .as_ref()
            .and_then(|o| o.get("args"))
            .and_then(|a| a.as_array())
        {
            for arg in args.iter().filter_map(|a| a.as_str()) {
                command.push(' ');
                command.push_str(arg);
            }
        }

        if let Some(prompt) = &config.prompt {
            command.push_str(" '");
            command.push_str(&prompt.replace('\'', r"'\''"));
            command.push('\'');
        }

        command
    }

    fn environment(&self, config: &AgentLaunchConfig) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(vars) = config
            .options
            .as_ref()
            .and_then(|o| o.get("env"))
            .and_then(|e| e.as_object())
        {
            for (key, value) in vars {
                if let Some(value) = value.as_str() {
                    env.insert(key.clone(), value.to_string());
                }
            }
        }
        env
    }

    fn detect_activity(&self, terminal_output: &str) -> ActivityState {
        let recent: Vec<&str> = terminal_output
            .lines()
            .rev()
            .take(ACTIVITY_WINDOW_LINES)
            .collect();

        // A question menu outranks everything else on screen.
        for line in &recent {
            if WAITING_PATTERNS.iter().any(|p| p.is_match(line)) {
                return ActivityState::WaitingInput;
            }
        }

        for line in &recent {
            if ACTIVITY_PATTERNS.iter().any(|p| p.is_match(line)) {
                return ActivityState::Active;
            }
        }

        let bottom: Vec<&str> = terminal_output
            .lines()
            .rev()
            .take(PROMPT_WINDOW_LINES)
            .collect();
        for line in &bottom {
            if PROMPT_PATTERNS.iter().any(|p| p.is_match(line)) {
                return ActivityState::Ready;
            }
        }
        for line in &bottom {
            if EXITED_PATTERNS.iter().any(|p| p.is_match(line)) {
                return ActivityState::Exited;
            }
        }

        ActivityState::Idle
    }

    async fn is_process_running(&self, handle: &RuntimeHandle) -> Result<bool, AgentError> {
        let Some(pane_pid) = handle.data.get("panePid").and_then(serde_json::Value::as_u64)
        else {
            // Without a pane PID we cannot tell; claim running so liveness
            // is decided by the runtime probe instead.
            return Ok(true);
        };

        let pid = pane_pid.to_string();
        let mut cmd = Command::new("pgrep");
        cmd.arg("-P")
            .arg(&pid)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| AgentError::Timeout(PROBE_TIMEOUT))?
            .map_err(|e| AgentError::ProbeFailed(format!("failed to execute pgrep: {e}")))?;

        // pgrep exits non-zero when no children remain.
        Ok(output.status.success() && !output.stdout.is_empty())
    }

    async fn is_processing(&self, session: &Session) -> Result<bool, AgentError> {
        let Some(tail) = self.read_log_tail(session) else {
            return Ok(false);
        };
        let Some(last) = tail.last_entry_at else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(last);
        Ok(age.to_std().map(|d| d < PROCESSING_WINDOW).unwrap_or(true))
    }

    async fn session_info(&self, session: &Session) -> Result<Option<AgentInfo>, AgentError> {
        let Some(tail) = self.read_log_tail(session) else {
            debug!(session = %session.id, "No agent log found");
            return Ok(None);
        };
        Ok(Some(AgentInfo {
            summary: tail.summary,
            cost_usd: tail.saw_cost.then_some(tail.total_cost),
            last_log_at: tail.last_entry_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn agent() -> ClaudeAgent {
        ClaudeAgent::with_projects_dir("/nonexistent")
    }

    #[test]
    fn spinner_means_active() {
        let output = "some scrollback\n⠙ Wrangling the parser… (esc to interrupt)\n";
        assert_eq!(agent().detect_activity(output), ActivityState::Active);
    }

    #[test]
    fn permission_menu_means_waiting_input() {
        let output = "\
Do you want to run `cargo test`?
❯ 1. Yes
  2. No
";
        assert_eq!(agent().detect_activity(output), ActivityState::WaitingInput);
    }

    #[test]
    fn waiting_outranks_activity_markers() {
        let output = "⠙ working\nDo you want to proceed? (y/n)\n";
        assert_eq!(agent().detect_activity(output), ActivityState::WaitingInput);
    }

    #[test]
    fn bare_prompt_means_ready() {
        let output = "Done! I've fixed the failing test.\n\n> \n";
        assert_eq!(agent().detect_activity(output), ActivityState::Ready);
    }

    #[test]
    fn shell_prompt_means_exited() {
        let output = "Session ended.\nuser@host:~/work $ ";
        assert_eq!(agent().detect_activity(output), ActivityState::Exited);
    }

    #[test]
    fn unclassified_output_is_idle() {
        let output = "lots of\nplain build output\nwith nothing on the bottom line\n";
        assert_eq!(agent().detect_activity(output), ActivityState::Idle);
    }

    #[test]
    fn launch_command_quotes_prompt() {
        let config = AgentLaunchConfig {
            prompt: Some("Fix the bug in foo's parser".to_string()),
            ..AgentLaunchConfig::default()
        };
        let command = agent().launch_command(&config);
        assert!(command.starts_with("claude '"));
        assert!(command.contains(r"foo'\''s"));
    }

    #[test]
    fn launch_command_appends_configured_args() {
        let config = AgentLaunchConfig {
            options: Some(serde_json::json!({"args": ["--model", "opus"]})),
            ..AgentLaunchConfig::default()
        };
        assert_eq!(agent().launch_command(&config), "claude --model opus");
    }

    #[test]
    fn environment_passes_through_configured_vars() {
        let config = AgentLaunchConfig {
            options: Some(serde_json::json!({"env": {"CLAUDE_FOO": "bar"}})),
            ..AgentLaunchConfig::default()
        };
        let env = agent().environment(&config);
        assert_eq!(env.get("CLAUDE_FOO").map(String::as_str), Some("bar"));
    }

    #[tokio::test]
    async fn session_info_reads_jsonl_log() {
        let tmp = TempDir::new().unwrap();
        let agent = ClaudeAgent::with_projects_dir(tmp.path());

        let workspace = PathBuf::from("/tmp/worktrees/app-1");
        let log_dir = tmp.path().join("-tmp-worktrees-app-1");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(
            log_dir.join("session.jsonl"),
            concat!(
                r#"{"type":"summary","summary":"Fixing the widget","timestamp":"2026-07-01T10:00:00Z"}"#,
                "\n",
                r#"{"type":"assistant","timestamp":"2026-07-01T10:05:00Z","costUSD":0.42}"#,
                "\n",
                "not json\n",
            ),
        )
        .unwrap();

        let mut record = crate::session::metadata::MetadataRecord::new("app-1", "my-app");
        record.set(crate::session::metadata::keys::WORKTREE, workspace.to_str().unwrap());
        let session = Session::from_record(record);

        let info = agent.session_info(&session).await.unwrap().unwrap();
        assert_eq!(info.summary.as_deref(), Some("Fixing the widget"));
        assert_eq!(info.cost_usd, Some(0.42));
        assert_eq!(
            info.last_log_at.unwrap().to_rfc3339(),
            "2026-07-01T10:05:00+00:00"
        );

        // The last entry is old, so the agent is not actively processing.
        assert!(!agent.is_processing(&session).await.unwrap());
    }

    #[tokio::test]
    async fn session_info_without_log_is_none() {
        let session = Session::from_record(crate::session::metadata::MetadataRecord::new(
            "app-1", "my-app",
        ));
        assert!(agent().session_info(&session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn process_probe_without_pane_pid_claims_running() {
        let handle = RuntimeHandle::new("ov-app-1", "tmux");
        assert!(agent().is_process_running(&handle).await.unwrap());
    }
}
