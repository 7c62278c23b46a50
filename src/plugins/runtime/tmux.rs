//! Tmux-backed runtime.
//!
//! Each session gets a detached tmux session on a dedicated socket, so
//! the supervisor's sessions never collide with the user's own tmux
//! server or config. The pane PID is captured into the runtime handle at
//! creation time so agent plugins can probe the process tree later.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{CreateRuntimeRequest, Runtime, RuntimeError};
use crate::session::RuntimeHandle;

/// Dedicated socket for supervisor-managed tmux sessions.
pub const OVERSEER_SOCKET: &str = "overseer";

/// Prefix for tmux session names.
const SESSION_PREFIX: &str = "ov-";

/// tmux `send-keys` has a small server-side limit; longer messages go
/// through a paste buffer instead.
const SEND_KEYS_THRESHOLD: usize = 2000;

/// Every tmux invocation is bounded.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between pasting a message and pressing Enter, so the agent's
/// input widget has consumed the text.
const SUBMIT_DELAY: Duration = Duration::from_millis(500);

const DEFAULT_CAPTURE_LINES: u32 = 200;

pub struct TmuxRuntime {
    socket: String,
}

impl Default for TmuxRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxRuntime {
    pub fn new() -> Self {
        Self {
            socket: OVERSEER_SOCKET.to_string(),
        }
    }

    /// Use a non-default socket (tests, parallel supervisors).
    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn session_name(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    pub const fn default_socket() -> &'static str {
        OVERSEER_SOCKET
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(?args, socket = %self.socket, "Running tmux command");

        let mut cmd = Command::new("tmux");
        cmd.arg("-L")
            .arg(&self.socket)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| RuntimeError::CommandFailed(format!("failed to execute tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed(format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Exit-status probe variant: a clean non-zero exit is `false`, not an
    /// error, so callers can distinguish "not there" from "can't tell".
    async fn tmux_succeeds(&self, args: &[&str]) -> Result<bool, RuntimeError> {
        let mut cmd = Command::new("tmux");
        cmd.arg("-L")
            .arg(&self.socket)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let status = tokio::time::timeout(COMMAND_TIMEOUT, cmd.status())
            .await
            .map_err(|_| RuntimeError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| RuntimeError::CommandFailed(format!("failed to execute tmux: {e}")))?;

        Ok(status.success())
    }

    /// Compose the single line typed into the fresh session's shell:
    /// environment assignments via `env`, then the launch command.
    fn compose_launch_line(request: &CreateRuntimeRequest) -> String {
        if request.environment.is_empty() {
            return request.launch_command.clone();
        }
        let assignments: Vec<String> = request
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)))
            .collect();
        format!("env {} {}", assignments.join(" "), request.launch_command)
    }

    async fn send_via_buffer(&self, target: &str, text: &str) -> Result<(), RuntimeError> {
        let buffer = format!("{SESSION_PREFIX}buf-{target}");
        self.run_tmux(&["set-buffer", "-b", &buffer, text]).await?;
        let paste = self
            .run_tmux(&["paste-buffer", "-b", &buffer, "-t", target])
            .await;
        // Always try to drop the buffer, even when pasting failed.
        let _ = self.run_tmux(&["delete-buffer", "-b", &buffer]).await;
        paste.map(|_| ())
    }

    async fn type_line(&self, target: &str, text: &str) -> Result<(), RuntimeError> {
        if text.len() > SEND_KEYS_THRESHOLD {
            self.send_via_buffer(target, text).await?;
        } else {
            self.run_tmux(&["send-keys", "-t", target, text]).await?;
        }
        tokio::time::sleep(SUBMIT_DELAY).await;
        self.run_tmux(&["send-keys", "-t", target, "Enter"]).await?;
        Ok(())
    }
}

#[async_trait]
impl Runtime for TmuxRuntime {
    fn name(&self) -> &str {
        "tmux"
    }

    #[instrument(skip(self, request), fields(session = %request.session_id))]
    async fn create(&self, request: &CreateRuntimeRequest) -> Result<RuntimeHandle, RuntimeError> {
        let name = Self::session_name(&request.session_id);
        let workdir = request.workspace_path.to_string_lossy();

        self.run_tmux(&["new-session", "-d", "-s", &name, "-c", &workdir])
            .await
            .map_err(|e| RuntimeError::CreationFailed(name.clone(), e.to_string()))?;

        // Launch the agent inside the fresh shell.
        let launch_line = Self::compose_launch_line(request);
        if let Err(e) = self.type_line(&name, &launch_line).await {
            // A half-created session is worse than none.
            let _ = self.run_tmux(&["kill-session", "-t", &name]).await;
            return Err(RuntimeError::CreationFailed(name, e.to_string()));
        }

        let pane_pid = self
            .run_tmux(&["display-message", "-p", "-t", &name, "#{pane_pid}"])
            .await
            .ok()
            .and_then(|out| out.trim().parse::<u32>().ok());

        let mut handle = RuntimeHandle::new(name, "tmux");
        handle.data = serde_json::json!({
            "socket": self.socket,
            "panePid": pane_pid,
        });
        Ok(handle)
    }

    #[instrument(skip(self), fields(session = %handle.id))]
    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        match self.tmux_succeeds(&["kill-session", "-t", &handle.id]).await {
            Ok(true) => Ok(()),
            // Session already gone counts as destroyed.
            Ok(false) => {
                debug!(session = %handle.id, "tmux session already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_message(
        &self,
        handle: &RuntimeHandle,
        message: &str,
    ) -> Result<(), RuntimeError> {
        self.type_line(&handle.id, message)
            .await
            .map_err(|e| RuntimeError::SendFailed(handle.id.clone(), e.to_string()))
    }

    async fn get_output(
        &self,
        handle: &RuntimeHandle,
        lines: Option<u32>,
    ) -> Result<String, RuntimeError> {
        let lines = lines.unwrap_or(DEFAULT_CAPTURE_LINES);
        let start = format!("-{lines}");
        self.run_tmux(&["capture-pane", "-p", "-t", &handle.id, "-S", &start])
            .await
    }

    async fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool, RuntimeError> {
        match self.tmux_succeeds(&["has-session", "-t", &handle.id]).await {
            Ok(alive) => Ok(alive),
            Err(e) => {
                warn!(session = %handle.id, error = %e, "tmux liveness probe failed");
                Err(e)
            }
        }
    }
}

/// Single-quote a value for the shell, escaping embedded quotes.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn request(env: &[(&str, &str)]) -> CreateRuntimeRequest {
        CreateRuntimeRequest {
            session_id: "app-1".to_string(),
            workspace_path: PathBuf::from("/tmp/worktrees/app-1"),
            launch_command: "claude --continue".to_string(),
            environment: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn session_name_is_prefixed() {
        assert_eq!(TmuxRuntime::session_name("app-1"), "ov-app-1");
    }

    #[test]
    fn launch_line_without_env_is_bare_command() {
        let line = TmuxRuntime::compose_launch_line(&request(&[]));
        assert_eq!(line, "claude --continue");
    }

    #[test]
    fn launch_line_with_env_uses_env_prefix() {
        let line = TmuxRuntime::compose_launch_line(&request(&[
            ("OVERSEER_SESSION", "app-1"),
            ("FOO", "a b"),
        ]));
        assert_eq!(
            line,
            "env FOO='a b' OVERSEER_SESSION='app-1' claude --continue"
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
