//! Agent plugins: one per coding tool the supervisor can host.

mod claude;

pub use claude::ClaudeAgent;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::{ActivityState, AgentInfo, RuntimeHandle, Session};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("agent probe failed: {0}")]
    ProbeFailed(String),

    #[error("failed to read agent log: {0}")]
    LogUnavailable(String),
}

/// Inputs for composing an agent's launch command and environment.
#[derive(Debug, Clone, Default)]
pub struct AgentLaunchConfig {
    pub session_id: String,
    pub workspace_path: PathBuf,
    pub issue_id: Option<String>,
    pub prompt: Option<String>,
    /// Opaque options from the project's `agentConfig` section.
    pub options: Option<serde_json::Value>,
}

/// The AI coding tool running inside the runtime.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Shell command that starts the agent in the workspace.
    fn launch_command(&self, config: &AgentLaunchConfig) -> String;

    /// Extra environment for the launched process.
    fn environment(&self, config: &AgentLaunchConfig) -> BTreeMap<String, String>;

    /// Classify recent terminal output into a coarse activity state.
    /// Callers must only trust this on non-empty output.
    fn detect_activity(&self, terminal_output: &str) -> ActivityState;

    /// Whether the agent process itself is still running inside the host.
    async fn is_process_running(&self, handle: &RuntimeHandle) -> Result<bool, AgentError>;

    /// Deeper probe than terminal classification, e.g. tailing the agent's
    /// own log for recent entries.
    async fn is_processing(&self, session: &Session) -> Result<bool, AgentError>;

    /// Summary/cost/last-entry extraction from the agent's own log.
    async fn session_info(&self, session: &Session) -> Result<Option<AgentInfo>, AgentError>;

    /// Hook run after the runtime launched the agent.
    async fn post_launch_setup(&self, _session: &Session) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Scripted agent for tests.
#[derive(Default)]
pub struct MockAgent {
    state: std::sync::Mutex<MockAgentState>,
}

#[derive(Default)]
struct MockAgentState {
    activity: Option<ActivityState>,
    process_running: bool,
    processing: bool,
    fail_process_probe: bool,
    info: Option<AgentInfo>,
    post_launch_calls: u32,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(MockAgentState {
                process_running: true,
                ..MockAgentState::default()
            }),
        }
    }

    pub fn set_activity(&self, activity: ActivityState) {
        self.state.lock().unwrap().activity = Some(activity);
    }

    pub fn set_process_running(&self, running: bool) {
        self.state.lock().unwrap().process_running = running;
    }

    pub fn fail_process_probe(&self, fail: bool) {
        self.state.lock().unwrap().fail_process_probe = fail;
    }

    pub fn set_info(&self, info: AgentInfo) {
        self.state.lock().unwrap().info = Some(info);
    }

    pub fn post_launch_calls(&self) -> u32 {
        self.state.lock().unwrap().post_launch_calls
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        "mock"
    }

    fn launch_command(&self, _config: &AgentLaunchConfig) -> String {
        "mock-agent".to_string()
    }

    fn environment(&self, _config: &AgentLaunchConfig) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn detect_activity(&self, _terminal_output: &str) -> ActivityState {
        self.state
            .lock()
            .unwrap()
            .activity
            .unwrap_or(ActivityState::Active)
    }

    async fn is_process_running(&self, _handle: &RuntimeHandle) -> Result<bool, AgentError> {
        let state = self.state.lock().unwrap();
        if state.fail_process_probe {
            return Err(AgentError::ProbeFailed("mock failure".to_string()));
        }
        Ok(state.process_running)
    }

    async fn is_processing(&self, _session: &Session) -> Result<bool, AgentError> {
        Ok(self.state.lock().unwrap().processing)
    }

    async fn session_info(&self, _session: &Session) -> Result<Option<AgentInfo>, AgentError> {
        Ok(self.state.lock().unwrap().info.clone())
    }

    async fn post_launch_setup(&self, _session: &Session) -> Result<(), AgentError> {
        self.state.lock().unwrap().post_launch_calls += 1;
        Ok(())
    }
}
