//! Runtime plugins: the process host a session's agent runs inside.

mod tmux;

pub use tmux::TmuxRuntime;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::RuntimeHandle;

/// Errors from runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime binary '{0}' is not installed or not in PATH")]
    NotInstalled(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("failed to create session '{0}': {1}")]
    CreationFailed(String, String),

    #[error("failed to send message to session '{0}': {1}")]
    SendFailed(String, String),

    #[error("runtime command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("runtime command failed: {0}")]
    CommandFailed(String),
}

/// Everything a runtime needs to host one session.
#[derive(Debug, Clone)]
pub struct CreateRuntimeRequest {
    pub session_id: String,
    pub workspace_path: PathBuf,
    pub launch_command: String,
    pub environment: BTreeMap<String, String>,
}

/// Process-host abstraction (terminal multiplexer, container, child process).
#[async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> &str;

    /// Create the process host and launch the agent inside it.
    async fn create(&self, request: &CreateRuntimeRequest) -> Result<RuntimeHandle, RuntimeError>;

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    /// Write a message into the session's terminal.
    async fn send_message(&self, handle: &RuntimeHandle, message: &str)
        -> Result<(), RuntimeError>;

    /// Capture recent terminal output, newest lines last.
    async fn get_output(
        &self,
        handle: &RuntimeHandle,
        lines: Option<u32>,
    ) -> Result<String, RuntimeError>;

    async fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool, RuntimeError>;
}

/// In-memory runtime for tests: scripted liveness and output, recorded
/// creates, sends, and destroys, with per-operation failure injection.
#[derive(Default)]
pub struct MockRuntime {
    state: std::sync::Mutex<MockRuntimeState>,
}

#[derive(Default)]
struct MockRuntimeState {
    alive: std::collections::HashMap<String, bool>,
    outputs: std::collections::HashMap<String, String>,
    created: Vec<CreateRuntimeRequest>,
    sent: Vec<(String, String)>,
    destroyed: Vec<String>,
    fail_create: bool,
    fail_send: bool,
    fail_get_output: bool,
    fail_is_alive: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, handle_id: &str, alive: bool) {
        self.state
            .lock()
            .unwrap()
            .alive
            .insert(handle_id.to_string(), alive);
    }

    pub fn set_output(&self, handle_id: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(handle_id.to_string(), output.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn fail_get_output(&self, fail: bool) {
        self.state.lock().unwrap().fail_get_output = fail;
    }

    pub fn fail_is_alive(&self, fail: bool) {
        self.state.lock().unwrap().fail_is_alive = fail;
    }

    pub fn created(&self) -> Vec<CreateRuntimeRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, request: &CreateRuntimeRequest) -> Result<RuntimeHandle, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(RuntimeError::CreationFailed(
                request.session_id.clone(),
                "mock failure".to_string(),
            ));
        }
        let handle_id = format!("mock-{}", request.session_id);
        state.alive.insert(handle_id.clone(), true);
        state.created.push(request.clone());
        Ok(RuntimeHandle::new(handle_id, "mock"))
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.alive.insert(handle.id.clone(), false);
        state.destroyed.push(handle.id.clone());
        Ok(())
    }

    async fn send_message(
        &self,
        handle: &RuntimeHandle,
        message: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(RuntimeError::SendFailed(
                handle.id.clone(),
                "mock failure".to_string(),
            ));
        }
        state.sent.push((handle.id.clone(), message.to_string()));
        Ok(())
    }

    async fn get_output(
        &self,
        handle: &RuntimeHandle,
        _lines: Option<u32>,
    ) -> Result<String, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.fail_get_output {
            return Err(RuntimeError::CommandFailed("mock failure".to_string()));
        }
        Ok(state.outputs.get(&handle.id).cloned().unwrap_or_default())
    }

    async fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.fail_is_alive {
            return Err(RuntimeError::CommandFailed("mock failure".to_string()));
        }
        Ok(state.alive.get(&handle.id).copied().unwrap_or(false))
    }
}
