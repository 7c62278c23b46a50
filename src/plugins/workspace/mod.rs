//! Workspace plugins: the isolated checkout a session works in.

mod git;

pub use git::WorktreeWorkspace;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::ProjectConfig;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("git binary is not installed or not in PATH")]
    GitNotInstalled,

    #[error("workspace at '{0}' already exists")]
    AlreadyExists(PathBuf),

    #[error("failed to create workspace: {0}")]
    CreationFailed(String),

    #[error("failed to destroy workspace '{0}': {1}")]
    DestroyFailed(PathBuf, String),

    #[error("post-create hook failed: {0}")]
    PostCreateFailed(String),

    #[error("workspace command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("workspace command failed: {0}")]
    CommandFailed(String),
}

/// Inputs for creating one session's workspace.
#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub project_id: String,
    pub project: ProjectConfig,
    pub session_id: String,
    pub branch: String,
}

/// A created workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Isolated code checkout (git worktree or clone).
#[async_trait]
pub trait Workspace: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, request: &CreateWorkspaceRequest)
        -> Result<WorkspaceInfo, WorkspaceError>;

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError>;

    /// All workspaces this plugin manages for a project.
    async fn list(&self, project: &ProjectConfig) -> Result<Vec<WorkspaceInfo>, WorkspaceError>;

    /// Hook run after creation (symlinks, setup commands).
    async fn post_create(
        &self,
        _info: &WorkspaceInfo,
        _project: &ProjectConfig,
    ) -> Result<(), WorkspaceError> {
        Ok(())
    }
}

/// In-memory workspace for tests.
#[derive(Default)]
pub struct MockWorkspace {
    state: std::sync::Mutex<MockWorkspaceState>,
}

#[derive(Default)]
struct MockWorkspaceState {
    created: Vec<WorkspaceInfo>,
    destroyed: Vec<PathBuf>,
    fail_create: bool,
    base_dir: PathBuf,
}

impl MockWorkspace {
    pub fn new() -> Self {
        let state = MockWorkspaceState {
            base_dir: PathBuf::from("/tmp/mock-workspaces"),
            ..MockWorkspaceState::default()
        };
        Self {
            state: std::sync::Mutex::new(state),
        }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().base_dir = base_dir.into();
        mock
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn created(&self) -> Vec<WorkspaceInfo> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn destroyed(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().destroyed.clone()
    }
}

#[async_trait]
impl Workspace for MockWorkspace {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(
        &self,
        request: &CreateWorkspaceRequest,
    ) -> Result<WorkspaceInfo, WorkspaceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(WorkspaceError::CreationFailed("mock failure".to_string()));
        }
        let info = WorkspaceInfo {
            path: state
                .base_dir
                .join(&request.project_id)
                .join(&request.session_id),
            branch: request.branch.clone(),
        };
        state.created.push(info.clone());
        Ok(info)
    }

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.state
            .lock()
            .unwrap()
            .destroyed
            .push(path.to_path_buf());
        Ok(())
    }

    async fn list(&self, _project: &ProjectConfig) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        Ok(self.state.lock().unwrap().created.clone())
    }
}
