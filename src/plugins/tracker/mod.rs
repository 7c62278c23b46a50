//! Tracker plugins: where issues come from.

mod github;

pub use github::GitHubTracker;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ProjectConfig;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("issue '{0}' not found")]
    IssueNotFound(String),

    #[error("project has no repo configured")]
    NoRepo,

    #[error("tracker command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("tracker command failed: {0}")]
    CommandFailed(String),
}

/// An issue as the engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueInfo {
    pub id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub completed: bool,
}

/// Issue source (GitHub Issues, Linear, ...).
#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &str;

    async fn issue(&self, issue_id: &str, project: &ProjectConfig)
        -> Result<IssueInfo, TrackerError>;

    async fn is_completed(
        &self,
        issue_id: &str,
        project: &ProjectConfig,
    ) -> Result<bool, TrackerError>;

    fn issue_url(&self, issue_id: &str, project: &ProjectConfig) -> String;

    /// Branch name for a session working this issue.
    fn branch_name(&self, issue_id: &str, project: &ProjectConfig) -> String;

    /// Initial prompt given to the agent for this issue.
    fn generate_prompt(&self, issue: &IssueInfo) -> String;

    async fn list_issues(&self, project: &ProjectConfig) -> Result<Vec<IssueInfo>, TrackerError>;
}

/// Scripted tracker for tests.
#[derive(Default)]
pub struct MockTracker {
    state: std::sync::Mutex<MockTrackerState>,
}

#[derive(Default)]
struct MockTrackerState {
    issues: std::collections::HashMap<String, IssueInfo>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_issue(&self, issue: IssueInfo) {
        self.state
            .lock()
            .unwrap()
            .issues
            .insert(issue.id.clone(), issue);
    }

    pub fn complete_issue(&self, issue_id: &str) {
        if let Some(issue) = self.state.lock().unwrap().issues.get_mut(issue_id) {
            issue.completed = true;
        }
    }
}

#[async_trait]
impl Tracker for MockTracker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn issue(
        &self,
        issue_id: &str,
        _project: &ProjectConfig,
    ) -> Result<IssueInfo, TrackerError> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(issue_id)
            .cloned()
            .ok_or_else(|| TrackerError::IssueNotFound(issue_id.to_string()))
    }

    async fn is_completed(
        &self,
        issue_id: &str,
        _project: &ProjectConfig,
    ) -> Result<bool, TrackerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .issues
            .get(issue_id)
            .is_some_and(|i| i.completed))
    }

    fn issue_url(&self, issue_id: &str, _project: &ProjectConfig) -> String {
        format!("https://issues.example.com/{issue_id}")
    }

    fn branch_name(&self, issue_id: &str, _project: &ProjectConfig) -> String {
        format!("issue/{}", issue_id.to_lowercase())
    }

    fn generate_prompt(&self, issue: &IssueInfo) -> String {
        format!("Work on {}: {}", issue.id, issue.title)
    }

    async fn list_issues(&self, _project: &ProjectConfig) -> Result<Vec<IssueInfo>, TrackerError> {
        Ok(self.state.lock().unwrap().issues.values().cloned().collect())
    }
}
