//! GitHub Issues tracker via the `gh` CLI.
//!
//! `gh` handles authentication itself (`gh auth login`), so no token
//! management lives here.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{IssueInfo, Tracker, TrackerError};
use crate::config::ProjectConfig;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct GitHubTracker;

impl GitHubTracker {
    pub fn new() -> Self {
        Self
    }

    async fn run_gh(args: &[&str]) -> Result<String, TrackerError> {
        debug!(?args, "Running gh command");

        let mut cmd = Command::new("gh");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| TrackerError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| TrackerError::CommandFailed(format!("failed to execute gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TrackerError::CommandFailed(format!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn repo_slug(project: &ProjectConfig) -> Result<&str, TrackerError> {
        project.repo.as_deref().ok_or(TrackerError::NoRepo)
    }

    /// GitHub issue ids are plain numbers; accept `#42` and `GH-42` too.
    fn issue_number(issue_id: &str) -> &str {
        issue_id
            .trim_start_matches('#')
            .trim_start_matches("GH-")
            .trim_start_matches("gh-")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    state: String,
    url: String,
}

impl GhIssue {
    fn into_info(self) -> IssueInfo {
        IssueInfo {
            id: self.number.to_string(),
            title: self.title,
            body: self.body,
            url: self.url,
            completed: self.state.eq_ignore_ascii_case("closed"),
        }
    }
}

#[async_trait]
impl Tracker for GitHubTracker {
    fn name(&self) -> &str {
        "github"
    }

    #[instrument(skip(self, project))]
    async fn issue(
        &self,
        issue_id: &str,
        project: &ProjectConfig,
    ) -> Result<IssueInfo, TrackerError> {
        let repo = Self::repo_slug(project)?;
        let number = Self::issue_number(issue_id);
        let raw = Self::run_gh(&[
            "issue",
            "view",
            number,
            "--repo",
            repo,
            "--json",
            "number,title,body,state,url",
        ])
        .await?;

        let issue: GhIssue = serde_json::from_str(&raw)
            .map_err(|_| TrackerError::IssueNotFound(issue_id.to_string()))?;
        Ok(issue.into_info())
    }

    async fn is_completed(
        &self,
        issue_id: &str,
        project: &ProjectConfig,
    ) -> Result<bool, TrackerError> {
        Ok(self.issue(issue_id, project).await?.completed)
    }

    fn issue_url(&self, issue_id: &str, project: &ProjectConfig) -> String {
        let repo = project.repo.as_deref().unwrap_or_default();
        format!(
            "https://github.com/{repo}/issues/{}",
            Self::issue_number(issue_id)
        )
    }

    fn branch_name(&self, issue_id: &str, _project: &ProjectConfig) -> String {
        format!("issue-{}", Self::issue_number(issue_id))
    }

    fn generate_prompt(&self, issue: &IssueInfo) -> String {
        format!(
            "Work on issue #{id}: {title}\n\n{body}\n\n\
             When you are done, open a pull request that references issue #{id}.\n\
             Issue link: {url}",
            id = issue.id,
            title = issue.title,
            body = issue.body,
            url = issue.url,
        )
    }

    async fn list_issues(&self, project: &ProjectConfig) -> Result<Vec<IssueInfo>, TrackerError> {
        let repo = Self::repo_slug(project)?;
        let raw = Self::run_gh(&[
            "issue",
            "list",
            "--repo",
            repo,
            "--state",
            "open",
            "--json",
            "number,title,body,state,url",
        ])
        .await?;

        let issues: Vec<GhIssue> = serde_json::from_str(&raw)
            .map_err(|e| TrackerError::CommandFailed(format!("bad gh issue list output: {e}")))?;
        Ok(issues.into_iter().map(GhIssue::into_info).collect())
    }
}
