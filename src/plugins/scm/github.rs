//! GitHub SCM plugin over the `gh` CLI.
//!
//! `gh`'s `--json` output is the wire format here; each probe asks for
//! exactly the fields it consumes. Authentication is `gh auth login`'s
//! problem, not ours.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{
    CiCheck, CiSummary, MergeMethod, Mergeability, PrComment, PrState, Review, ReviewDecision,
    Scm, ScmError,
};
use crate::config::ProjectConfig;
use crate::session::{PrInfo, Session};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct GitHubScm;

impl GitHubScm {
    pub fn new() -> Self {
        Self
    }

    async fn run_gh(args: &[&str]) -> Result<String, ScmError> {
        debug!(?args, "Running gh command");

        let mut cmd = Command::new("gh");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ScmError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| ScmError::CommandFailed(format!("failed to execute gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScmError::CommandFailed(format!(
                "gh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn repo_arg(pr: &PrInfo) -> String {
        format!("{}/{}", pr.owner, pr.repo)
    }

    async fn view_pr(pr: &PrInfo, fields: &str) -> Result<String, ScmError> {
        let repo = Self::repo_arg(pr);
        let number = pr.number.to_string();
        Self::run_gh(&["pr", "view", &number, "--repo", &repo, "--json", fields]).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPrListEntry {
    number: u64,
    url: String,
    title: String,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    head_ref_name: Option<String>,
    #[serde(default)]
    base_ref_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPrView {
    #[serde(default)]
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    #[serde(default)]
    review_decision: Option<String>,
    #[serde(default)]
    mergeable: Option<String>,
    #[serde(default)]
    status_check_rollup: Vec<GhCheck>,
    #[serde(default)]
    reviews: Vec<GhReview>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhCheck {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl GhCheck {
    /// `statusCheckRollup` mixes check runs (status/conclusion) and legacy
    /// commit statuses (state); normalize both shapes.
    fn into_check(self) -> CiCheck {
        let name = self.name.or(self.context).unwrap_or_default();
        match self.state {
            Some(state) => {
                let (status, conclusion) = match state.as_str() {
                    "SUCCESS" => ("completed", Some("success")),
                    "FAILURE" | "ERROR" => ("completed", Some("failure")),
                    _ => ("in_progress", None),
                };
                CiCheck {
                    name,
                    status: status.to_string(),
                    conclusion: conclusion.map(str::to_string),
                }
            }
            None => CiCheck {
                name,
                status: self
                    .status
                    .map(|s| s.to_ascii_lowercase())
                    .unwrap_or_else(|| "queued".to_string()),
                conclusion: self.conclusion.map(|c| c.to_ascii_lowercase()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhReview {
    #[serde(default)]
    author: GhAuthor,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
struct GhAuthor {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    #[serde(default)]
    user: GhUser,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct GhUser {
    #[serde(default)]
    login: String,
    #[serde(default, rename = "type")]
    user_type: String,
}

fn summarize_checks(checks: &[CiCheck]) -> CiSummary {
    if checks.is_empty() {
        return CiSummary::None;
    }
    if checks.iter().any(CiCheck::failed) {
        return CiSummary::Failing;
    }
    if checks.iter().all(CiCheck::passed) {
        return CiSummary::Passing;
    }
    CiSummary::Pending
}

fn parse_review_decision(raw: Option<&str>) -> ReviewDecision {
    match raw {
        Some("APPROVED") => ReviewDecision::Approved,
        Some("CHANGES_REQUESTED") => ReviewDecision::ChangesRequested,
        Some("REVIEW_REQUIRED") => ReviewDecision::Pending,
        _ => ReviewDecision::None,
    }
}

#[async_trait]
impl Scm for GitHubScm {
    fn name(&self) -> &str {
        "github"
    }

    #[instrument(skip(self, session, project), fields(session = %session.id))]
    async fn detect_pr(
        &self,
        session: &Session,
        project: &ProjectConfig,
    ) -> Result<Option<PrInfo>, ScmError> {
        if session.branch.is_empty() {
            return Ok(None);
        }
        let repo = project.repo.as_deref().ok_or(ScmError::NoRepo)?;

        let raw = Self::run_gh(&[
            "pr",
            "list",
            "--repo",
            repo,
            "--head",
            &session.branch,
            "--state",
            "all",
            "--json",
            "number,url,title,isDraft,headRefName,baseRefName",
        ])
        .await?;

        let entries: Vec<GhPrListEntry> = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr list output: {e}")))?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let (owner, repo_name) = repo.split_once('/').unwrap_or((repo, ""));
        Ok(Some(PrInfo {
            number: entry.number,
            url: entry.url,
            title: Some(entry.title),
            owner: owner.to_string(),
            repo: repo_name.to_string(),
            branch: entry.head_ref_name,
            base_branch: entry.base_ref_name,
            is_draft: entry.is_draft,
        }))
    }

    async fn pr_state(&self, pr: &PrInfo) -> Result<PrState, ScmError> {
        let raw = Self::view_pr(pr, "state,mergedAt").await?;
        let view: GhPrView = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr view output: {e}")))?;

        if view.merged_at.is_some() || view.state.eq_ignore_ascii_case("merged") {
            Ok(PrState::Merged)
        } else if view.state.eq_ignore_ascii_case("closed") {
            Ok(PrState::Closed)
        } else {
            Ok(PrState::Open)
        }
    }

    async fn merge_pr(&self, pr: &PrInfo, method: Option<MergeMethod>) -> Result<(), ScmError> {
        let repo = Self::repo_arg(pr);
        let number = pr.number.to_string();
        let flag = match method.unwrap_or(MergeMethod::Squash) {
            MergeMethod::Merge => "--merge",
            MergeMethod::Squash => "--squash",
            MergeMethod::Rebase => "--rebase",
        };
        Self::run_gh(&["pr", "merge", &number, "--repo", &repo, flag]).await?;
        Ok(())
    }

    async fn close_pr(&self, pr: &PrInfo) -> Result<(), ScmError> {
        let repo = Self::repo_arg(pr);
        let number = pr.number.to_string();
        Self::run_gh(&["pr", "close", &number, "--repo", &repo]).await?;
        Ok(())
    }

    async fn ci_checks(&self, pr: &PrInfo) -> Result<Vec<CiCheck>, ScmError> {
        let raw = Self::view_pr(pr, "statusCheckRollup").await?;
        let view: GhPrView = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr view output: {e}")))?;
        Ok(view
            .status_check_rollup
            .into_iter()
            .map(GhCheck::into_check)
            .collect())
    }

    async fn ci_summary(&self, pr: &PrInfo) -> Result<CiSummary, ScmError> {
        let checks = self.ci_checks(pr).await?;
        Ok(summarize_checks(&checks))
    }

    async fn reviews(&self, pr: &PrInfo) -> Result<Vec<Review>, ScmError> {
        let raw = Self::view_pr(pr, "reviews").await?;
        let view: GhPrView = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr view output: {e}")))?;
        Ok(view
            .reviews
            .into_iter()
            .map(|r| Review {
                author: r.author.login,
                state: r.state,
            })
            .collect())
    }

    async fn review_decision(&self, pr: &PrInfo) -> Result<ReviewDecision, ScmError> {
        let raw = Self::view_pr(pr, "reviewDecision").await?;
        let view: GhPrView = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr view output: {e}")))?;
        Ok(parse_review_decision(view.review_decision.as_deref()))
    }

    async fn pending_comments(&self, pr: &PrInfo) -> Result<Vec<PrComment>, ScmError> {
        let comments = self.fetch_comments(pr).await?;
        Ok(comments.into_iter().filter(|c| !c.automated).collect())
    }

    async fn automated_comments(&self, pr: &PrInfo) -> Result<Vec<PrComment>, ScmError> {
        let comments = self.fetch_comments(pr).await?;
        Ok(comments.into_iter().filter(|c| c.automated).collect())
    }

    async fn mergeability(&self, pr: &PrInfo) -> Result<Mergeability, ScmError> {
        let raw = Self::view_pr(pr, "mergeable,reviewDecision,statusCheckRollup").await?;
        let view: GhPrView = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh pr view output: {e}")))?;

        let checks: Vec<CiCheck> = view
            .status_check_rollup
            .into_iter()
            .map(GhCheck::into_check)
            .collect();
        let summary = summarize_checks(&checks);
        let ci_passing = matches!(summary, CiSummary::Passing | CiSummary::None);
        let approved =
            parse_review_decision(view.review_decision.as_deref()) == ReviewDecision::Approved;
        let no_conflicts = view
            .mergeable
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case("mergeable"));

        let mut blockers = Vec::new();
        if !ci_passing {
            blockers.push("CI checks are not passing".to_string());
        }
        if !approved {
            blockers.push("PR is not approved".to_string());
        }
        if !no_conflicts {
            blockers.push("PR has merge conflicts".to_string());
        }

        Ok(Mergeability {
            mergeable: blockers.is_empty(),
            ci_passing,
            approved,
            no_conflicts,
            blockers,
        })
    }
}

impl GitHubScm {
    async fn fetch_comments(&self, pr: &PrInfo) -> Result<Vec<PrComment>, ScmError> {
        let endpoint = format!(
            "repos/{}/{}/pulls/{}/comments",
            pr.owner, pr.repo, pr.number
        );
        let raw = Self::run_gh(&["api", &endpoint]).await?;
        let comments: Vec<GhComment> = serde_json::from_str(&raw)
            .map_err(|e| ScmError::CommandFailed(format!("bad gh api output: {e}")))?;

        Ok(comments
            .into_iter()
            .map(|c| {
                let automated =
                    c.user.user_type == "Bot" || c.user.login.ends_with("[bot]");
                PrComment {
                    author: c.user.login,
                    body: c.body,
                    automated,
                }
            })
            .collect())
    }
}
