//! SCM plugins: the source platform that owns PRs, CI, and reviews.

mod github;

pub use github::GitHubScm;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ProjectConfig;
use crate::session::{PrInfo, Session};

#[derive(Error, Debug)]
pub enum ScmError {
    #[error("pull request #{0} not found")]
    PrNotFound(u64),

    #[error("project has no repo configured")]
    NoRepo,

    #[error("scm command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("scm command failed: {0}")]
    CommandFailed(String),
}

/// Lifecycle state of a PR on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// Rolled-up CI state across a PR's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiSummary {
    Passing,
    Failing,
    Pending,
    /// No checks configured.
    None,
}

/// A single CI check run.
#[derive(Debug, Clone, PartialEq)]
pub struct CiCheck {
    pub name: String,
    /// `queued`, `in_progress`, or `completed`.
    pub status: String,
    /// `success`, `failure`, `cancelled`, ... once completed.
    pub conclusion: Option<String>,
}

impl CiCheck {
    pub fn passed(&self) -> bool {
        self.status == "completed"
            && self
                .conclusion
                .as_deref()
                .is_some_and(|c| matches!(c, "success" | "skipped" | "neutral"))
    }

    pub fn failed(&self) -> bool {
        self.status == "completed"
            && self
                .conclusion
                .as_deref()
                .is_some_and(|c| matches!(c, "failure" | "timed_out" | "action_required"))
    }
}

/// Aggregate review decision on a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    Pending,
    /// No review requested or given.
    None,
}

/// A single review.
#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub author: String,
    /// `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`, ...
    pub state: String,
}

/// A review comment on a PR.
#[derive(Debug, Clone, PartialEq)]
pub struct PrComment {
    pub author: String,
    pub body: String,
    /// Whether the author is a bot account.
    pub automated: bool,
}

/// Everything that gates a merge, with human-readable blockers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mergeability {
    pub mergeable: bool,
    pub ci_passing: bool,
    pub approved: bool,
    pub no_conflicts: bool,
    pub blockers: Vec<String>,
}

/// Merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

/// Source-platform adapter covering PR, CI, reviews, and merge readiness.
#[async_trait]
pub trait Scm: Send + Sync {
    fn name(&self) -> &str;

    /// Find the PR opened from this session's branch, if any.
    async fn detect_pr(
        &self,
        session: &Session,
        project: &ProjectConfig,
    ) -> Result<Option<PrInfo>, ScmError>;

    async fn pr_state(&self, pr: &PrInfo) -> Result<PrState, ScmError>;

    async fn merge_pr(&self, pr: &PrInfo, method: Option<MergeMethod>) -> Result<(), ScmError>;

    async fn close_pr(&self, pr: &PrInfo) -> Result<(), ScmError>;

    async fn ci_checks(&self, pr: &PrInfo) -> Result<Vec<CiCheck>, ScmError>;

    async fn ci_summary(&self, pr: &PrInfo) -> Result<CiSummary, ScmError>;

    async fn reviews(&self, pr: &PrInfo) -> Result<Vec<Review>, ScmError>;

    async fn review_decision(&self, pr: &PrInfo) -> Result<ReviewDecision, ScmError>;

    /// Unresolved human review comments.
    async fn pending_comments(&self, pr: &PrInfo) -> Result<Vec<PrComment>, ScmError>;

    /// Comments from automated reviewers (bots).
    async fn automated_comments(&self, pr: &PrInfo) -> Result<Vec<PrComment>, ScmError>;

    async fn mergeability(&self, pr: &PrInfo) -> Result<Mergeability, ScmError>;
}

/// Scripted SCM for tests.
#[derive(Default)]
pub struct MockScm {
    state: std::sync::Mutex<MockScmState>,
}

struct MockScmState {
    detected_pr: Option<PrInfo>,
    pr_state: PrState,
    ci: CiSummary,
    decision: ReviewDecision,
    mergeability: Mergeability,
    fail_all: bool,
    merged_prs: Vec<u64>,
}

impl Default for MockScmState {
    fn default() -> Self {
        Self {
            detected_pr: None,
            pr_state: PrState::Open,
            ci: CiSummary::None,
            decision: ReviewDecision::None,
            mergeability: Mergeability::default(),
            fail_all: false,
            merged_prs: Vec::new(),
        }
    }
}

impl MockScm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detected_pr(&self, pr: Option<PrInfo>) {
        self.state.lock().unwrap().detected_pr = pr;
    }

    pub fn set_pr_state(&self, state: PrState) {
        self.state.lock().unwrap().pr_state = state;
    }

    pub fn set_ci_summary(&self, ci: CiSummary) {
        self.state.lock().unwrap().ci = ci;
    }

    pub fn set_review_decision(&self, decision: ReviewDecision) {
        self.state.lock().unwrap().decision = decision;
    }

    pub fn set_mergeability(&self, mergeability: Mergeability) {
        self.state.lock().unwrap().mergeability = mergeability;
    }

    pub fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    pub fn merged_prs(&self) -> Vec<u64> {
        self.state.lock().unwrap().merged_prs.clone()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, MockScmState>, ScmError> {
        let state = self.state.lock().unwrap();
        if state.fail_all {
            return Err(ScmError::CommandFailed("mock failure".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Scm for MockScm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn detect_pr(
        &self,
        _session: &Session,
        _project: &ProjectConfig,
    ) -> Result<Option<PrInfo>, ScmError> {
        Ok(self.guard()?.detected_pr.clone())
    }

    async fn pr_state(&self, _pr: &PrInfo) -> Result<PrState, ScmError> {
        Ok(self.guard()?.pr_state)
    }

    async fn merge_pr(&self, pr: &PrInfo, _method: Option<MergeMethod>) -> Result<(), ScmError> {
        self.guard()?.merged_prs.push(pr.number);
        Ok(())
    }

    async fn close_pr(&self, _pr: &PrInfo) -> Result<(), ScmError> {
        self.guard()?;
        Ok(())
    }

    async fn ci_checks(&self, _pr: &PrInfo) -> Result<Vec<CiCheck>, ScmError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn ci_summary(&self, _pr: &PrInfo) -> Result<CiSummary, ScmError> {
        Ok(self.guard()?.ci)
    }

    async fn reviews(&self, _pr: &PrInfo) -> Result<Vec<Review>, ScmError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn review_decision(&self, _pr: &PrInfo) -> Result<ReviewDecision, ScmError> {
        Ok(self.guard()?.decision)
    }

    async fn pending_comments(&self, _pr: &PrInfo) -> Result<Vec<PrComment>, ScmError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn automated_comments(&self, _pr: &PrInfo) -> Result<Vec<PrComment>, ScmError> {
        self.guard()?;
        Ok(Vec::new())
    }

    async fn mergeability(&self, _pr: &PrInfo) -> Result<Mergeability, ScmError> {
        Ok(self.guard()?.mergeability.clone())
    }
}
