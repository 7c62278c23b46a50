//! Session model: lifecycle status, activity classification, and the
//! reconstruction of [`Session`] values from persisted metadata.

pub mod manager;
pub mod metadata;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use metadata::{keys, MetadataRecord};

/// Persisted lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Working,
    PrOpen,
    CiFailed,
    ReviewPending,
    ChangesRequested,
    Approved,
    Mergeable,
    Merged,
    Cleanup,
    NeedsInput,
    Stuck,
    Errored,
    Killed,
    Done,
    Terminated,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Spawning => "spawning",
            SessionStatus::Working => "working",
            SessionStatus::PrOpen => "pr_open",
            SessionStatus::CiFailed => "ci_failed",
            SessionStatus::ReviewPending => "review_pending",
            SessionStatus::ChangesRequested => "changes_requested",
            SessionStatus::Approved => "approved",
            SessionStatus::Mergeable => "mergeable",
            SessionStatus::Merged => "merged",
            SessionStatus::Cleanup => "cleanup",
            SessionStatus::NeedsInput => "needs_input",
            SessionStatus::Stuck => "stuck",
            SessionStatus::Errored => "errored",
            SessionStatus::Killed => "killed",
            SessionStatus::Done => "done",
            SessionStatus::Terminated => "terminated",
        }
    }

    /// Coercing parse: unknown strings become `spawning`, and the legacy
    /// `starting` status maps to `working`.
    pub fn parse(s: &str) -> Self {
        match s {
            "spawning" => SessionStatus::Spawning,
            "working" | "starting" => SessionStatus::Working,
            "pr_open" => SessionStatus::PrOpen,
            "ci_failed" => SessionStatus::CiFailed,
            "review_pending" => SessionStatus::ReviewPending,
            "changes_requested" => SessionStatus::ChangesRequested,
            "approved" => SessionStatus::Approved,
            "mergeable" => SessionStatus::Mergeable,
            "merged" => SessionStatus::Merged,
            "cleanup" => SessionStatus::Cleanup,
            "needs_input" => SessionStatus::NeedsInput,
            "stuck" => SessionStatus::Stuck,
            "errored" => SessionStatus::Errored,
            "killed" => SessionStatus::Killed,
            "done" => SessionStatus::Done,
            "terminated" => SessionStatus::Terminated,
            _ => SessionStatus::Spawning,
        }
    }

    /// Absorbing states the polling loop filters out.
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Merged | SessionStatus::Killed)
    }

    /// Terminal-for-display set, wider than the engine's filter.
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            SessionStatus::Merged
                | SessionStatus::Killed
                | SessionStatus::Done
                | SessionStatus::Terminated
                | SessionStatus::Cleanup
        )
    }

    /// Statuses that only exist on the merge axis; assigned only when the
    /// session has a detected PR.
    pub const fn requires_pr(self) -> bool {
        matches!(
            self,
            SessionStatus::PrOpen
                | SessionStatus::CiFailed
                | SessionStatus::ReviewPending
                | SessionStatus::ChangesRequested
                | SessionStatus::Approved
                | SessionStatus::Mergeable
                | SessionStatus::Merged
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of what the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    /// Finished a turn and showing its prompt; distinct from `Idle` for
    /// notifier display, collapsed with it for status derivation.
    Ready,
    Idle,
    WaitingInput,
    Blocked,
    Exited,
}

impl ActivityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActivityState::Active => "active",
            ActivityState::Ready => "ready",
            ActivityState::Idle => "idle",
            ActivityState::WaitingInput => "waiting_input",
            ActivityState::Blocked => "blocked",
            ActivityState::Exited => "exited",
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque address of the session's process host, owned by the runtime
/// plugin that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeHandle {
    pub id: String,
    pub runtime_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RuntimeHandle {
    pub fn new(id: impl Into<String>, runtime_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime_name: runtime_name.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Parse a handle from its metadata JSON form. Malformed JSON yields
    /// `None` rather than an error.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Pull request record attached to a session once detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub is_draft: bool,
}

static GITHUB_PR_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com/([^/]+)/([^/]+)/pull/(\d+)").expect("static regex")
});
static TRAILING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d+)/?$").expect("static regex"));

impl PrInfo {
    /// Parse a PR record from a URL: a full GitHub pull URL when it
    /// matches, otherwise any URL with a trailing numeric segment.
    pub fn parse_url(url: &str) -> Option<Self> {
        if let Some(caps) = GITHUB_PR_URL.captures(url) {
            let number = caps[3].parse().ok()?;
            return Some(Self {
                number,
                url: url.to_string(),
                title: None,
                owner: caps[1].to_string(),
                repo: caps[2].to_string(),
                branch: None,
                base_branch: None,
                is_draft: false,
            });
        }

        let caps = TRAILING_NUMBER.captures(url)?;
        let number = caps[1].parse().ok()?;
        Some(Self {
            number,
            url: url.to_string(),
            title: None,
            owner: String::new(),
            repo: String::new(),
            branch: None,
            base_branch: None,
            is_draft: false,
        })
    }
}

/// Summary extracted from the agent's own log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub summary: Option<String>,
    pub cost_usd: Option<f64>,
    pub last_log_at: Option<DateTime<Utc>>,
}

/// One agent working, in isolation, toward closing one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub activity: Option<ActivityState>,
    pub branch: String,
    pub issue_id: Option<String>,
    pub pr: Option<PrInfo>,
    pub workspace_path: PathBuf,
    pub runtime_handle: Option<RuntimeHandle>,
    pub agent_info: Option<AgentInfo>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// The raw key=value record this session was reconstructed from.
    pub metadata: MetadataRecord,
}

impl Session {
    /// Reconstruct a session from its persisted metadata record.
    ///
    /// Coercions: unknown status strings become `spawning`, a malformed
    /// runtime handle becomes `None`, a missing `createdAt` defaults to
    /// now, and `summary` lifts into [`AgentInfo`].
    pub fn from_record(record: MetadataRecord) -> Self {
        let status = record
            .get(keys::STATUS)
            .map_or(SessionStatus::Spawning, SessionStatus::parse);
        let pr = record.get(keys::PR).and_then(PrInfo::parse_url);
        let runtime_handle = record.get(keys::RUNTIME_HANDLE).and_then(RuntimeHandle::from_json);
        let created_at = record
            .get(keys::CREATED_AT)
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let agent_info = record.get(keys::SUMMARY).map(|summary| AgentInfo {
            summary: Some(summary.to_string()),
            ..AgentInfo::default()
        });

        Self {
            id: record.session_id().to_string(),
            project_id: record.project_id().to_string(),
            status,
            activity: None,
            branch: record.get(keys::BRANCH).unwrap_or_default().to_string(),
            issue_id: record.get(keys::ISSUE).map(str::to_string),
            pr,
            workspace_path: PathBuf::from(record.get(keys::WORKTREE).unwrap_or_default()),
            runtime_handle,
            agent_info,
            created_at,
            last_activity_at: None,
            metadata: record,
        }
    }
}
