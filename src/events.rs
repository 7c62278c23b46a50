//! Engine events and notification priorities.
//!
//! Every observable transition becomes an [`Event`] with a closed
//! [`EventType`]. Priorities route events to notifier sets; when neither
//! the reaction config nor the caller specifies one, it is inferred from
//! the event type's dotted name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::session::{Session, SessionStatus};

/// Notification priority, highest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    Action,
    Warning,
    Info,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Action => "action",
            Priority::Warning => "warning",
            Priority::Info => "info",
        }
    }

    /// Infer a priority from an event type's dotted name.
    pub fn infer(event_type: EventType) -> Self {
        let name = event_type.as_str();
        if name.contains("stuck") || name.contains("needs_input") || name.contains("errored") {
            Priority::Urgent
        } else if name.starts_with("summary.") {
            Priority::Info
        } else if name.contains("approved")
            || name.contains("ready")
            || name.contains("merged")
            || name.contains("completed")
        {
            Priority::Action
        } else if name.contains("fail")
            || name.contains("changes_requested")
            || name.contains("conflicts")
        {
            Priority::Warning
        } else {
            Priority::Info
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of event types the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionSpawned,
    SessionWorking,
    SessionNeedsInput,
    SessionStuck,
    SessionErrored,
    SessionKilled,
    PrCreated,
    CiFailing,
    ReviewPending,
    ReviewChangesRequested,
    ReviewApproved,
    MergeReady,
    MergeConflicts,
    MergeCompleted,
    AutomatedReviewFound,
    ReactionTriggered,
    ReactionEscalated,
    SummaryAllComplete,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::SessionSpawned => "session.spawned",
            EventType::SessionWorking => "session.working",
            EventType::SessionNeedsInput => "session.needs_input",
            EventType::SessionStuck => "session.stuck",
            EventType::SessionErrored => "session.errored",
            EventType::SessionKilled => "session.killed",
            EventType::PrCreated => "pr.created",
            EventType::CiFailing => "ci.failing",
            EventType::ReviewPending => "review.pending",
            EventType::ReviewChangesRequested => "review.changes_requested",
            EventType::ReviewApproved => "review.approved",
            EventType::MergeReady => "merge.ready",
            EventType::MergeConflicts => "merge.conflicts",
            EventType::MergeCompleted => "merge.completed",
            EventType::AutomatedReviewFound => "automated_review.found",
            EventType::ReactionTriggered => "reaction.triggered",
            EventType::ReactionEscalated => "reaction.escalated",
            EventType::SummaryAllComplete => "summary.all_complete",
        }
    }

    /// Event emitted when a session transitions into `status`.
    /// Unmapped statuses yield no event.
    pub const fn for_status(status: SessionStatus) -> Option<EventType> {
        match status {
            SessionStatus::Working => Some(EventType::SessionWorking),
            SessionStatus::PrOpen => Some(EventType::PrCreated),
            SessionStatus::CiFailed => Some(EventType::CiFailing),
            SessionStatus::ReviewPending => Some(EventType::ReviewPending),
            SessionStatus::ChangesRequested => Some(EventType::ReviewChangesRequested),
            SessionStatus::Approved => Some(EventType::ReviewApproved),
            SessionStatus::Mergeable => Some(EventType::MergeReady),
            SessionStatus::Merged => Some(EventType::MergeCompleted),
            SessionStatus::NeedsInput => Some(EventType::SessionNeedsInput),
            SessionStatus::Stuck => Some(EventType::SessionStuck),
            SessionStatus::Errored => Some(EventType::SessionErrored),
            SessionStatus::Killed => Some(EventType::SessionKilled),
            _ => None,
        }
    }

    /// Configured reaction key for this event, if it has one.
    pub const fn reaction_key(self) -> Option<&'static str> {
        match self {
            EventType::CiFailing => Some("ci-failed"),
            EventType::ReviewChangesRequested => Some("changes-requested"),
            EventType::AutomatedReviewFound => Some("bugbot-comments"),
            EventType::MergeConflicts => Some("merge-conflicts"),
            EventType::MergeReady => Some("approved-and-green"),
            EventType::SessionStuck => Some("agent-stuck"),
            EventType::SessionNeedsInput => Some("agent-needs-input"),
            EventType::SessionKilled => Some("agent-exited"),
            EventType::SummaryAllComplete => Some("all-complete"),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed transition or reaction outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub priority: Priority,
    pub session_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Build an event with inferred priority.
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            priority: Priority::infer(event_type),
            session_id: session_id.into(),
            project_id: project_id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Build an event for a session transition.
    pub fn for_session(event_type: EventType, session: &Session, message: impl Into<String>) -> Self {
        let mut event = Self::new(event_type, &session.id, &session.project_id, message);
        event.data = serde_json::json!({
            "status": session.status.as_str(),
            "activity": session.activity.map(|a| a.as_str()),
            "branch": session.branch,
            "pr": session.pr.as_ref().map(|pr| pr.url.clone()),
        });
        event
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_names() {
        assert_eq!(EventType::SessionNeedsInput.as_str(), "session.needs_input");
        assert_eq!(EventType::MergeReady.as_str(), "merge.ready");
        assert_eq!(
            EventType::AutomatedReviewFound.as_str(),
            "automated_review.found"
        );
        assert_eq!(
            EventType::SummaryAllComplete.as_str(),
            "summary.all_complete"
        );
    }

    #[test]
    fn status_to_event_mapping() {
        assert_eq!(
            EventType::for_status(SessionStatus::Working),
            Some(EventType::SessionWorking)
        );
        assert_eq!(
            EventType::for_status(SessionStatus::PrOpen),
            Some(EventType::PrCreated)
        );
        assert_eq!(
            EventType::for_status(SessionStatus::Mergeable),
            Some(EventType::MergeReady)
        );
        assert_eq!(
            EventType::for_status(SessionStatus::Merged),
            Some(EventType::MergeCompleted)
        );
        // Statuses outside the table emit nothing.
        assert_eq!(EventType::for_status(SessionStatus::Spawning), None);
        assert_eq!(EventType::for_status(SessionStatus::Cleanup), None);
        assert_eq!(EventType::for_status(SessionStatus::Done), None);
    }

    #[test]
    fn event_to_reaction_key_mapping() {
        assert_eq!(EventType::CiFailing.reaction_key(), Some("ci-failed"));
        assert_eq!(
            EventType::ReviewChangesRequested.reaction_key(),
            Some("changes-requested")
        );
        assert_eq!(
            EventType::MergeReady.reaction_key(),
            Some("approved-and-green")
        );
        assert_eq!(EventType::SessionKilled.reaction_key(), Some("agent-exited"));
        assert_eq!(
            EventType::SummaryAllComplete.reaction_key(),
            Some("all-complete")
        );
        assert_eq!(EventType::PrCreated.reaction_key(), None);
        assert_eq!(EventType::MergeCompleted.reaction_key(), None);
    }

    #[test]
    fn priority_inference() {
        assert_eq!(Priority::infer(EventType::SessionStuck), Priority::Urgent);
        assert_eq!(
            Priority::infer(EventType::SessionNeedsInput),
            Priority::Urgent
        );
        assert_eq!(Priority::infer(EventType::SessionErrored), Priority::Urgent);
        assert_eq!(
            Priority::infer(EventType::SummaryAllComplete),
            Priority::Info
        );
        assert_eq!(Priority::infer(EventType::ReviewApproved), Priority::Action);
        assert_eq!(Priority::infer(EventType::MergeReady), Priority::Action);
        assert_eq!(Priority::infer(EventType::MergeCompleted), Priority::Action);
        assert_eq!(Priority::infer(EventType::CiFailing), Priority::Warning);
        assert_eq!(
            Priority::infer(EventType::ReviewChangesRequested),
            Priority::Warning
        );
        assert_eq!(Priority::infer(EventType::MergeConflicts), Priority::Warning);
        assert_eq!(Priority::infer(EventType::PrCreated), Priority::Info);
        assert_eq!(Priority::infer(EventType::ReviewPending), Priority::Info);
    }

    #[test]
    fn event_builder_infers_priority() {
        let event = Event::new(EventType::CiFailing, "app-1", "my-app", "CI failing");
        assert_eq!(event.priority, Priority::Warning);
        assert_eq!(event.session_id, "app-1");
        assert!(event.data.is_null());

        let event = event.with_priority(Priority::Urgent);
        assert_eq!(event.priority, Priority::Urgent);
    }
}
