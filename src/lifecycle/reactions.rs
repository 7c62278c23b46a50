//! Reaction engine: configured automatic responses to transition events.
//!
//! Each trigger for a `(session, reaction key)` pair increments an
//! in-memory tracker. While the retry budget lasts, the configured action
//! runs (message to the agent, notification, auto-merge); once attempts
//! or elapsed time cross the escalation threshold, the engine emits
//! `reaction.escalated` and hands the problem to humans instead.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::fanout::NotifierFanout;
use crate::config::{Config, EscalateAfter, ReactionAction, ReactionConfig};
use crate::events::{Event, EventType, Priority};
use crate::session::manager::SessionManager;

/// Per-`(session, key)` retry bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct ReactionTracker {
    pub attempts: u32,
    pub first_triggered: DateTime<Utc>,
}

/// What the engine did with a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// No reaction configured for the key, or the reaction is disabled.
    /// The caller still owns human notification for the transition.
    Unhandled,
    /// The configured action ran (or failed retryably).
    Handled { success: bool },
    /// Retry budget exhausted; humans were notified.
    Escalated,
}

pub struct ReactionEngine {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    fanout: Arc<NotifierFanout>,
    trackers: Mutex<HashMap<(String, String), ReactionTracker>>,
}

impl ReactionEngine {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionManager>,
        fanout: Arc<NotifierFanout>,
    ) -> Self {
        Self {
            config,
            sessions,
            fanout,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one trigger of `key` for the event's session.
    pub async fn trigger(&self, key: &str, event: &Event) -> ReactionOutcome {
        let reactions = self.config.reactions_for(&event.project_id);
        let Some(reaction) = reactions.get(key) else {
            return ReactionOutcome::Unhandled;
        };
        // `auto: false` disables everything except plain notifications.
        if !reaction.auto && reaction.action != ReactionAction::Notify {
            debug!(key, "Reaction disabled by config");
            return ReactionOutcome::Unhandled;
        }

        let tracker = self.bump_tracker(&event.session_id, key, reaction);

        if should_escalate(reaction, &tracker) {
            return self.escalate(key, event, reaction, &tracker).await;
        }

        match reaction.action {
            ReactionAction::SendToAgent => {
                let message = reaction
                    .message
                    .as_deref()
                    .unwrap_or(event.message.as_str());
                match self.sessions.send(&event.session_id, message).await {
                    Ok(()) => {
                        info!(
                            session = %event.session_id,
                            key,
                            attempt = tracker.attempts,
                            "Sent reaction message to agent"
                        );
                        ReactionOutcome::Handled { success: true }
                    }
                    Err(e) => {
                        // Not an escalation: the next poll tick retries.
                        warn!(session = %event.session_id, key, error = %e, "Reaction send failed");
                        ReactionOutcome::Handled { success: false }
                    }
                }
            }
            ReactionAction::Notify => {
                let priority = reaction.priority.unwrap_or(Priority::Info);
                let notification = Event::new(
                    EventType::ReactionTriggered,
                    &event.session_id,
                    &event.project_id,
                    event.message.clone(),
                )
                .with_priority(priority)
                .with_data(reaction_data(key, &tracker, event));
                self.fanout.notify_human(&notification).await;
                ReactionOutcome::Handled { success: true }
            }
            ReactionAction::AutoMerge => {
                // Notify-only for now; the SCM-backed merge is deliberate
                // future work.
                let notification = Event::new(
                    EventType::ReactionTriggered,
                    &event.session_id,
                    &event.project_id,
                    format!("Ready to merge: {}", event.message),
                )
                .with_priority(Priority::Action)
                .with_data(reaction_data(key, &tracker, event));
                self.fanout.notify_human(&notification).await;
                ReactionOutcome::Handled { success: true }
            }
        }
    }

    async fn escalate(
        &self,
        key: &str,
        event: &Event,
        reaction: &ReactionConfig,
        tracker: &ReactionTracker,
    ) -> ReactionOutcome {
        warn!(
            session = %event.session_id,
            key,
            attempts = tracker.attempts,
            "Reaction exhausted, escalating to humans"
        );
        let escalation = Event::new(
            EventType::ReactionEscalated,
            &event.session_id,
            &event.project_id,
            format!("Automation exhausted for {key}: {}", event.message),
        )
        .with_priority(reaction.priority.unwrap_or(Priority::Urgent))
        .with_data(reaction_data(key, tracker, event));
        self.fanout.notify_human(&escalation).await;
        ReactionOutcome::Escalated
    }

    /// Increment the tracker, capping at `retries + 1` so a long-exhausted
    /// reaction does not count attempts forever.
    fn bump_tracker(
        &self,
        session_id: &str,
        key: &str,
        reaction: &ReactionConfig,
    ) -> ReactionTracker {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = trackers
            .entry((session_id.to_string(), key.to_string()))
            .or_insert(ReactionTracker {
                attempts: 0,
                first_triggered: Utc::now(),
            });
        let cap = reaction.retries.map(|r| r + 1);
        if cap.is_none_or(|cap| entry.attempts < cap) {
            entry.attempts += 1;
        }
        *entry
    }

    /// Clear the tracker for a key when its triggering status flips away.
    pub fn clear(&self, session_id: &str, key: &str) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        if trackers
            .remove(&(session_id.to_string(), key.to_string()))
            .is_some()
        {
            debug!(session = %session_id, key, "Cleared reaction tracker");
        }
    }

    /// Drop trackers for sessions no longer present; without this,
    /// retries leak across session lifetimes reusing the same id.
    pub fn prune(&self, live_session_ids: &HashSet<String>) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers.retain(|(session_id, _), _| {
            session_id.is_empty() || live_session_ids.contains(session_id)
        });
    }

    pub fn attempts(&self, session_id: &str, key: &str) -> u32 {
        let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers
            .get(&(session_id.to_string(), key.to_string()))
            .map_or(0, |t| t.attempts)
    }

    #[cfg(test)]
    fn backdate_tracker(&self, session_id: &str, key: &str, first_triggered: DateTime<Utc>) {
        let mut trackers = self.trackers.lock().unwrap();
        if let Some(entry) = trackers.get_mut(&(session_id.to_string(), key.to_string())) {
            entry.first_triggered = first_triggered;
        }
    }
}

fn reaction_data(key: &str, tracker: &ReactionTracker, event: &Event) -> serde_json::Value {
    serde_json::json!({
        "reactionKey": key,
        "attempts": tracker.attempts,
        "firstTriggered": tracker.first_triggered.to_rfc3339(),
        "sourceEvent": event.event_type.as_str(),
    })
}

/// Escalate when attempts exceed `retries`, or when `escalateAfter` is hit
/// (attempt count or elapsed duration), whichever comes first.
fn should_escalate(reaction: &ReactionConfig, tracker: &ReactionTracker) -> bool {
    if reaction.retries.is_some_and(|r| tracker.attempts > r) {
        return true;
    }
    match &reaction.escalate_after {
        Some(EscalateAfter::Attempts(n)) => tracker.attempts > *n,
        Some(EscalateAfter::Elapsed(raw)) => {
            let threshold_ms = parse_duration_ms(raw);
            threshold_ms > 0
                && Utc::now()
                    .signed_duration_since(tracker.first_triggered)
                    .num_milliseconds()
                    >= threshold_ms as i64
        }
        None => false,
    }
}

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(s|m|h)$").expect("static regex"));

/// Parse `30s` / `10m` / `1h` into milliseconds; anything else is 0.
pub fn parse_duration_ms(raw: &str) -> u64 {
    let Some(caps) = DURATION_RE.captures(raw) else {
        return 0;
    };
    let Ok(amount) = caps[1].parse::<u64>() else {
        return 0;
    };
    let unit_ms = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        _ => 3_600_000,
    };
    amount * unit_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifierConfig;
    use crate::plugins::notifier::MockNotifier;
    use crate::plugins::{PluginInstance, PluginManifest, PluginRegistry, PluginSlot};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        engine: ReactionEngine,
        notifier: Arc<MockNotifier>,
    }

    fn harness(reactions: BTreeMap<String, ReactionConfig>) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = tmp.path().join("sessions");
        config.reactions = reactions;
        config.defaults.notifiers = vec!["mock".to_string()];
        config.notifiers.insert(
            "mock".to_string(),
            NotifierConfig {
                plugin: "mock".to_string(),
                options: BTreeMap::new(),
            },
        );
        let config = Arc::new(config);

        let notifier = Arc::new(MockNotifier::new());
        let registry = Arc::new(PluginRegistry::new());
        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "mock", ""),
            PluginInstance::Notifier(notifier.clone()),
        );

        let sessions = Arc::new(SessionManager::new(config.clone(), registry.clone()));
        let fanout = Arc::new(NotifierFanout::new(config.clone(), registry));
        let engine = ReactionEngine::new(config, sessions, fanout);

        Harness {
            _tmp: tmp,
            engine,
            notifier,
        }
    }

    fn notify_reaction() -> ReactionConfig {
        ReactionConfig {
            action: ReactionAction::Notify,
            priority: Some(Priority::Warning),
            ..ReactionConfig::default()
        }
    }

    fn event() -> Event {
        Event::new(EventType::CiFailing, "app-1", "my-app", "CI failing")
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_ms("10m"), 600_000);
        assert_eq!(parse_duration_ms("30s"), 30_000);
        assert_eq!(parse_duration_ms("1h"), 3_600_000);
        assert_eq!(parse_duration_ms("5x"), 0);
        assert_eq!(parse_duration_ms(""), 0);
        assert_eq!(parse_duration_ms("m"), 0);
    }

    #[tokio::test]
    async fn unconfigured_key_is_unhandled() {
        let h = harness(BTreeMap::new());
        assert_eq!(
            h.engine.trigger("ci-failed", &event()).await,
            ReactionOutcome::Unhandled
        );
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn disabled_non_notify_reaction_is_unhandled() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                auto: false,
                action: ReactionAction::SendToAgent,
                message: Some("fix".to_string()),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);
        assert_eq!(
            h.engine.trigger("ci-failed", &event()).await,
            ReactionOutcome::Unhandled
        );
    }

    #[tokio::test]
    async fn disabled_notify_reaction_still_notifies() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                auto: false,
                ..notify_reaction()
            },
        );
        let h = harness(reactions);
        assert_eq!(
            h.engine.trigger("ci-failed", &event()).await,
            ReactionOutcome::Handled { success: true }
        );
        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ReactionTriggered);
        assert_eq!(events[0].priority, Priority::Warning);
    }

    #[tokio::test]
    async fn send_to_missing_session_is_retryable_not_escalated() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                action: ReactionAction::SendToAgent,
                message: Some("Fix CI".to_string()),
                retries: Some(3),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);

        // No session exists in the store, so the send fails.
        let outcome = h.engine.trigger("ci-failed", &event()).await;
        assert_eq!(outcome, ReactionOutcome::Handled { success: false });
        assert!(h.notifier.events().is_empty());
        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 1);
    }

    #[tokio::test]
    async fn escalates_after_retries_exhausted() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                action: ReactionAction::SendToAgent,
                message: Some("Fix CI".to_string()),
                retries: Some(3),
                escalate_after: Some(EscalateAfter::Attempts(3)),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);

        for attempt in 1..=3 {
            let outcome = h.engine.trigger("ci-failed", &event()).await;
            assert_eq!(outcome, ReactionOutcome::Handled { success: false });
            assert_eq!(h.engine.attempts("app-1", "ci-failed"), attempt);
            assert!(h.notifier.events().is_empty());
        }

        // Fourth trigger: attempts becomes 4 > retries=3.
        let outcome = h.engine.trigger("ci-failed", &event()).await;
        assert_eq!(outcome, ReactionOutcome::Escalated);

        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ReactionEscalated);
        assert_eq!(events[0].priority, Priority::Urgent);

        // Attempts cap at retries + 1; further triggers keep escalating
        // without counting up.
        let outcome = h.engine.trigger("ci-failed", &event()).await;
        assert_eq!(outcome, ReactionOutcome::Escalated);
        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 4);
    }

    #[tokio::test]
    async fn escalates_after_elapsed_duration() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "agent-stuck".to_string(),
            ReactionConfig {
                action: ReactionAction::Notify,
                escalate_after: Some(EscalateAfter::Elapsed("10m".to_string())),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);
        let event = Event::new(EventType::SessionStuck, "app-1", "my-app", "stuck");

        let outcome = h.engine.trigger("agent-stuck", &event).await;
        assert_eq!(outcome, ReactionOutcome::Handled { success: true });

        // Pretend the first trigger was 11 minutes ago.
        h.engine.backdate_tracker(
            "app-1",
            "agent-stuck",
            Utc::now() - chrono::Duration::minutes(11),
        );

        let outcome = h.engine.trigger("agent-stuck", &event).await;
        assert_eq!(outcome, ReactionOutcome::Escalated);
    }

    #[tokio::test]
    async fn clear_resets_the_retry_budget() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                action: ReactionAction::SendToAgent,
                retries: Some(1),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);

        h.engine.trigger("ci-failed", &event()).await;
        h.engine.trigger("ci-failed", &event()).await;
        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 2);

        h.engine.clear("app-1", "ci-failed");
        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 0);

        let outcome = h.engine.trigger("ci-failed", &event()).await;
        assert_eq!(outcome, ReactionOutcome::Handled { success: false });
        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 1);
    }

    #[tokio::test]
    async fn prune_drops_vanished_sessions_only() {
        let mut reactions = BTreeMap::new();
        reactions.insert("ci-failed".to_string(), notify_reaction());
        let h = harness(reactions);

        h.engine.trigger("ci-failed", &event()).await;
        let other = Event::new(EventType::CiFailing, "app-2", "my-app", "CI failing");
        h.engine.trigger("ci-failed", &other).await;

        let live: HashSet<String> = ["app-2".to_string()].into_iter().collect();
        h.engine.prune(&live);

        assert_eq!(h.engine.attempts("app-1", "ci-failed"), 0);
        assert_eq!(h.engine.attempts("app-2", "ci-failed"), 1);
    }

    #[tokio::test]
    async fn auto_merge_notifies_at_action_priority() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "approved-and-green".to_string(),
            ReactionConfig {
                action: ReactionAction::AutoMerge,
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);
        let event = Event::new(EventType::MergeReady, "app-1", "my-app", "PR #9 green");

        let outcome = h.engine.trigger("approved-and-green", &event).await;
        assert_eq!(outcome, ReactionOutcome::Handled { success: true });

        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].priority, Priority::Action);
        assert!(events[0].message.contains("Ready to merge"));
    }
}
