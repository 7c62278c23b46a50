//! Lifecycle manager: the periodic control loop.
//!
//! Each tick lists sessions, derives every non-settled session's status
//! from three independent signals (runtime liveness, agent activity, PR
//! state), persists transitions, and hands the resulting events to the
//! reaction engine. Ticks are non-reentrant; the per-session checks
//! inside a tick run concurrently and tolerate individual failures.

pub mod fanout;
pub mod reactions;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::events::{Event, EventType, Priority};
use crate::plugins::PluginRegistry;
use crate::session::manager::{ManagerError, SessionManager};
use crate::session::metadata::keys;
use crate::session::{ActivityState, Session, SessionStatus};
use fanout::NotifierFanout;
use reactions::{ReactionEngine, ReactionOutcome};

/// Terminal lines fetched per activity probe.
const OUTPUT_LINES: u32 = 100;

/// Reaction key for the whole-fleet completion summary.
const ALL_COMPLETE_KEY: &str = "all-complete";

struct LoopControl {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

pub struct LifecycleManager {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    sessions: Arc<SessionManager>,
    fanout: Arc<NotifierFanout>,
    reactions: ReactionEngine,
    /// Last status the engine tracked per session id.
    states: Mutex<HashMap<String, SessionStatus>>,
    /// Tick non-reentrancy guard.
    polling: AtomicBool,
    /// Set once the all-complete summary fired; reset by any session
    /// transitioning to a non-terminal status.
    all_complete_emitted: AtomicBool,
    control: Mutex<Option<LoopControl>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PluginRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let fanout = Arc::new(NotifierFanout::new(config.clone(), registry.clone()));
        let reactions = ReactionEngine::new(config.clone(), sessions.clone(), fanout.clone());
        Self {
            config,
            registry,
            sessions,
            fanout,
            reactions,
            states: Mutex::new(HashMap::new()),
            polling: AtomicBool::new(false),
            all_complete_emitted: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    pub fn reactions(&self) -> &ReactionEngine {
        &self.reactions
    }

    /// Start the repeating poll loop. A second start while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if control.is_some() {
            debug!("Lifecycle loop already running");
            return;
        }

        info!(?interval, "Starting lifecycle loop");
        let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => this.tick().await,
                }
            }
            debug!("Lifecycle loop stopped");
        });

        *control = Some(LoopControl { shutdown, task });
    }

    /// Stop the loop: the next scheduled tick is cancelled, an in-flight
    /// tick runs to completion. Idempotent.
    pub async fn stop(&self) {
        let control = {
            let mut guard = self.control.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(control) = control else {
            return;
        };
        let _ = control.shutdown.send(()).await;
        if let Err(e) = control.task.await {
            warn!(error = %e, "Lifecycle loop task ended abnormally");
        }
        info!("Stopped lifecycle loop");
    }

    pub fn is_running(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Run a single tick immediately (same non-reentrancy guard as the
    /// timer path).
    pub async fn poll_now(self: &Arc<Self>) {
        self.tick().await;
    }

    async fn tick(self: &Arc<Self>) {
        if self
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous tick still running, skipping");
            return;
        }
        self.run_tick().await;
        self.polling.store(false, Ordering::SeqCst);
    }

    async fn run_tick(self: &Arc<Self>) {
        let sessions = match self.sessions.list(None).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to list sessions, skipping tick");
                return;
            }
        };

        // Check sessions that are not terminal, plus any whose observed
        // status differs from what we last tracked (so a runtime death
        // noticed by list() still gets its transition processed).
        let selected: Vec<Session> = {
            let tracked = self.states.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .iter()
                .filter(|s| {
                    !s.status.is_terminal() || tracked.get(&s.id) != Some(&s.status)
                })
                .cloned()
                .collect()
        };

        let mut checks = JoinSet::new();
        for session in selected {
            let this = Arc::clone(self);
            checks.spawn(async move {
                if let Err(e) = this.check(&session).await {
                    warn!(session = %session.id, error = %e, "Session check failed");
                }
            });
        }
        while let Some(result) = checks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Session check task failed");
            }
        }

        // Forget sessions that disappeared from the listing, and their
        // reaction trackers with them.
        let live: HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.retain(|id, _| live.contains(id));
        }
        self.reactions.prune(&live);

        self.maybe_emit_all_complete(&sessions).await;
    }

    /// Check one session: derive its status, persist a transition, and
    /// dispatch the resulting event.
    #[instrument(skip(self, session), fields(session = %session.id))]
    pub async fn check(&self, session: &Session) -> Result<SessionStatus, ManagerError> {
        let current = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.get(&session.id).copied().unwrap_or(session.status)
        };

        let mut probe = session.clone();
        probe.status = current;
        let new_status = self.determine_status(&mut probe).await;

        // A PR detected during this check is persisted regardless of
        // whether the status moved.
        if probe.pr != session.pr {
            if let Some(pr) = &probe.pr {
                if let Err(e) = self.sessions.store().update(
                    &probe.project_id,
                    &probe.id,
                    &[(keys::PR, Some(pr.url.clone()))],
                ) {
                    warn!(session = %probe.id, error = %e, "Failed to persist detected PR");
                }
            }
        }

        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.insert(session.id.clone(), new_status);
        }

        if new_status == current {
            // No transition, but a persisting reaction-keyed status still
            // advances its retry budget (and eventually escalates).
            self.retrigger(&probe, new_status).await;
            return Ok(new_status);
        }

        probe.status = new_status;
        self.apply_transition(&probe, current, new_status).await?;
        Ok(new_status)
    }

    /// Derive the session's status from signals, in priority order:
    /// runtime liveness, then agent activity, then PR state, then the
    /// default recovery rule.
    async fn determine_status(&self, session: &mut Session) -> SessionStatus {
        let current = session.status;

        match self.probe_runtime_and_agent(session).await {
            Ok(Some(decided)) => return decided,
            Ok(None) => {}
            Err(e) => {
                debug!(session = %session.id, error = %e, "Runtime/agent probe failed");
                // A session already waiting on a human stays that way when
                // we cannot observe it; never coerce it back to working.
                if matches!(current, SessionStatus::Stuck | SessionStatus::NeedsInput) {
                    return current;
                }
            }
        }

        if let Some(project) = self.config.project(&session.project_id) {
            if let Some(scm) = project
                .scm
                .as_deref()
                .and_then(|name| self.registry.scm(name))
            {
                if session.pr.is_none() {
                    match scm.detect_pr(session, project).await {
                        Ok(found) => session.pr = found,
                        Err(e) => {
                            debug!(session = %session.id, error = %e, "PR detection failed");
                        }
                    }
                }
                if let Some(pr) = session.pr.clone() {
                    if let Some(status) = Self::probe_pr_axis(scm.as_ref(), &pr).await {
                        return status;
                    }
                }
            }
        }

        if matches!(
            current,
            SessionStatus::Spawning | SessionStatus::Stuck | SessionStatus::NeedsInput
        ) {
            SessionStatus::Working
        } else {
            current
        }
    }

    /// Signals 1 and 2: runtime liveness and agent activity. Returns a
    /// decided status, `None` to fall through, or an error for the caller
    /// to apply the stuck/needs-input preservation rule.
    async fn probe_runtime_and_agent(
        &self,
        session: &mut Session,
    ) -> anyhow::Result<Option<SessionStatus>> {
        let Some(handle) = session.runtime_handle.clone() else {
            return Ok(None);
        };
        let project = self.config.project(&session.project_id);
        let runtime = self
            .registry
            .runtime(&handle.runtime_name)
            .or_else(|| self.registry.runtime(self.config.runtime_for(project)));
        let Some(runtime) = runtime else {
            return Ok(None);
        };

        // Liveness probe errors are treated as alive; the rest of the
        // cascade still runs.
        let alive = match runtime.is_alive(&handle).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(session = %session.id, error = %e, "Liveness probe failed, assuming alive");
                true
            }
        };
        if !alive {
            session.activity = Some(ActivityState::Exited);
            return Ok(Some(SessionStatus::Killed));
        }

        let Some(agent) = self.registry.agent(self.config.agent_for(project)) else {
            return Ok(None);
        };

        let output = runtime.get_output(&handle, Some(OUTPUT_LINES)).await?;
        if output.trim().is_empty() {
            // Empty capture is a probe failure, not an idle agent.
            return Ok(None);
        }

        let activity = agent.detect_activity(&output);
        session.activity = Some(activity);
        session.last_activity_at = Some(chrono::Utc::now());
        match activity {
            ActivityState::WaitingInput => Ok(Some(SessionStatus::NeedsInput)),
            ActivityState::Idle | ActivityState::Ready => {
                if agent.is_process_running(&handle).await? {
                    Ok(None)
                } else {
                    session.activity = Some(ActivityState::Exited);
                    Ok(Some(SessionStatus::Killed))
                }
            }
            _ => Ok(None),
        }
    }

    /// Signal 3: the PR axis. Every SCM call is wrapped; any failure
    /// skips the whole axis rather than producing a half-derived status.
    async fn probe_pr_axis(
        scm: &dyn crate::plugins::scm::Scm,
        pr: &crate::session::PrInfo,
    ) -> Option<SessionStatus> {
        use crate::plugins::scm::{CiSummary, PrState, ReviewDecision};

        match scm.pr_state(pr).await.ok()? {
            PrState::Merged => return Some(SessionStatus::Merged),
            PrState::Closed => return Some(SessionStatus::Killed),
            PrState::Open => {}
        }

        if scm.ci_summary(pr).await.ok()? == CiSummary::Failing {
            return Some(SessionStatus::CiFailed);
        }

        match scm.review_decision(pr).await.ok()? {
            ReviewDecision::ChangesRequested => Some(SessionStatus::ChangesRequested),
            ReviewDecision::Approved => {
                let mergeability = scm.mergeability(pr).await.ok()?;
                if mergeability.mergeable {
                    Some(SessionStatus::Mergeable)
                } else {
                    Some(SessionStatus::Approved)
                }
            }
            ReviewDecision::Pending => Some(SessionStatus::ReviewPending),
            ReviewDecision::None => Some(SessionStatus::PrOpen),
        }
    }

    /// Persist a transition and dispatch its event.
    async fn apply_transition(
        &self,
        session: &Session,
        old: SessionStatus,
        new: SessionStatus,
    ) -> Result<(), ManagerError> {
        self.sessions.store().update(
            &session.project_id,
            &session.id,
            &[(keys::STATUS, Some(new.as_str().to_string()))],
        )?;

        info!(
            session = %session.id,
            old = %old,
            new = %new,
            "Session status changed"
        );

        if !new.is_terminal() {
            self.all_complete_emitted.store(false, Ordering::SeqCst);
        }

        // The retry budget belongs to the state that spawned it.
        if let Some(old_event) = EventType::for_status(old) {
            if let Some(key) = old_event.reaction_key() {
                self.reactions.clear(&session.id, key);
            }
        }

        let Some(event_type) = EventType::for_status(new) else {
            return Ok(());
        };
        let event = Event::for_session(event_type, session, transition_message(session, new));

        let outcome = match event_type.reaction_key() {
            Some(key) => self.reactions.trigger(key, &event).await,
            None => ReactionOutcome::Unhandled,
        };

        // A reaction that handled (or escalated) the event owns its
        // notification; only unhandled, non-info events reach humans here.
        if outcome == ReactionOutcome::Unhandled && event.priority != Priority::Info {
            self.fanout.notify_human(&event).await;
        }
        Ok(())
    }

    /// Re-trigger the reaction for a status that persisted across ticks,
    /// so attempt counts and elapsed-time escalation keep advancing.
    async fn retrigger(&self, session: &Session, status: SessionStatus) {
        let Some(event_type) = EventType::for_status(status) else {
            return;
        };
        let Some(key) = event_type.reaction_key() else {
            return;
        };
        let event = Event::for_session(event_type, session, transition_message(session, status));
        let _ = self.reactions.trigger(key, &event).await;
    }

    /// Emit the all-complete summary exactly once per completion, guarded
    /// by a flag that resets when any session goes non-terminal again.
    async fn maybe_emit_all_complete(&self, sessions: &[Session]) {
        if sessions.is_empty() || !self.config.reactions.contains_key(ALL_COMPLETE_KEY) {
            return;
        }

        let all_terminal = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .iter()
                .all(|s| states.get(&s.id).copied().unwrap_or(s.status).is_terminal())
        };
        if !all_terminal {
            return;
        }
        if self.all_complete_emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(count = sessions.len(), "All sessions complete");
        let event = Event::new(
            EventType::SummaryAllComplete,
            "",
            "",
            format!("All {} sessions are merged or killed", sessions.len()),
        );
        let _ = self.reactions.trigger(ALL_COMPLETE_KEY, &event).await;
    }
}

fn transition_message(session: &Session, status: SessionStatus) -> String {
    let subject = session
        .pr
        .as_ref()
        .map_or_else(|| session.branch.clone(), |pr| format!("PR #{}", pr.number));
    match status {
        SessionStatus::Working => format!("{} is working", session.id),
        SessionStatus::PrOpen => format!("{} opened {subject}", session.id),
        SessionStatus::CiFailed => format!("CI is failing on {subject}"),
        SessionStatus::ReviewPending => format!("{subject} is waiting for review"),
        SessionStatus::ChangesRequested => format!("Changes requested on {subject}"),
        SessionStatus::Approved => format!("{subject} is approved"),
        SessionStatus::Mergeable => format!("{subject} is approved and green"),
        SessionStatus::Merged => format!("{subject} was merged"),
        SessionStatus::NeedsInput => format!("{} is waiting for input", session.id),
        SessionStatus::Stuck => format!("{} looks stuck", session.id),
        SessionStatus::Errored => format!("{} hit an error", session.id),
        SessionStatus::Killed => format!("{} exited", session.id),
        _ => format!("{} is {status}", session.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EscalateAfter, NotifierConfig, ProjectConfig, ReactionAction, ReactionConfig,
    };
    use crate::plugins::agent::MockAgent;
    use crate::plugins::notifier::MockNotifier;
    use crate::plugins::runtime::MockRuntime;
    use crate::plugins::scm::{CiSummary, MockScm, PrState, ReviewDecision};
    use crate::plugins::workspace::MockWorkspace;
    use crate::plugins::{PluginInstance, PluginManifest, PluginSlot};
    use crate::session::manager::SpawnRequest;
    use crate::session::PrInfo;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        lifecycle: Arc<LifecycleManager>,
        manager: Arc<SessionManager>,
        runtime: Arc<MockRuntime>,
        agent: Arc<MockAgent>,
        scm: Arc<MockScm>,
        notifier: Arc<MockNotifier>,
    }

    fn harness(reactions: BTreeMap<String, ReactionConfig>) -> Harness {
        let tmp = TempDir::new().unwrap();

        let mut config = Config::default();
        config.data_dir = tmp.path().join("sessions");
        config.worktree_dir = tmp.path().join("worktrees");
        config.defaults.runtime = "mock".to_string();
        config.defaults.agent = "mock".to_string();
        config.defaults.workspace = Some("mock".to_string());
        config.defaults.notifiers = vec!["mock".to_string()];
        config.notifiers.insert(
            "mock".to_string(),
            NotifierConfig {
                plugin: "mock".to_string(),
                options: BTreeMap::new(),
            },
        );
        config.reactions = reactions;
        config.projects.insert(
            "my-app".to_string(),
            ProjectConfig {
                name: "my-app".to_string(),
                repo: Some("acme/my-app".to_string()),
                path: tmp.path().join("checkout"),
                default_branch: "main".to_string(),
                session_prefix: Some("app".to_string()),
                runtime: Some("mock".to_string()),
                agent: Some("mock".to_string()),
                workspace: Some("mock".to_string()),
                tracker: None,
                scm: Some("mock".to_string()),
                symlinks: Vec::new(),
                post_create: None,
                agent_config: None,
                reactions: BTreeMap::new(),
            },
        );
        let config = Arc::new(config);

        let runtime = Arc::new(MockRuntime::new());
        let agent = Arc::new(MockAgent::new());
        let workspace = Arc::new(MockWorkspace::with_base_dir(tmp.path().join("worktrees")));
        let scm = Arc::new(MockScm::new());
        let notifier = Arc::new(MockNotifier::new());

        let registry = Arc::new(PluginRegistry::new());
        registry.register(
            PluginManifest::new(PluginSlot::Runtime, "mock", ""),
            PluginInstance::Runtime(runtime.clone()),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Agent, "mock", ""),
            PluginInstance::Agent(agent.clone()),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Workspace, "mock", ""),
            PluginInstance::Workspace(workspace.clone()),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Scm, "mock", ""),
            PluginInstance::Scm(scm.clone()),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "mock", ""),
            PluginInstance::Notifier(notifier.clone()),
        );

        let manager = Arc::new(SessionManager::new(config.clone(), registry.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(config, registry, manager.clone()));

        Harness {
            _tmp: tmp,
            lifecycle,
            manager,
            runtime,
            agent,
            scm,
            notifier,
        }
    }

    fn ci_failed_reactions() -> BTreeMap<String, ReactionConfig> {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig {
                auto: true,
                action: ReactionAction::SendToAgent,
                message: Some("Fix CI".to_string()),
                retries: Some(3),
                escalate_after: Some(EscalateAfter::Attempts(3)),
                ..ReactionConfig::default()
            },
        );
        reactions
    }

    async fn spawn(h: &Harness) -> Session {
        h.manager
            .spawn(SpawnRequest {
                project_id: "my-app".to_string(),
                ..SpawnRequest::default()
            })
            .await
            .unwrap()
    }

    fn set_status(h: &Harness, session_id: &str, status: &str) {
        h.manager
            .store()
            .update(
                "my-app",
                session_id,
                &[(keys::STATUS, Some(status.to_string()))],
            )
            .unwrap();
    }

    fn set_pr(h: &Harness, session_id: &str) {
        h.manager
            .store()
            .update(
                "my-app",
                session_id,
                &[(
                    keys::PR,
                    Some("https://github.com/acme/my-app/pull/9".to_string()),
                )],
            )
            .unwrap();
    }

    fn stored_status(h: &Harness, session_id: &str) -> String {
        h.manager
            .store()
            .read("my-app", session_id)
            .unwrap()
            .unwrap()
            .get(keys::STATUS)
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn spawning_session_transitions_to_working() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;

        h.lifecycle.poll_now().await;

        assert_eq!(stored_status(&h, &session.id), "working");
        // session.working is info priority: no human notification.
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn ci_failure_triggers_send_to_agent_without_notifying() {
        let h = harness(ci_failed_reactions());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "pr_open");
        set_pr(&h, &session.id);
        h.scm.set_pr_state(PrState::Open);
        h.scm.set_ci_summary(CiSummary::Failing);

        h.lifecycle.poll_now().await;

        assert_eq!(stored_status(&h, &session.id), "ci_failed");
        let sent = h.runtime.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Fix CI");
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn persistent_ci_failure_escalates_on_fourth_trigger() {
        let h = harness(ci_failed_reactions());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "pr_open");
        set_pr(&h, &session.id);
        h.scm.set_ci_summary(CiSummary::Failing);

        for _ in 0..4 {
            h.lifecycle.poll_now().await;
        }

        // Three sends, then the fourth trigger escalates.
        assert_eq!(h.runtime.sent_messages().len(), 3);
        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ReactionEscalated);
        assert_eq!(events[0].priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn recovered_ci_clears_the_retry_budget() {
        let h = harness(ci_failed_reactions());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "pr_open");
        set_pr(&h, &session.id);
        h.scm.set_ci_summary(CiSummary::Failing);

        h.lifecycle.poll_now().await;
        h.lifecycle.poll_now().await;
        assert_eq!(h.lifecycle.reactions().attempts(&session.id, "ci-failed"), 2);

        // CI recovers: pr_open again, and the tracker resets.
        h.scm.set_ci_summary(CiSummary::Passing);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "pr_open");
        assert_eq!(h.lifecycle.reactions().attempts(&session.id, "ci-failed"), 0);
    }

    #[tokio::test]
    async fn probe_failure_preserves_stuck_status() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "stuck");
        h.runtime.fail_get_output(true);

        h.lifecycle.poll_now().await;

        assert_eq!(stored_status(&h, &session.id), "stuck");
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn liveness_probe_error_is_treated_as_alive() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "working");

        // The liveness probe breaks, but the terminal is still readable:
        // the activity signal must still be consulted.
        h.runtime.fail_is_alive(true);
        h.runtime.set_output(
            &session.runtime_handle.as_ref().unwrap().id,
            "Do you want to proceed?",
        );
        h.agent.set_activity(ActivityState::WaitingInput);

        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "needs_input");
    }

    #[tokio::test]
    async fn needs_input_detected_then_recovers_to_working() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        h.runtime.set_output(
            &session.runtime_handle.as_ref().unwrap().id,
            "Do you want to run tests?",
        );
        h.agent.set_activity(ActivityState::WaitingInput);

        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "needs_input");

        // needs_input is urgent and no reaction is configured, so humans
        // were notified once.
        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::SessionNeedsInput);

        // The human answered; the agent is active again.
        h.agent.set_activity(ActivityState::Active);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "working");
    }

    #[tokio::test]
    async fn dead_runtime_transitions_to_killed_once() {
        // Configure a notify reaction so the transition is observable.
        let mut reactions = BTreeMap::new();
        reactions.insert(
            "agent-exited".to_string(),
            ReactionConfig {
                action: ReactionAction::Notify,
                priority: Some(Priority::Warning),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);
        let session = spawn(&h).await;
        h.lifecycle.poll_now().await;

        h.runtime
            .set_alive(&session.runtime_handle.as_ref().unwrap().id, false);
        h.lifecycle.poll_now().await;

        assert_eq!(stored_status(&h, &session.id), "killed");
        assert_eq!(h.notifier.events().len(), 1);

        // Terminal and unchanged: not selected again, no repeat trigger.
        h.lifecycle.poll_now().await;
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn detected_pr_is_persisted_and_opens_pr_axis() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        h.scm.set_detected_pr(Some(PrInfo {
            number: 9,
            url: "https://github.com/acme/my-app/pull/9".to_string(),
            title: Some("Fix widget".to_string()),
            owner: "acme".to_string(),
            repo: "my-app".to_string(),
            branch: Some("main".to_string()),
            base_branch: Some("main".to_string()),
            is_draft: false,
        }));

        h.lifecycle.poll_now().await;

        assert_eq!(stored_status(&h, &session.id), "pr_open");
        let record = h.manager.store().read("my-app", &session.id).unwrap().unwrap();
        assert_eq!(
            record.get(keys::PR),
            Some("https://github.com/acme/my-app/pull/9")
        );
    }

    #[tokio::test]
    async fn review_axis_orders_signals() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "pr_open");
        set_pr(&h, &session.id);

        h.scm.set_review_decision(ReviewDecision::Pending);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "review_pending");

        h.scm.set_review_decision(ReviewDecision::ChangesRequested);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "changes_requested");

        h.scm.set_review_decision(ReviewDecision::Approved);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "approved");

        h.scm.set_mergeability(crate::plugins::scm::Mergeability {
            mergeable: true,
            ci_passing: true,
            approved: true,
            no_conflicts: true,
            blockers: Vec::new(),
        });
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "mergeable");

        h.scm.set_pr_state(PrState::Merged);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &session.id), "merged");
    }

    #[tokio::test]
    async fn scm_failure_skips_pr_axis_and_preserves() {
        let h = harness(BTreeMap::new());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "ci_failed");
        set_pr(&h, &session.id);
        h.scm.fail_all(true);

        h.lifecycle.poll_now().await;

        // ci_failed is not in the default-recovery set, so it persists.
        assert_eq!(stored_status(&h, &session.id), "ci_failed");
    }

    #[tokio::test]
    async fn all_complete_fires_once_and_resets_on_reactivation() {
        let mut reactions = BTreeMap::new();
        reactions.insert(
            ALL_COMPLETE_KEY.to_string(),
            ReactionConfig {
                action: ReactionAction::Notify,
                priority: Some(Priority::Info),
                ..ReactionConfig::default()
            },
        );
        let h = harness(reactions);

        let a = spawn(&h).await;
        let b = spawn(&h).await;
        set_pr(&h, &a.id);
        set_pr(&h, &b.id);
        h.scm.set_pr_state(PrState::Merged);

        // Both merge in the same tick: exactly one all-complete.
        h.lifecycle.poll_now().await;
        let summaries = |h: &Harness| {
            h.notifier
                .events()
                .into_iter()
                .filter(|e| e.event_type == EventType::ReactionTriggered)
                .count()
        };
        assert_eq!(summaries(&h), 1);

        // Subsequent ticks stay quiet.
        h.lifecycle.poll_now().await;
        h.lifecycle.poll_now().await;
        assert_eq!(summaries(&h), 1);

        // A new session starts working: the guard resets.
        let c = spawn(&h).await;
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &c.id), "working");
        assert_eq!(summaries(&h), 1);

        // Once the fleet is fully terminal again, the summary fires again.
        set_pr(&h, &c.id);
        h.lifecycle.poll_now().await;
        assert_eq!(stored_status(&h, &c.id), "merged");
        assert_eq!(summaries(&h), 2);
    }

    #[tokio::test]
    async fn pruning_forgets_vanished_sessions() {
        let h = harness(ci_failed_reactions());
        let session = spawn(&h).await;
        set_status(&h, &session.id, "pr_open");
        set_pr(&h, &session.id);
        h.scm.set_ci_summary(CiSummary::Failing);

        h.lifecycle.poll_now().await;
        assert_eq!(h.lifecycle.reactions().attempts(&session.id, "ci-failed"), 1);

        // Session is archived out from under the engine.
        h.manager.store().archive("my-app", &session.id).unwrap();
        h.lifecycle.poll_now().await;

        assert_eq!(h.lifecycle.reactions().attempts(&session.id, "ci-failed"), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let h = harness(BTreeMap::new());

        h.lifecycle.start(Duration::from_secs(3600));
        assert!(h.lifecycle.is_running());
        h.lifecycle.start(Duration::from_secs(3600));
        assert!(h.lifecycle.is_running());

        h.lifecycle.stop().await;
        assert!(!h.lifecycle.is_running());
        h.lifecycle.stop().await;
        assert!(!h.lifecycle.is_running());

        // Can start again after a stop.
        h.lifecycle.start(Duration::from_secs(3600));
        assert!(h.lifecycle.is_running());
        h.lifecycle.stop().await;
    }

    #[tokio::test]
    async fn check_matches_persisted_state_for_every_session() {
        let h = harness(BTreeMap::new());
        let a = spawn(&h).await;
        let b = spawn(&h).await;
        set_pr(&h, &b.id);
        h.scm.set_ci_summary(CiSummary::Failing);

        h.lifecycle.poll_now().await;

        for session in h.manager.list(Some("my-app")).await.unwrap() {
            let tracked = {
                let states = h.lifecycle.states.lock().unwrap();
                states.get(&session.id).copied().unwrap()
            };
            assert_eq!(stored_status(&h, &session.id), tracked.as_str());
        }
        assert_eq!(stored_status(&h, &a.id), "working");
        assert_eq!(stored_status(&h, &b.id), "ci_failed");
    }
}
