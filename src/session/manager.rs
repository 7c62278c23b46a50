//! Session CRUD: spawn, list, inspect, message, kill, and bulk cleanup.
//!
//! Everything goes through plugin interfaces; this module knows nothing
//! about tmux, git, or gh. The metadata file is the synchronization
//! point: concurrent spawns contend on atomic id reservation, and every
//! spawn failure unwinds whatever it had already allocated.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::metadata::{keys, MetadataError, MetadataRecord, MetadataStore};
use super::{ActivityState, RuntimeHandle, Session, SessionStatus};
use crate::config::{Config, ProjectConfig};
use crate::plugins::agent::{Agent, AgentError, AgentLaunchConfig};
use crate::plugins::runtime::{CreateRuntimeRequest, Runtime, RuntimeError};
use crate::plugins::scm::PrState;
use crate::plugins::workspace::{
    CreateWorkspaceRequest, Workspace, WorkspaceError, WorkspaceInfo,
};
use crate::plugins::{PluginRegistry, PluginSlot};

/// Environment variable handed to every spawned session so external hooks
/// can correlate back to the supervisor.
pub const SESSION_ENV_VAR: &str = "OVERSEER_SESSION";

/// Attempts at reserving a fresh session id before giving up.
const ID_RESERVE_ATTEMPTS: u32 = 10;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("{slot} plugin '{name}' not found")]
    PluginMissing { slot: PluginSlot, name: String },

    #[error("could not reserve a session id for prefix '{0}' after 10 attempts")]
    IdSpaceExhausted(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Inputs for spawning one session.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub project_id: String,
    pub issue_id: Option<String>,
    pub branch: Option<String>,
    pub prompt: Option<String>,
}

/// Outcome of a bulk cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub killed: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Outcome of a batch spawn.
#[derive(Debug, Default)]
pub struct BatchSpawnReport {
    pub spawned: Vec<Session>,
    pub skipped: Vec<(String, String)>,
    pub errors: Vec<(String, String)>,
}

pub struct SessionManager {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    store: MetadataStore,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, registry: Arc<PluginRegistry>) -> Self {
        let store = MetadataStore::new(config.data_dir.clone());
        Self {
            config,
            registry,
            store,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Spawn a new session: reserve an id, create the workspace, launch
    /// the agent in a fresh runtime, persist metadata. Any failure cleans
    /// up everything allocated so far and leaves nothing behind.
    #[instrument(skip(self, request), fields(project = %request.project_id))]
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Session, ManagerError> {
        let project = self
            .config
            .project(&request.project_id)
            .ok_or_else(|| ManagerError::UnknownProject(request.project_id.clone()))?
            .clone();

        let runtime = self.require_runtime(Some(&project))?;
        let agent = self.require_agent(Some(&project))?;
        let workspace = self
            .config
            .workspace_for(Some(&project))
            .and_then(|name| self.registry.workspace(name));
        let tracker = project
            .tracker
            .as_deref()
            .and_then(|name| self.registry.tracker(name));

        let session_id = self.reserve_session_id(&request.project_id, project.prefix())?;

        let branch = match (&request.branch, &request.issue_id) {
            (Some(branch), _) => branch.clone(),
            (None, Some(issue)) => match &tracker {
                Some(tracker) => tracker.branch_name(issue, &project),
                None => format!("feat/{issue}"),
            },
            (None, None) => project.default_branch.clone(),
        };

        // Workspace is optional; without one the session runs in the
        // project's main checkout.
        let workspace_info = match &workspace {
            Some(plugin) => {
                let create = CreateWorkspaceRequest {
                    project_id: request.project_id.clone(),
                    project: project.clone(),
                    session_id: session_id.clone(),
                    branch: branch.clone(),
                };
                let info = match plugin.create(&create).await {
                    Ok(info) => info,
                    Err(e) => {
                        self.release_reservation(&request.project_id, &session_id);
                        return Err(e.into());
                    }
                };
                if let Err(e) = plugin.post_create(&info, &project).await {
                    let _ = plugin.destroy(&info.path).await;
                    self.release_reservation(&request.project_id, &session_id);
                    return Err(e.into());
                }
                Some(info)
            }
            None => None,
        };
        let workspace_path = workspace_info
            .as_ref()
            .map_or_else(|| project.path.clone(), |info| info.path.clone());

        // Resolve the initial prompt: explicit wins, else derived from the
        // issue when a tracker can describe it.
        let prompt = match (&request.prompt, &request.issue_id, &tracker) {
            (Some(prompt), _, _) => Some(prompt.clone()),
            (None, Some(issue), Some(tracker)) => match tracker.issue(issue, &project).await {
                Ok(info) => Some(tracker.generate_prompt(&info)),
                Err(e) => {
                    warn!(issue = %issue, error = %e, "Could not fetch issue for prompt");
                    None
                }
            },
            _ => None,
        };

        let launch_config = AgentLaunchConfig {
            session_id: session_id.clone(),
            workspace_path: workspace_path.clone(),
            issue_id: request.issue_id.clone(),
            prompt,
            options: project.agent_config.clone(),
        };
        let mut environment: BTreeMap<String, String> = agent.environment(&launch_config);
        environment.insert(SESSION_ENV_VAR.to_string(), session_id.clone());

        let runtime_request = CreateRuntimeRequest {
            session_id: session_id.clone(),
            workspace_path: workspace_path.clone(),
            launch_command: agent.launch_command(&launch_config),
            environment,
        };
        let handle = match runtime.create(&runtime_request).await {
            Ok(handle) => handle,
            Err(e) => {
                self.unwind_workspace(&workspace, workspace_info.as_ref()).await;
                self.release_reservation(&request.project_id, &session_id);
                return Err(e.into());
            }
        };

        let mut record = MetadataRecord::new(&session_id, &request.project_id);
        record.set(keys::STATUS, SessionStatus::Spawning.as_str());
        record.set(keys::CREATED_AT, Utc::now().to_rfc3339());
        record.set(keys::BRANCH, branch.clone());
        record.set(
            keys::WORKTREE,
            workspace_path.to_string_lossy().to_string(),
        );
        record.set_opt(keys::ISSUE, request.issue_id.clone());
        record.set(keys::RUNTIME_HANDLE, handle.to_json());

        let mut session = Session::from_record(record.clone());
        session.activity = Some(ActivityState::Active);

        let persisted = self.store.write(&record).map_err(ManagerError::from);
        let setup = match persisted {
            Ok(()) => agent
                .post_launch_setup(&session)
                .await
                .map_err(ManagerError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = setup {
            let _ = runtime.destroy(&handle).await;
            self.unwind_workspace(&workspace, workspace_info.as_ref()).await;
            self.release_reservation(&request.project_id, &session_id);
            return Err(e);
        }

        info!(session = %session_id, branch = %branch, "Spawned session");
        Ok(session)
    }

    /// Spawn one session per issue, skipping issues that already have a
    /// live session.
    pub async fn spawn_batch(
        &self,
        project_id: &str,
        issue_ids: &[String],
    ) -> Result<BatchSpawnReport, ManagerError> {
        let existing = self.list(Some(project_id)).await?;
        let mut report = BatchSpawnReport::default();

        for issue_id in issue_ids {
            if let Some(session) = existing
                .iter()
                .find(|s| s.issue_id.as_deref() == Some(issue_id.as_str()))
            {
                report.skipped.push((
                    issue_id.clone(),
                    format!("already has session: {}", session.id),
                ));
                continue;
            }

            let request = SpawnRequest {
                project_id: project_id.to_string(),
                issue_id: Some(issue_id.clone()),
                branch: None,
                prompt: None,
            };
            match self.spawn(request).await {
                Ok(session) => report.spawned.push(session),
                Err(e) => report.errors.push((issue_id.clone(), e.to_string())),
            }
        }
        Ok(report)
    }

    /// All live sessions, with runtime liveness overlaid: a session whose
    /// process host is gone is reported as killed/exited. Probe failures
    /// are non-fatal; the session is assumed alive.
    pub async fn list(&self, project_id: Option<&str>) -> Result<Vec<Session>, ManagerError> {
        let records = self.store.list(project_id)?;
        let mut sessions = Vec::with_capacity(records.len());

        for record in records {
            let mut session = Session::from_record(record);
            if let Some(handle) = session.runtime_handle.clone() {
                if let Some(runtime) = self.runtime_for_handle(&session, &handle) {
                    match runtime.is_alive(&handle).await {
                        Ok(false) => {
                            session.status = SessionStatus::Killed;
                            session.activity = Some(ActivityState::Exited);
                        }
                        Ok(true) => {}
                        Err(e) => {
                            warn!(session = %session.id, error = %e, "Liveness probe failed, assuming alive");
                        }
                    }
                }
            }
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// Fetch one session, or `None` when it does not exist. The live
    /// workspace branch takes precedence over the cached metadata value.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, ManagerError> {
        let Some(record) = self.store.find(session_id)? else {
            return Ok(None);
        };
        let mut session = Session::from_record(record);

        if let Some(project) = self.config.project(&session.project_id) {
            if session.workspace_path != project.path {
                if let Some(plugin) = self
                    .config
                    .workspace_for(Some(project))
                    .and_then(|name| self.registry.workspace(name))
                {
                    if let Ok(infos) = plugin.list(project).await {
                        if let Some(info) =
                            infos.iter().find(|i| i.path == session.workspace_path)
                        {
                            session.branch = info.branch.clone();
                        }
                    }
                }
            }
        }

        // Fresher than the summary cached in metadata.
        let project = self.config.project(&session.project_id);
        if let Some(agent) = self.registry.agent(self.config.agent_for(project)) {
            if let Ok(Some(info)) = agent.session_info(&session).await {
                session.agent_info = Some(info);
            }
        }
        Ok(Some(session))
    }

    /// Write a message into the session's terminal. Sessions persisted
    /// without a runtime handle get a synthesized one addressed by their
    /// bare id.
    #[instrument(skip(self, message))]
    pub async fn send(&self, session_id: &str, message: &str) -> Result<(), ManagerError> {
        let record = self
            .store
            .find(session_id)?
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;
        let session = Session::from_record(record);

        let handle = session.runtime_handle.clone().unwrap_or_else(|| {
            RuntimeHandle::new(session_id, self.config.defaults.runtime.clone())
        });
        let runtime = self
            .runtime_for_handle(&session, &handle)
            .ok_or_else(|| ManagerError::PluginMissing {
                slot: PluginSlot::Runtime,
                name: handle.runtime_name.clone(),
            })?;

        runtime.send_message(&handle, message).await?;
        Ok(())
    }

    /// Tear down a session. Runtime and workspace destruction are
    /// best-effort; archiving the metadata is not.
    #[instrument(skip(self))]
    pub async fn kill(&self, session_id: &str) -> Result<(), ManagerError> {
        let record = self
            .store
            .find(session_id)?
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;
        let session = Session::from_record(record);

        if let Some(handle) = &session.runtime_handle {
            match self.runtime_for_handle(&session, handle) {
                Some(runtime) => {
                    if let Err(e) = runtime.destroy(handle).await {
                        warn!(session = %session_id, error = %e, "Runtime destroy failed");
                    }
                }
                None => {
                    warn!(session = %session_id, runtime = %handle.runtime_name, "No runtime plugin to destroy with");
                }
            }
        }

        let project = self.config.project(&session.project_id);
        let in_project_checkout =
            project.is_some_and(|p| p.path == session.workspace_path);
        if !in_project_checkout && !session.workspace_path.as_os_str().is_empty() {
            if let Some(plugin) = self
                .config
                .workspace_for(project)
                .and_then(|name| self.registry.workspace(name))
            {
                if let Err(e) = plugin.destroy(&session.workspace_path).await {
                    warn!(session = %session_id, error = %e, "Workspace destroy failed");
                }
            }
        }

        self.store.archive(&session.project_id, session_id)?;
        info!(session = %session_id, "Killed session");
        Ok(())
    }

    /// Kill every session whose PR is merged or closed, whose issue is
    /// completed, or whose runtime is dead. One session's failure does not
    /// abort the batch.
    pub async fn cleanup(&self, project_id: Option<&str>) -> Result<CleanupReport, ManagerError> {
        let sessions = self.list(project_id).await?;
        let mut report = CleanupReport::default();

        for session in sessions {
            if self.should_cleanup(&session).await {
                match self.kill(&session.id).await {
                    Ok(()) => report.killed.push(session.id),
                    Err(e) => report.errors.push((session.id, e.to_string())),
                }
            } else {
                report.skipped.push(session.id);
            }
        }
        Ok(report)
    }

    async fn should_cleanup(&self, session: &Session) -> bool {
        // Runtime already observed dead by list().
        if session.status == SessionStatus::Killed {
            return true;
        }

        let project = self.config.project(&session.project_id);

        if let (Some(pr), Some(project)) = (&session.pr, project) {
            if let Some(scm) = project
                .scm
                .as_deref()
                .and_then(|name| self.registry.scm(name))
            {
                if let Ok(state) = scm.pr_state(pr).await {
                    if matches!(state, PrState::Merged | PrState::Closed) {
                        return true;
                    }
                }
            }
        }

        if let (Some(issue), Some(project)) = (&session.issue_id, project) {
            if let Some(tracker) = project
                .tracker
                .as_deref()
                .and_then(|name| self.registry.tracker(name))
            {
                if let Ok(true) = tracker.is_completed(issue, project).await {
                    return true;
                }
            }
        }

        false
    }

    /// Next id is `max(existing numbers for this prefix) + 1`, host-wide,
    /// reserved atomically. Collisions (a concurrent spawn won the file
    /// creation race) retry with the next number.
    fn reserve_session_id(
        &self,
        project_id: &str,
        prefix: &str,
    ) -> Result<String, ManagerError> {
        let pattern = Regex::new(&format!(r"^{}-(\d+)$", regex::escape(prefix)))
            .map_err(|e| ManagerError::IdSpaceExhausted(format!("{prefix}: {e}")))?;

        let mut next = self
            .store
            .list(None)?
            .iter()
            .filter_map(|record| {
                pattern
                    .captures(record.session_id())
                    .and_then(|caps| caps[1].parse::<u64>().ok())
            })
            .max()
            .unwrap_or(0)
            + 1;

        for _ in 0..ID_RESERVE_ATTEMPTS {
            let candidate = format!("{prefix}-{next}");
            match self.store.reserve(project_id, &candidate) {
                Ok(()) => return Ok(candidate),
                Err(MetadataError::AlreadyExists(_)) => {
                    next += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManagerError::IdSpaceExhausted(prefix.to_string()))
    }

    fn release_reservation(&self, project_id: &str, session_id: &str) {
        if let Err(e) = self.store.release(project_id, session_id) {
            warn!(session = %session_id, error = %e, "Failed to release reserved session id");
        }
    }

    async fn unwind_workspace(
        &self,
        plugin: &Option<Arc<dyn Workspace>>,
        info: Option<&WorkspaceInfo>,
    ) {
        if let (Some(plugin), Some(info)) = (plugin, info) {
            if let Err(e) = plugin.destroy(&info.path).await {
                warn!(path = %info.path.display(), error = %e, "Failed to destroy workspace during unwind");
            }
        }
    }

    fn require_runtime(
        &self,
        project: Option<&ProjectConfig>,
    ) -> Result<Arc<dyn Runtime>, ManagerError> {
        let name = self.config.runtime_for(project);
        self.registry
            .runtime(name)
            .ok_or_else(|| ManagerError::PluginMissing {
                slot: PluginSlot::Runtime,
                name: name.to_string(),
            })
    }

    fn require_agent(
        &self,
        project: Option<&ProjectConfig>,
    ) -> Result<Arc<dyn Agent>, ManagerError> {
        let name = self.config.agent_for(project);
        self.registry
            .agent(name)
            .ok_or_else(|| ManagerError::PluginMissing {
                slot: PluginSlot::Agent,
                name: name.to_string(),
            })
    }

    /// Resolve the runtime for a stored handle: the handle's own runtime
    /// name wins, then the project's, then the default.
    fn runtime_for_handle(
        &self,
        session: &Session,
        handle: &RuntimeHandle,
    ) -> Option<Arc<dyn Runtime>> {
        if let Some(runtime) = self.registry.runtime(&handle.runtime_name) {
            return Some(runtime);
        }
        let project = self.config.project(&session.project_id);
        self.registry.runtime(self.config.runtime_for(project))
    }
}
