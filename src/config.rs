//! Orchestrator configuration.
//!
//! A single YAML file loaded once per process. Field names are camelCase to
//! match the reference config format. Projects can override the global
//! reaction table per key; everything else falls back to `defaults`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::events::Priority;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Root of session metadata storage.
    pub data_dir: PathBuf,
    /// Root where the workspace plugin places worktrees.
    pub worktree_dir: PathBuf,
    /// Reserved for the dashboard; the engine ignores it.
    pub port: Option<u16>,
    pub defaults: DefaultsConfig,
    /// Map of project id to project configuration.
    pub projects: BTreeMap<String, ProjectConfig>,
    /// Named notifier instances.
    pub notifiers: BTreeMap<String, NotifierConfig>,
    /// Map of priority to the notifier names that should receive events
    /// at that priority. Falls back to `defaults.notifiers`.
    pub notification_routing: BTreeMap<Priority, Vec<String>>,
    /// Global reaction table, keyed by reaction key (e.g. `ci-failed`).
    pub reactions: BTreeMap<String, ReactionConfig>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("overseer");
        Self {
            data_dir: base.join("sessions"),
            worktree_dir: base.join("worktrees"),
            port: None,
            defaults: DefaultsConfig::default(),
            projects: BTreeMap::new(),
            notifiers: BTreeMap::new(),
            notification_routing: BTreeMap::new(),
            reactions: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Plugin names used when a project does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultsConfig {
    pub runtime: String,
    pub agent: String,
    pub workspace: Option<String>,
    /// Fallback notifier list when no routing entry matches.
    pub notifiers: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            runtime: "tmux".to_string(),
            agent: "claude".to_string(),
            workspace: Some("worktree".to_string()),
            notifiers: vec!["desktop".to_string()],
        }
    }
}

/// Per-project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    /// `owner/repo` slug on the source platform.
    #[serde(default)]
    pub repo: Option<String>,
    /// Path to the project's main checkout.
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Prefix for session ids (`<prefix>-<N>`).
    #[serde(default)]
    pub session_prefix: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub scm: Option<String>,
    /// Paths symlinked from the main checkout into each new workspace.
    #[serde(default)]
    pub symlinks: Vec<String>,
    /// Shell command run inside a freshly created workspace.
    #[serde(default)]
    pub post_create: Option<String>,
    /// Opaque agent-plugin options passed through at launch.
    #[serde(default)]
    pub agent_config: Option<serde_json::Value>,
    /// Reaction overrides, merged over the global table per key.
    #[serde(default)]
    pub reactions: BTreeMap<String, ReactionConfig>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl ProjectConfig {
    /// Session id prefix for this project, defaulting to the project name.
    pub fn prefix(&self) -> &str {
        self.session_prefix.as_deref().unwrap_or(&self.name)
    }
}

/// A named notifier instance: which plugin backs it plus its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    pub plugin: String,
    /// Plugin-specific options (e.g. webhook url).
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// What to do when a reaction key fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactionAction {
    SendToAgent,
    Notify,
    AutoMerge,
}

/// `escalateAfter` accepts an attempt count or a duration string like `10m`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EscalateAfter {
    Attempts(u32),
    Elapsed(String),
}

/// Configuration for a single reaction key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReactionConfig {
    /// When false the reaction is disabled, unless its action is `notify`
    /// (notifications are always allowed).
    pub auto: bool,
    pub action: ReactionAction,
    /// Message sent by `send-to-agent`.
    pub message: Option<String>,
    /// Overrides the event-inferred priority for notifications.
    pub priority: Option<Priority>,
    /// Max attempts before escalating. Absent means unbounded.
    pub retries: Option<u32>,
    pub escalate_after: Option<EscalateAfter>,
    /// Reserved for time-triggered reactions; not consumed by the loop.
    pub threshold: Option<String>,
    /// Hint to notifiers to include the agent's own summary.
    pub include_summary: bool,
}

impl Default for ReactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            action: ReactionAction::Notify,
            message: None,
            priority: None,
            retries: None,
            escalate_after: None,
            threshold: None,
            include_summary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file directory; stdout only when absent.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// location (`<config dir>/overseer/config.yaml`). A missing file
    /// yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("overseer")
            .join("config.yaml")
    }

    pub fn project(&self, project_id: &str) -> Option<&ProjectConfig> {
        self.projects.get(project_id)
    }

    /// Effective reaction table for a project: global entries overlaid with
    /// the project's own, per key.
    pub fn reactions_for(&self, project_id: &str) -> BTreeMap<String, ReactionConfig> {
        let mut merged = self.reactions.clone();
        if let Some(project) = self.projects.get(project_id) {
            for (key, reaction) in &project.reactions {
                merged.insert(key.clone(), reaction.clone());
            }
        }
        merged
    }

    /// Runtime plugin name for a project.
    pub fn runtime_for<'a>(&'a self, project: Option<&'a ProjectConfig>) -> &'a str {
        project
            .and_then(|p| p.runtime.as_deref())
            .unwrap_or(&self.defaults.runtime)
    }

    /// Agent plugin name for a project.
    pub fn agent_for<'a>(&'a self, project: Option<&'a ProjectConfig>) -> &'a str {
        project
            .and_then(|p| p.agent.as_deref())
            .unwrap_or(&self.defaults.agent)
    }

    /// Workspace plugin name for a project, if any is configured.
    pub fn workspace_for<'a>(&'a self, project: Option<&'a ProjectConfig>) -> Option<&'a str> {
        project
            .and_then(|p| p.workspace.as_deref())
            .or(self.defaults.workspace.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
dataDir: /tmp/overseer/sessions
worktreeDir: /tmp/overseer/worktrees
defaults:
  runtime: tmux
  agent: claude
  notifiers: [desktop]
projects:
  my-app:
    name: my-app
    repo: acme/my-app
    path: /home/dev/my-app
    defaultBranch: main
    sessionPrefix: app
    reactions:
      ci-failed:
        auto: true
        action: send-to-agent
        message: "CI is failing, please fix"
        retries: 2
notifiers:
  desktop:
    plugin: desktop
  team-hook:
    plugin: webhook
    url: https://hooks.example.com/overseer
notificationRouting:
  urgent: [desktop, team-hook]
  info: [desktop]
reactions:
  ci-failed:
    auto: true
    action: send-to-agent
    message: "Fix CI"
    retries: 3
    escalateAfter: 3
  agent-stuck:
    action: notify
    escalateAfter: 10m
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/overseer/sessions"));
        assert_eq!(config.defaults.runtime, "tmux");

        let project = config.project("my-app").unwrap();
        assert_eq!(project.prefix(), "app");
        assert_eq!(project.repo.as_deref(), Some("acme/my-app"));

        let routing = config.notification_routing.get(&Priority::Urgent).unwrap();
        assert_eq!(
            routing,
            &vec!["desktop".to_string(), "team-hook".to_string()]
        );
    }

    #[test]
    fn escalate_after_accepts_count_and_duration() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let ci = config.reactions.get("ci-failed").unwrap();
        assert_eq!(ci.escalate_after, Some(EscalateAfter::Attempts(3)));
        assert_eq!(ci.retries, Some(3));

        let stuck = config.reactions.get("agent-stuck").unwrap();
        assert_eq!(
            stuck.escalate_after,
            Some(EscalateAfter::Elapsed("10m".to_string()))
        );
        assert!(stuck.retries.is_none());
    }

    #[test]
    fn project_reactions_override_global_per_key() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let merged = config.reactions_for("my-app");

        // Project override wins for ci-failed.
        let ci = merged.get("ci-failed").unwrap();
        assert_eq!(ci.retries, Some(2));
        assert_eq!(ci.message.as_deref(), Some("CI is failing, please fix"));

        // Global-only keys survive the merge.
        assert!(merged.contains_key("agent-stuck"));
    }

    #[test]
    fn reaction_defaults() {
        let reaction = ReactionConfig::default();
        assert!(reaction.auto);
        assert_eq!(reaction.action, ReactionAction::Notify);
        assert!(reaction.retries.is_none());
        assert!(!reaction.include_summary);
    }

    #[test]
    fn unknown_project_has_no_overrides() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let merged = config.reactions_for("nope");
        assert_eq!(merged.len(), config.reactions.len());
    }

    #[test]
    fn plugin_name_fallbacks() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let project = config.project("my-app");
        assert_eq!(config.runtime_for(project), "tmux");
        assert_eq!(config.agent_for(project), "claude");
        assert_eq!(config.workspace_for(project), Some("worktree"));
        assert_eq!(config.runtime_for(None), "tmux");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/overseer.yaml"))).unwrap();
        assert!(config.projects.is_empty());
        assert_eq!(config.defaults.agent, "claude");
    }

    #[test]
    fn notifier_options_flatten() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let hook = config.notifiers.get("team-hook").unwrap();
        assert_eq!(hook.plugin, "webhook");
        assert_eq!(
            hook.options.get("url").and_then(|v| v.as_str()),
            Some("https://hooks.example.com/overseer")
        );
    }
}
