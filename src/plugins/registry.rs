//! Plugin registry: one instance per `(slot, name)`.
//!
//! Builtins are loaded by probing the host for what they need (`which
//! tmux`, `which gh`, ...); anything unusable is skipped silently so the
//! registry only carries plugins that can actually run. Consumers get
//! `None` for missing plugins, never an error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::agent::{Agent, ClaudeAgent};
use super::notifier::{DesktopNotifier, Notifier, WebhookNotifier};
use super::runtime::{Runtime, TmuxRuntime};
use super::scm::{GitHubScm, Scm};
use super::terminal::{Terminal, TmuxTerminal};
use super::tracker::{GitHubTracker, Tracker};
use super::workspace::{Workspace, WorktreeWorkspace};
use super::{PluginInstance, PluginManifest, PluginSlot};
use crate::config::Config;

struct RegisteredPlugin {
    manifest: PluginManifest,
    instance: PluginInstance,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<(PluginSlot, String), RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under its manifest's `(slot, name)`.
    /// Re-registering the same key replaces the previous instance.
    pub fn register(&self, manifest: PluginManifest, instance: PluginInstance) {
        debug_assert_eq!(manifest.slot, instance.slot());
        let key = (manifest.slot, manifest.name.clone());
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        plugins.insert(key, RegisteredPlugin { manifest, instance });
    }

    fn instance(&self, slot: PluginSlot, name: &str) -> Option<PluginInstance> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .get(&(slot, name.to_string()))
            .map(|p| p.instance.clone())
    }

    pub fn runtime(&self, name: &str) -> Option<Arc<dyn Runtime>> {
        match self.instance(PluginSlot::Runtime, name) {
            Some(PluginInstance::Runtime(r)) => Some(r),
            _ => None,
        }
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        match self.instance(PluginSlot::Agent, name) {
            Some(PluginInstance::Agent(a)) => Some(a),
            _ => None,
        }
    }

    pub fn workspace(&self, name: &str) -> Option<Arc<dyn Workspace>> {
        match self.instance(PluginSlot::Workspace, name) {
            Some(PluginInstance::Workspace(w)) => Some(w),
            _ => None,
        }
    }

    pub fn tracker(&self, name: &str) -> Option<Arc<dyn Tracker>> {
        match self.instance(PluginSlot::Tracker, name) {
            Some(PluginInstance::Tracker(t)) => Some(t),
            _ => None,
        }
    }

    pub fn scm(&self, name: &str) -> Option<Arc<dyn Scm>> {
        match self.instance(PluginSlot::Scm, name) {
            Some(PluginInstance::Scm(s)) => Some(s),
            _ => None,
        }
    }

    pub fn notifier(&self, name: &str) -> Option<Arc<dyn Notifier>> {
        match self.instance(PluginSlot::Notifier, name) {
            Some(PluginInstance::Notifier(n)) => Some(n),
            _ => None,
        }
    }

    pub fn terminal(&self, name: &str) -> Option<Arc<dyn Terminal>> {
        match self.instance(PluginSlot::Terminal, name) {
            Some(PluginInstance::Terminal(t)) => Some(t),
            _ => None,
        }
    }

    /// Manifests of everything registered in a slot, sorted by name.
    pub fn list(&self, slot: PluginSlot) -> Vec<PluginManifest> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut manifests: Vec<PluginManifest> = plugins
            .values()
            .filter(|p| p.manifest.slot == slot)
            .map(|p| p.manifest.clone())
            .collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    /// Register every builtin whose host requirements are satisfied.
    /// Missing binaries mean the plugin is skipped, not an error.
    pub fn load_builtins(&self, config: &Config) {
        if binary_available("tmux") {
            self.register(
                PluginManifest::new(PluginSlot::Runtime, "tmux", "tmux session per agent"),
                PluginInstance::Runtime(Arc::new(TmuxRuntime::new())),
            );
            self.register(
                PluginManifest::new(PluginSlot::Terminal, "tmux", "attach via tmux"),
                PluginInstance::Terminal(Arc::new(TmuxTerminal::new())),
            );
        } else {
            debug!("tmux not found, skipping tmux runtime/terminal plugins");
        }

        self.register(
            PluginManifest::new(PluginSlot::Agent, "claude", "Claude Code agent"),
            PluginInstance::Agent(Arc::new(ClaudeAgent::new())),
        );

        if binary_available("git") {
            self.register(
                PluginManifest::new(PluginSlot::Workspace, "worktree", "git worktree per session"),
                PluginInstance::Workspace(Arc::new(WorktreeWorkspace::new(
                    config.worktree_dir.clone(),
                ))),
            );
        } else {
            debug!("git not found, skipping worktree workspace plugin");
        }

        if binary_available("gh") {
            self.register(
                PluginManifest::new(PluginSlot::Scm, "github", "GitHub PRs via gh"),
                PluginInstance::Scm(Arc::new(GitHubScm::new())),
            );
            self.register(
                PluginManifest::new(PluginSlot::Tracker, "github", "GitHub issues via gh"),
                PluginInstance::Tracker(Arc::new(GitHubTracker::new())),
            );
        } else {
            debug!("gh not found, skipping GitHub scm/tracker plugins");
        }

        self.register(
            PluginManifest::new(PluginSlot::Notifier, "desktop", "desktop notifications"),
            PluginInstance::Notifier(Arc::new(DesktopNotifier::new())),
        );

        // Webhook notifiers are instantiated per configured entry; the
        // options carry the URL.
        for (name, notifier_config) in &config.notifiers {
            if notifier_config.plugin != "webhook" {
                continue;
            }
            match WebhookNotifier::from_options(&notifier_config.options) {
                Ok(webhook) => self.register(
                    PluginManifest::new(PluginSlot::Notifier, name.clone(), "webhook POST"),
                    PluginInstance::Notifier(Arc::new(webhook)),
                ),
                Err(e) => {
                    warn!(notifier = %name, error = %e, "Skipping misconfigured webhook notifier");
                }
            }
        }
    }

    /// Load builtins from the orchestrator config. Per-project plugin
    /// packages are reserved for later.
    pub fn load_from_config(&self, config: &Config) {
        self.load_builtins(config);
    }
}

fn binary_available(name: &str) -> bool {
    which::which(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::notifier::MockNotifier;
    use crate::plugins::runtime::MockRuntime;

    #[test]
    fn get_missing_plugin_is_none() {
        let registry = PluginRegistry::new();
        assert!(registry.runtime("tmux").is_none());
        assert!(registry.scm("github").is_none());
        assert!(registry.notifier("desktop").is_none());
    }

    #[test]
    fn register_and_get_by_slot_and_name() {
        let registry = PluginRegistry::new();
        registry.register(
            PluginManifest::new(PluginSlot::Runtime, "mock", "test runtime"),
            PluginInstance::Runtime(Arc::new(MockRuntime::new())),
        );

        assert!(registry.runtime("mock").is_some());
        // Same name, different slot: still empty.
        assert!(registry.agent("mock").is_none());
    }

    #[test]
    fn reregistering_replaces() {
        let registry = PluginRegistry::new();
        let first = Arc::new(MockNotifier::new());
        let second = Arc::new(MockNotifier::new());

        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "mock", "first"),
            PluginInstance::Notifier(first),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "mock", "second"),
            PluginInstance::Notifier(second),
        );

        let manifests = registry.list(PluginSlot::Notifier);
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].description, "second");
    }

    #[test]
    fn list_filters_by_slot_and_sorts() {
        let registry = PluginRegistry::new();
        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "zeta", ""),
            PluginInstance::Notifier(Arc::new(MockNotifier::new())),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Notifier, "alpha", ""),
            PluginInstance::Notifier(Arc::new(MockNotifier::new())),
        );
        registry.register(
            PluginManifest::new(PluginSlot::Runtime, "mock", ""),
            PluginInstance::Runtime(Arc::new(MockRuntime::new())),
        );

        let names: Vec<String> = registry
            .list(PluginSlot::Notifier)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn load_builtins_always_registers_agent_and_desktop() {
        let registry = PluginRegistry::new();
        registry.load_builtins(&Config::default());

        // These builtins have no external binary requirement.
        assert!(registry.agent("claude").is_some());
        assert!(registry.notifier("desktop").is_some());
    }
}
