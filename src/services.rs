//! Process-global service assembly.
//!
//! The dependency chain is acyclic: registry → session manager →
//! lifecycle manager. The shared instance is initialized lazily; the
//! cell caches the in-flight initialization so concurrent first callers
//! share it, and a failed init leaves the cell empty for the next caller
//! to retry.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::plugins::PluginRegistry;
use crate::session::manager::SessionManager;

pub struct Services {
    pub config: Arc<Config>,
    pub registry: Arc<PluginRegistry>,
    pub sessions: Arc<SessionManager>,
    pub lifecycle: Arc<LifecycleManager>,
}

static SERVICES: OnceCell<Arc<Services>> = OnceCell::const_new();

impl Services {
    /// Build a fresh service graph from a loaded config.
    pub fn assemble(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(PluginRegistry::new());
        registry.load_from_config(&config);

        let sessions = Arc::new(SessionManager::new(config.clone(), registry.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            registry.clone(),
            sessions.clone(),
        ));

        Arc::new(Self {
            config,
            registry,
            sessions,
            lifecycle,
        })
    }
}

/// The shared services for this process.
pub async fn services(config_path: Option<PathBuf>) -> Result<Arc<Services>> {
    SERVICES
        .get_or_try_init(|| async {
            let config = Config::load(config_path.as_deref())?;
            Ok(Services::assemble(config))
        })
        .await
        .cloned()
}
