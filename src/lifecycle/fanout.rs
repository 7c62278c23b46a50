//! Notifier fan-out: route an event to the notifier set configured for
//! its priority, falling back to the default list. Delivery is
//! sequential and per-notifier failures are swallowed so one broken
//! channel never silences its siblings.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::events::Event;
use crate::plugins::PluginRegistry;

pub struct NotifierFanout {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
}

impl NotifierFanout {
    pub fn new(config: Arc<Config>, registry: Arc<PluginRegistry>) -> Self {
        Self { config, registry }
    }

    /// Deliver an event to every notifier routed for its priority.
    pub async fn notify_human(&self, event: &Event) {
        let names = self
            .config
            .notification_routing
            .get(&event.priority)
            .unwrap_or(&self.config.defaults.notifiers);

        if names.is_empty() {
            debug!(priority = %event.priority, "No notifiers routed for priority");
            return;
        }

        for name in names {
            // A routed name is either a registered instance (webhooks are
            // registered under their configured name) or a named config
            // entry pointing at a plugin.
            let notifier = self.registry.notifier(name).or_else(|| {
                self.config
                    .notifiers
                    .get(name)
                    .and_then(|c| self.registry.notifier(&c.plugin))
            });

            let Some(notifier) = notifier else {
                warn!(notifier = %name, "Routed notifier is not registered");
                continue;
            };

            if let Err(e) = notifier.notify(event).await {
                warn!(notifier = %name, error = %e, "Notifier delivery failed");
            }
        }
    }
}
