//! Pluggable adapters for everything the engine touches but does not own.
//!
//! Each slot is a closed capability: the runtime hosts the agent process,
//! the agent plugin understands one coding tool, the workspace plugin owns
//! the isolated checkout, tracker and SCM cover the issue source and the
//! PR platform, and notifiers reach humans. The registry indexes one
//! instance per `(slot, name)`.

pub mod agent;
pub mod notifier;
pub mod registry;
pub mod runtime;
pub mod scm;
pub mod terminal;
pub mod tracker;
pub mod workspace;

pub use registry::PluginRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The closed set of plugin slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSlot {
    Runtime,
    Agent,
    Workspace,
    Tracker,
    Scm,
    Notifier,
    Terminal,
}

impl PluginSlot {
    pub const fn as_str(self) -> &'static str {
        match self {
            PluginSlot::Runtime => "runtime",
            PluginSlot::Agent => "agent",
            PluginSlot::Workspace => "workspace",
            PluginSlot::Tracker => "tracker",
            PluginSlot::Scm => "scm",
            PluginSlot::Notifier => "notifier",
            PluginSlot::Terminal => "terminal",
        }
    }
}

impl fmt::Display for PluginSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub slot: PluginSlot,
    pub name: String,
    pub description: String,
}

impl PluginManifest {
    pub fn new(slot: PluginSlot, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            slot,
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A constructed plugin, one variant per slot.
#[derive(Clone)]
pub enum PluginInstance {
    Runtime(Arc<dyn runtime::Runtime>),
    Agent(Arc<dyn agent::Agent>),
    Workspace(Arc<dyn workspace::Workspace>),
    Tracker(Arc<dyn tracker::Tracker>),
    Scm(Arc<dyn scm::Scm>),
    Notifier(Arc<dyn notifier::Notifier>),
    Terminal(Arc<dyn terminal::Terminal>),
}

impl PluginInstance {
    pub fn slot(&self) -> PluginSlot {
        match self {
            PluginInstance::Runtime(_) => PluginSlot::Runtime,
            PluginInstance::Agent(_) => PluginSlot::Agent,
            PluginInstance::Workspace(_) => PluginSlot::Workspace,
            PluginInstance::Tracker(_) => PluginSlot::Tracker,
            PluginInstance::Scm(_) => PluginSlot::Scm,
            PluginInstance::Notifier(_) => PluginSlot::Notifier,
            PluginInstance::Terminal(_) => PluginSlot::Terminal,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginInstance({})", self.slot())
    }
}
