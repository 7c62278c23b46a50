//! Notifier plugins: outbound channels to humans.

mod desktop;
mod webhook;

pub use desktop::DesktopNotifier;
pub use webhook::WebhookNotifier;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::Event;

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("notifier is not configured: {0}")]
    NotConfigured(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Outbound channel to humans (desktop, webhook, chat).
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &Event) -> Result<(), NotifierError>;
}

/// Recording notifier for tests.
#[derive(Default)]
pub struct MockNotifier {
    state: std::sync::Mutex<MockNotifierState>,
}

#[derive(Default)]
struct MockNotifierState {
    events: Vec<Event>,
    fail: bool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifierError> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(NotifierError::DeliveryFailed("mock failure".to_string()));
        }
        state.events.push(event.clone());
        Ok(())
    }
}
