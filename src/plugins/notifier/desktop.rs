//! Desktop notification plugin.
//!
//! Linux goes through the freedesktop notification bus, macOS through the
//! notification center. Other platforms log the event and move on.

use async_trait::async_trait;

use super::{Notifier, NotifierError};
use crate::events::{Event, Priority};

#[derive(Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        Self
    }

    fn title(event: &Event) -> String {
        let marker = match event.priority {
            Priority::Urgent => "🚨",
            Priority::Action => "✅",
            Priority::Warning => "⚠️",
            Priority::Info => "ℹ️",
        };
        if event.session_id.is_empty() {
            format!("{marker} overseer")
        } else {
            format!("{marker} {}", event.session_id)
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn name(&self) -> &str {
        "desktop"
    }

    #[cfg(target_os = "linux")]
    async fn notify(&self, event: &Event) -> Result<(), NotifierError> {
        use notify_rust::{Notification, Urgency};

        let urgency = match event.priority {
            Priority::Urgent => Urgency::Critical,
            Priority::Action | Priority::Warning => Urgency::Normal,
            Priority::Info => Urgency::Low,
        };

        // show() blocks on the session bus; keep it off the runtime threads.
        let title = Self::title(event);
        let body = event.message.clone();
        tokio::task::spawn_blocking(move || {
            Notification::new()
                .summary(&title)
                .body(&body)
                .urgency(urgency)
                .show()
                .map(|_| ())
        })
        .await
        .map_err(|e| NotifierError::DeliveryFailed(e.to_string()))?
        .map_err(|e| NotifierError::DeliveryFailed(e.to_string()))
    }

    #[cfg(target_os = "macos")]
    async fn notify(&self, event: &Event) -> Result<(), NotifierError> {
        use mac_notification_sys::Notification;

        let title = Self::title(event);
        let body = event.message.clone();
        tokio::task::spawn_blocking(move || {
            let mut notification = Notification::new();
            notification.title(&title).message(&body);
            notification
                .send()
                .map(|_| ())
                .map_err(|e| NotifierError::DeliveryFailed(e.to_string()))
        })
        .await
        .map_err(|e| NotifierError::DeliveryFailed(e.to_string()))?
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    async fn notify(&self, event: &Event) -> Result<(), NotifierError> {
        tracing::info!(
            event = %event.event_type,
            priority = %event.priority,
            message = %event.message,
            "Desktop notifications unsupported on this platform"
        );
        Ok(())
    }
}
