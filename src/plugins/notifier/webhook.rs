//! Webhook notifier: POSTs the event as JSON to a configured URL.

use async_trait::async_trait;
use std::time::Duration;

use super::{Notifier, NotifierError};
use crate::events::Event;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifierError> {
        let url = url.into();
        if url.is_empty() {
            return Err(NotifierError::NotConfigured("empty webhook url".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifierError::NotConfigured(e.to_string()))?;
        Ok(Self { url, client })
    }

    /// Construct from the notifier's config options (expects `url`).
    pub fn from_options(
        options: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, NotifierError> {
        let url = options
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NotifierError::NotConfigured("webhook url missing".to_string()))?;
        Self::new(url)
    }

    fn payload(event: &Event) -> serde_json::Value {
        serde_json::json!({
            "id": event.id,
            "type": event.event_type.as_str(),
            "priority": event.priority.as_str(),
            "sessionId": event.session_id,
            "projectId": event.project_id,
            "timestamp": event.timestamp.to_rfc3339(),
            "message": event.message,
            "data": event.data,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .await
            .map_err(|e| NotifierError::DeliveryFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::DeliveryFailed(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[test]
    fn empty_url_is_rejected() {
        assert!(WebhookNotifier::new("").is_err());
    }

    #[test]
    fn from_options_requires_url() {
        let mut options = std::collections::BTreeMap::new();
        assert!(WebhookNotifier::from_options(&options).is_err());

        options.insert(
            "url".to_string(),
            serde_json::json!("https://hooks.example.com/x"),
        );
        assert!(WebhookNotifier::from_options(&options).is_ok());
    }

    #[test]
    fn payload_shape() {
        let event = Event::new(EventType::CiFailing, "app-1", "my-app", "CI failing on PR #9");
        let payload = WebhookNotifier::payload(&event);
        assert_eq!(payload["type"], "ci.failing");
        assert_eq!(payload["priority"], "warning");
        assert_eq!(payload["sessionId"], "app-1");
        assert_eq!(payload["message"], "CI failing on PR #9");
    }
}
