//! HTTP webhook adapter
//!
//! POSTs a JSON payload per delivery. 5xx, 429 and transport errors are
//! transient; other non-success statuses are permanent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::adapter::{ChannelAdapter, DeliveryError, RenderedMessage};
use crate::store::Channel;

pub struct WebhookAdapter {
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map an HTTP status to a delivery result.
pub fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DeliveryError::Transient(format!("webhook returned {}", status)))
    } else {
        Err(DeliveryError::Permanent(format!("webhook returned {}", status)))
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(
        &self,
        channel: Channel,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "channel": channel,
            "address": address,
            "notification_id": message.notification_id,
            "incident_id": message.incident_id,
            "recipient": message.recipient,
            "priority": message.priority,
            "subject": message.subject,
            "body": message.body,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "Webhook response");
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::ACCEPTED).is_ok());
        assert!(classify_status(StatusCode::BAD_GATEWAY)
            .unwrap_err()
            .is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS)
            .unwrap_err()
            .is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND)
            .unwrap_err()
            .is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let adapter =
            WebhookAdapter::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let message = RenderedMessage {
            notification_id: "n".into(),
            incident_id: "i".into(),
            recipient: crate::store::Recipient::External("ext".into()),
            priority: crate::store::Priority::Low,
            subject: "s".into(),
            body: "b".into(),
        };
        let err = adapter
            .deliver(Channel::Chat, "ext", &message)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
