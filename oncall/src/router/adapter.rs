//! Channel adapter contract
//!
//! Adapters perform the actual delivery for a channel. The router treats
//! every adapter alike: `Ok`, a transient failure worth retrying, or a
//! permanent failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{Channel, IncidentId, NotificationId, Priority, Recipient};

/// Failure reported by an adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// What an adapter sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub notification_id: NotificationId,
    pub incident_id: IncidentId,
    pub recipient: Recipient,
    pub priority: Priority,
    pub subject: String,
    pub body: String,
}

/// Delivery backend for one or more channels
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Deliver `message` to `address` over `channel`.
    async fn deliver(
        &self,
        channel: Channel,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError>;
}

/// Channel → adapter lookup
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same adapter for every channel
    pub fn uniform(adapter: Arc<dyn ChannelAdapter>) -> Self {
        let mut registry = Self::new();
        for channel in Channel::all() {
            registry.register(*channel, Arc::clone(&adapter));
        }
        registry
    }

    pub fn register(&mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> &mut Self {
        self.adapters.insert(channel, adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.channels().into_iter().map(|c| {
                let name = self.adapters.get(&c).map(|a| a.name().to_string());
                (c, name)
            }))
            .finish()
    }
}

/// Writes each delivery to the log and reports success
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAdapter;

#[async_trait]
impl ChannelAdapter for LogAdapter {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        channel: Channel,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        info!(
            channel = %channel,
            address,
            notification_id = %message.notification_id,
            incident_id = %message.incident_id,
            subject = %message.subject,
            "Notification delivered"
        );
        Ok(())
    }
}
