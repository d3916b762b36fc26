//! Notification routing
//!
//! Consumes queued (recipient, channel) requests produced by the escalation
//! engine and turns each into at most one adapter call. Delivery is
//! at-least-once from the queue's point of view; the delivery log keyed by
//! (notification id, channel) makes redelivery a no-op once a terminal
//! outcome is recorded.

pub mod adapter;
pub mod backoff;
pub mod filter;
pub mod webhook;
pub mod worker;

pub use adapter::{AdapterRegistry, ChannelAdapter, DeliveryError, LogAdapter, RenderedMessage};
pub use backoff::RetryPolicy;
pub use filter::{route, RouteDecision, SkipReason};
pub use webhook::WebhookAdapter;
pub use worker::{
    NotificationRouter, ProcessOutcome, RouterConfig, RouterError, RouterResult, WorkerStats,
};
