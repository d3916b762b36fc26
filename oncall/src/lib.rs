//! On-call incident core
//!
//! This library provides:
//! - Effective on-call resolution over shifts and overrides
//! - A per-incident escalation state machine driven by level timeouts
//! - A durable notification queue drained by a pool of router workers
//!
//! # Architecture
//!
//! ```text
//!  create_incident ──▶ EscalationEngine ──▶ AlertEscalation rows
//!                         │      ▲
//!            resolve_target│      │ tick / on_timeout
//!                         ▼      │
//!                      resolver  EscalationTicker
//!                         │
//!                         ▼
//!                  notification queue ──▶ NotificationRouter workers
//!                                              │
//!                                  filter ─▶ ChannelAdapter ─▶ delivery log
//! ```
//!
//! Every piece of durable state lives in one SQLite [`store::Store`]. Time is
//! read through an injectable [`clock::Clock`] so escalation timing can be
//! driven by tests.

#![allow(clippy::uninlined_format_args)]

pub mod audit;
pub mod clock;
pub mod escalation;
pub mod events;
pub mod otel;
pub mod resolver;
pub mod router;
pub mod store;

pub use audit::{AuditLog, IncidentTrail, TimelineEntry, TrailSummary};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use escalation::{
    AckOutcome, AdvanceOutcome, EscalationConfig, EscalationEngine, EscalationError,
    EscalationResult, EscalationTicker, ResolveOutcome, TickReport, TimeoutOutcome,
    TriggerOutcome,
};
pub use events::{EventBus, EventFilter, OnCallEvent, SharedEventBus};
pub use resolver::{resolve, resolve_target, Assignment, ResolverCache, Scope, TargetResolution};
pub use router::{
    AdapterRegistry, ChannelAdapter, DeliveryError, LogAdapter, NotificationRouter,
    ProcessOutcome, RenderedMessage, RetryPolicy, RouterConfig, RouterError, WebhookAdapter,
    WorkerStats,
};
pub use store::{SharedStore, Store, StoreError, StoreResult};
