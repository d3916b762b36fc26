//! Persistent state for on-call resolution, escalation and delivery
//!
//! SQLite holds schedules, policies, incidents, the escalation audit trail,
//! user notification preferences, the delivery log and the notification
//! queue. Incidents carry a version column used for compare-and-set updates.

pub mod fixture;
pub mod queue;
pub mod rows;
pub mod schema;
#[allow(clippy::module_inception)]
pub mod store;
pub mod types;

pub use fixture::{Fixture, FixtureError, ImportSummary};
pub use queue::QueueDepth;
pub use store::{SharedStore, Store, StoreError, StoreResult};
pub use types::*;
