//! Escalation and delivery events
//!
//! The engine and the router publish [`OnCallEvent`]s on a shared
//! [`EventBus`]. Subscribers (the daemon's logger, tests) filter with
//! [`EventFilter`].
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Engine /    │────▶│  Event Bus   │────▶│  Subscribers │
//! │  Router      │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, SharedEventBus};
pub use types::OnCallEvent;
