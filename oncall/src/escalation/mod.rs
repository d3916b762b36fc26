//! Escalation state machine
//!
//! Drives an unacknowledged incident through the numbered levels of its
//! policy, repeating whole passes up to the policy's repeat limit.
//!
//! # Lifecycle
//!
//! ```text
//! create_incident ──▶ trigger ──▶ level 1 notified ─┐
//!                                                   │ timeout (tick)
//!                         level N notified ◀────────┘
//!                                │ last level timed out
//!                                ├─ cycles left ──▶ level 1, cycle + 1
//!                                └─ none left   ──▶ completed
//!
//! acknowledge / resolve at any point ──▶ stopped
//! ```
//!
//! Unreachable levels (no coverage, undefined level number) are written as
//! `failed` audit rows and skipped without waiting for a timeout.

pub mod engine;
pub mod state;
pub mod template;
pub mod ticker;

pub use engine::{
    AckOutcome, AdvanceOutcome, EscalationConfig, EscalationEngine, EscalationError,
    EscalationResult, ResolveOutcome, TickReport, TimeoutOutcome, TriggerOutcome,
};
pub use state::{can_transition, next_cursor, Cursor};
pub use template::{render, render_message, TemplateContext};
pub use ticker::EscalationTicker;
