//! OpenTelemetry-compatible span helpers
//!
//! Structured `tracing` spans for escalation and delivery. Field names use
//! dot notation so they export cleanly to OpenTelemetry collectors.
//!
//! # Span Hierarchy
//!
//! ```text
//! oncall.escalation.tick          (one per ticker pass)
//!   └─ oncall.escalation.advance  (one per level transition attempt)
//! oncall.router.worker            (one per worker task)
//!   └─ oncall.router.deliver      (one per leased message)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let span = otel::deliver_span("n-1", "sms", 1);
//! let guard = span.enter();
//! // ... dispatch ...
//! otel::record_deliver_result(&span, "sent", 0);
//! drop(guard);
//! ```

use tracing::Span;

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_TICK: &str = "oncall.escalation.tick";
pub const SPAN_ADVANCE: &str = "oncall.escalation.advance";
pub const SPAN_WORKER: &str = "oncall.router.worker";
pub const SPAN_DELIVER: &str = "oncall.router.deliver";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_INCIDENT_ID: &str = "incident.id";
pub const FIELD_FROM_LEVEL: &str = "oncall.escalation.from_level";
pub const FIELD_LEVEL: &str = "oncall.escalation.level";
pub const FIELD_CYCLE: &str = "oncall.escalation.cycle";
pub const FIELD_OUTCOME: &str = "oncall.outcome";
pub const FIELD_NOTIFICATION_ID: &str = "notification.id";
pub const FIELD_CHANNEL: &str = "oncall.channel";
pub const FIELD_DELIVERY_COUNT: &str = "oncall.delivery_count";
pub const FIELD_RETRY_COUNT: &str = "oncall.retry_count";
pub const FIELD_WORKER_ID: &str = "oncall.worker.id";
pub const FIELD_DUE: &str = "oncall.escalation.due";

// ── Span Builders ────────────────────────────────────────────────────

/// Span for one ticker pass.
///
/// Filled later via [`record_tick_result`]: `oncall.escalation.due`.
pub fn tick_span() -> Span {
    tracing::info_span!("oncall.escalation.tick", "oncall.escalation.due" = tracing::field::Empty)
}

pub fn record_tick_result(span: &Span, due: usize) {
    span.record(FIELD_DUE, due as u64);
}

/// Span for one advance attempt.
///
/// Fields filled at creation: `incident.id`, the level being left.
/// Fields filled later via [`record_advance_result`]: outcome, new level and cycle.
pub fn advance_span(incident_id: &str, from_level: u32) -> Span {
    tracing::info_span!(
        "oncall.escalation.advance",
        "incident.id" = %incident_id,
        "oncall.escalation.from_level" = from_level,
        "oncall.escalation.level" = tracing::field::Empty,
        "oncall.escalation.cycle" = tracing::field::Empty,
        "oncall.outcome" = tracing::field::Empty,
    )
}

/// Span for one timeout check. The level being left is only known once the
/// incident is loaded; fill it via [`record_from_level`].
pub fn timeout_span(incident_id: &str) -> Span {
    tracing::info_span!(
        "oncall.escalation.advance",
        "incident.id" = %incident_id,
        "oncall.escalation.from_level" = tracing::field::Empty,
        "oncall.escalation.level" = tracing::field::Empty,
        "oncall.escalation.cycle" = tracing::field::Empty,
        "oncall.outcome" = tracing::field::Empty,
    )
}

pub fn record_from_level(span: &Span, from_level: u32) {
    span.record(FIELD_FROM_LEVEL, from_level);
}

pub fn record_advance_result(span: &Span, outcome: &str, level: u32, cycle: u32) {
    span.record(FIELD_OUTCOME, outcome);
    span.record(FIELD_LEVEL, level);
    span.record(FIELD_CYCLE, cycle);
}

/// Span covering one router worker's lifetime.
pub fn worker_span(worker_id: usize) -> Span {
    tracing::info_span!("oncall.router.worker", "oncall.worker.id" = worker_id as u64)
}

/// Span for processing one leased message.
///
/// Filled later via [`record_deliver_result`]: outcome, retry count.
pub fn deliver_span(notification_id: &str, channel: &str, delivery_count: u32) -> Span {
    tracing::info_span!(
        "oncall.router.deliver",
        "notification.id" = %notification_id,
        "oncall.channel" = %channel,
        "oncall.delivery_count" = delivery_count,
        "oncall.retry_count" = tracing::field::Empty,
        "oncall.outcome" = tracing::field::Empty,
    )
}

pub fn record_deliver_result(span: &Span, outcome: &str, retry_count: u32) {
    span.record(FIELD_OUTCOME, outcome);
    span.record(FIELD_RETRY_COUNT, retry_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        assert!(SPAN_ADVANCE.starts_with("oncall."));
        assert!(SPAN_DELIVER.starts_with("oncall."));
        assert_ne!(SPAN_TICK, SPAN_WORKER);
    }

    #[test]
    fn test_spans_without_subscriber() {
        let span = advance_span("inc-1", 0);
        record_advance_result(&span, "notified", 1, 0);
        let span = deliver_span("n-1", "sms", 1);
        record_deliver_result(&span, "sent", 0);
        let span = tick_span();
        record_tick_result(&span, 3);
        let span = timeout_span("inc-1");
        record_from_level(&span, 2);
    }
}
