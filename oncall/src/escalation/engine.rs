//! Escalation engine
//!
//! Drives an incident through its policy's levels. Every public operation is
//! one immediate store transaction that re-reads the incident, decides, and
//! writes the incident row with a version check. Notification requests and
//! audit rows are written in the same transaction, so an acknowledgement that
//! commits first always wins over a concurrent timeout.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::state::{can_transition, is_advancing, next_cursor, Cursor};
use super::template::{render_message, TemplateContext};
use crate::clock::SharedClock;
use crate::events::{OnCallEvent, SharedEventBus};
use crate::otel;
use crate::resolver::{resolve_target, ResolverCache, TargetResolution};
use crate::store::queue;
use crate::store::rows;
use crate::store::{
    Channel, EscalationLevel, EscalationPolicy, EscalationStatus, Incident, IncidentStatus,
    NewEscalationStep, NotificationRequest, Priority, Recipient, SharedStore, StepStatus,
    StoreError,
};

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Incident not found: {0}")]
    IncidentNotFound(String),

    #[error("Escalation policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Escalation policy {0} is inactive")]
    PolicyInactive(String),

    /// Another writer updated the incident first; re-read and retry
    #[error("Incident {0} was modified concurrently")]
    Conflict(String),

    #[error("Invalid escalation transition {from} -> {to}")]
    InvalidTransition {
        from: EscalationStatus,
        to: EscalationStatus,
    },
}

impl EscalationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type EscalationResult<T> = Result<T, EscalationError>;

/// Result of moving the cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// A level was notified
    Notified {
        level: u32,
        cycle: u32,
        requests: usize,
        /// Levels skipped on the way because their target was unreachable
        failed_levels: Vec<u32>,
    },
    /// No cycles left
    Completed { cycles: u32, failed_levels: Vec<u32> },
    /// The incident moved on or stopped escalating since the caller looked
    Stale,
}

impl AdvanceOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Notified { .. } => "notified",
            Self::Completed { .. } => "completed",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The incident has no policy; escalation stays `none`
    NoPolicy,
    /// Escalation had already been started or the incident is closed
    AlreadyStarted,
    Started { advance: AdvanceOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TimeoutOutcome {
    NotDue,
    Advanced { advance: AdvanceOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged { steps_acknowledged: usize },
    AlreadyAcknowledged,
    AlreadyResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved,
    AlreadyResolved,
}

/// Summary of one ticker pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub scanned: usize,
    pub advanced: usize,
    pub conflicts: usize,
    pub errors: usize,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the escalation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Level timeout when neither the level nor its policy sets one
    pub default_timeout_minutes: u32,
    /// Channels used by levels that list none
    pub default_channels: Vec<Channel>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 15,
            default_channels: vec![Channel::Email, Channel::Push],
        }
    }
}

impl EscalationConfig {
    /// Timeout of a level: its own minutes, else the policy default, else ours.
    pub fn level_timeout(
        &self,
        level: Option<&EscalationLevel>,
        policy: Option<&EscalationPolicy>,
    ) -> Duration {
        let minutes = level
            .and_then(|l| l.timeout_minutes)
            .filter(|m| *m > 0)
            .or_else(|| policy.map(|p| p.escalate_after_minutes).filter(|m| *m > 0))
            .unwrap_or(self.default_timeout_minutes);
        Duration::minutes(i64::from(minutes))
    }

    fn channels_for<'a>(&'a self, level: &'a EscalationLevel) -> &'a [Channel] {
        if level.channels.is_empty() {
            &self.default_channels
        } else {
            &level.channels
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The escalation state machine
pub struct EscalationEngine {
    store: SharedStore,
    clock: SharedClock,
    config: EscalationConfig,
    events: Option<SharedEventBus>,
    resolver: Option<Arc<ResolverCache>>,
}

impl EscalationEngine {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self::with_config(store, clock, EscalationConfig::default())
    }

    pub fn with_config(store: SharedStore, clock: SharedClock, config: EscalationConfig) -> Self {
        Self {
            store,
            clock,
            config,
            events: None,
            resolver: None,
        }
    }

    /// Publish events on `bus` after each committed change
    pub fn with_events(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Resolve level targets through `cache`. A tick pass resolves every due
    /// incident at one instant, so incidents sharing a rota share lookups.
    pub fn with_resolver_cache(mut self, cache: Arc<ResolverCache>) -> Self {
        self.resolver = Some(cache);
        self
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn publish(&self, events: Vec<OnCallEvent>) {
        if let Some(bus) = &self.events {
            for event in events {
                bus.publish(event);
            }
        }
    }

    /// Store a new incident and trigger its escalation.
    ///
    /// The incident is stored even when triggering fails (missing or inactive
    /// policy); the error is returned and escalation stays `none`.
    pub fn create_incident(
        &self,
        group_id: &str,
        policy_id: Option<&str>,
        title: &str,
        priority: Priority,
    ) -> EscalationResult<(Incident, TriggerOutcome)> {
        let now = self.clock.now();
        let incident = Incident::new(group_id, title, priority, policy_id.map(String::from), now);
        self.store.insert_incident(&incident)?;
        info!(
            incident_id = %incident.id,
            group_id,
            priority = %priority,
            "Incident created"
        );
        self.publish(vec![OnCallEvent::IncidentCreated {
            incident_id: incident.id.clone(),
            group_id: group_id.to_string(),
            priority,
            timestamp: now,
        }]);

        let outcome = self.trigger(&incident.id)?;
        let incident = self
            .store
            .get_incident(&incident.id)?
            .ok_or_else(|| EscalationError::IncidentNotFound(incident.id.clone()))?;
        Ok((incident, outcome))
    }

    /// Start escalation: `none → pending`, then notify the first level.
    pub fn trigger(&self, incident_id: &str) -> EscalationResult<TriggerOutcome> {
        let now = self.clock.now();
        let (outcome, events) = self.store.transaction(|tx| -> EscalationResult<_> {
            let conn: &Connection = tx;
            let mut incident = load_incident(conn, incident_id)?;
            if incident.escalation_status != EscalationStatus::None
                || incident.status != IncidentStatus::Triggered
            {
                return Ok((TriggerOutcome::AlreadyStarted, vec![]));
            }
            let Some(policy_id) = incident.escalation_policy_id.clone() else {
                return Ok((TriggerOutcome::NoPolicy, vec![]));
            };
            let policy = load_active_policy(conn, &policy_id)?;

            transition(&mut incident, EscalationStatus::Pending)?;
            incident.current_level = 0;
            incident.escalation_cycle = 0;
            incident.updated_at = now;
            write_incident(conn, &mut incident)?;

            let mut events = Vec::new();
            let advance = self.advance_locked(conn, &mut incident, &policy, now, &mut events)?;
            Ok((TriggerOutcome::Started { advance }, events))
        })?;

        if outcome == TriggerOutcome::NoPolicy {
            debug!(incident_id, "Incident has no escalation policy");
        }
        self.publish(events);
        Ok(outcome)
    }

    /// Move from `from_level` to the next level.
    ///
    /// Returns [`AdvanceOutcome::Stale`] if the incident is no longer at
    /// `from_level` or no longer escalating, so repeated calls for the same
    /// level transition at most once.
    pub fn advance(&self, incident_id: &str, from_level: u32) -> EscalationResult<AdvanceOutcome> {
        let span = otel::advance_span(incident_id, from_level);
        let _guard = span.enter();
        let now = self.clock.now();

        let (outcome, events) = self.store.transaction(|tx| -> EscalationResult<_> {
            let conn: &Connection = tx;
            let mut incident = load_incident(conn, incident_id)?;
            if incident.current_level != from_level
                || !is_advancing(incident.escalation_status)
                || incident.status != IncidentStatus::Triggered
            {
                return Ok((AdvanceOutcome::Stale, vec![]));
            }
            let policy = load_active_policy(conn, policy_of(&incident)?)?;
            rows::close_executing_steps(conn, &incident.id, StepStatus::Completed, now)?;

            let mut events = Vec::new();
            let outcome = self.advance_locked(conn, &mut incident, &policy, now, &mut events)?;
            Ok((outcome, events))
        })?;

        record_advance(&span, &outcome);
        self.publish(events);
        Ok(outcome)
    }

    /// Advance if the current level has waited out its timeout.
    pub fn on_timeout(&self, incident_id: &str) -> EscalationResult<TimeoutOutcome> {
        self.timeout_at(incident_id, self.clock.now())
    }

    fn timeout_at(&self, incident_id: &str, now: DateTime<Utc>) -> EscalationResult<TimeoutOutcome> {
        let span = otel::timeout_span(incident_id);
        let _guard = span.enter();

        let (outcome, events) = self.store.transaction(|tx| -> EscalationResult<_> {
            let conn: &Connection = tx;
            let mut incident = load_incident(conn, incident_id)?;
            otel::record_from_level(&span, incident.current_level);
            if incident.escalation_status != EscalationStatus::Escalating
                || incident.status != IncidentStatus::Triggered
            {
                return Ok((TimeoutOutcome::NotDue, vec![]));
            }
            let Some(last) = incident.last_escalated_at else {
                return Ok((TimeoutOutcome::NotDue, vec![]));
            };
            let policy = load_active_policy(conn, policy_of(&incident)?)?;
            let levels = rows::levels_for_policy(conn, &policy.id)?;
            let current = levels
                .iter()
                .find(|l| l.level_number == incident.current_level);
            if now - last < self.config.level_timeout(current, Some(&policy)) {
                return Ok((TimeoutOutcome::NotDue, vec![]));
            }

            rows::close_executing_steps(conn, &incident.id, StepStatus::Timeout, now)?;
            let mut events = vec![OnCallEvent::LevelTimedOut {
                incident_id: incident.id.clone(),
                level: incident.current_level,
                cycle: incident.escalation_cycle,
                timestamp: now,
            }];
            info!(
                incident_id = %incident.id,
                level = incident.current_level,
                cycle = incident.escalation_cycle,
                "Escalation level timed out"
            );
            let advance = self.advance_locked(conn, &mut incident, &policy, now, &mut events)?;
            Ok((TimeoutOutcome::Advanced { advance }, events))
        })?;

        if let TimeoutOutcome::Advanced { advance } = &outcome {
            record_advance(&span, advance);
        }
        self.publish(events);
        Ok(outcome)
    }

    /// Acknowledge an incident and stop its escalation.
    pub fn acknowledge(&self, incident_id: &str, user_id: &str) -> EscalationResult<AckOutcome> {
        let now = self.clock.now();
        let outcome = self.store.transaction(|tx| -> EscalationResult<_> {
            let conn: &Connection = tx;
            let mut incident = load_incident(conn, incident_id)?;
            match incident.status {
                IncidentStatus::Resolved => return Ok(AckOutcome::AlreadyResolved),
                IncidentStatus::Acknowledged => return Ok(AckOutcome::AlreadyAcknowledged),
                IncidentStatus::Triggered => {}
            }
            incident.status = IncidentStatus::Acknowledged;
            incident.acknowledged_by = Some(user_id.to_string());
            incident.acknowledged_at = Some(now);
            stop_escalation(&mut incident)?;
            incident.updated_at = now;

            let steps = rows::acknowledge_executing_steps(conn, &incident.id, now)?;
            write_incident(conn, &mut incident)?;
            Ok(AckOutcome::Acknowledged {
                steps_acknowledged: steps,
            })
        })?;

        if let AckOutcome::Acknowledged { steps_acknowledged } = outcome {
            info!(incident_id, user_id, steps_acknowledged, "Incident acknowledged");
            self.publish(vec![OnCallEvent::IncidentAcknowledged {
                incident_id: incident_id.to_string(),
                user_id: user_id.to_string(),
                timestamp: now,
            }]);
        }
        Ok(outcome)
    }

    /// Resolve an incident. Any running escalation is stopped.
    pub fn resolve_incident(
        &self,
        incident_id: &str,
        user_id: &str,
    ) -> EscalationResult<ResolveOutcome> {
        let now = self.clock.now();
        let outcome = self.store.transaction(|tx| -> EscalationResult<_> {
            let conn: &Connection = tx;
            let mut incident = load_incident(conn, incident_id)?;
            if incident.status == IncidentStatus::Resolved {
                return Ok(ResolveOutcome::AlreadyResolved);
            }
            incident.status = IncidentStatus::Resolved;
            incident.resolved_by = Some(user_id.to_string());
            incident.resolved_at = Some(now);
            stop_escalation(&mut incident)?;
            incident.updated_at = now;

            rows::close_executing_steps(conn, &incident.id, StepStatus::Completed, now)?;
            write_incident(conn, &mut incident)?;
            Ok(ResolveOutcome::Resolved)
        })?;

        if outcome == ResolveOutcome::Resolved {
            info!(incident_id, user_id, "Incident resolved");
            self.publish(vec![OnCallEvent::IncidentResolved {
                incident_id: incident_id.to_string(),
                user_id: user_id.to_string(),
                timestamp: now,
            }]);
        }
        Ok(outcome)
    }

    /// Run [`on_timeout`](Self::on_timeout) for every escalating incident.
    ///
    /// Per-incident failures are logged and counted; the pass continues.
    pub fn tick(&self) -> EscalationResult<TickReport> {
        let span = otel::tick_span();
        let _guard = span.enter();

        let now = self.clock.now();
        let incidents = self
            .store
            .incidents_with_escalation_status(EscalationStatus::Escalating)?;
        let mut report = TickReport {
            scanned: incidents.len(),
            ..TickReport::default()
        };

        for incident in incidents {
            match self.timeout_at(&incident.id, now) {
                Ok(TimeoutOutcome::Advanced { .. }) => report.advanced += 1,
                Ok(TimeoutOutcome::NotDue) => {}
                Err(e) if e.is_conflict() => {
                    debug!(incident_id = %incident.id, "Timeout lost a race: {}", e);
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(incident_id = %incident.id, "Timeout handling failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        otel::record_tick_result(&span, report.advanced);
        Ok(report)
    }

    // =========================================================================
    // Transaction internals
    // =========================================================================

    /// Step the cursor until a level is notified or the policy is exhausted.
    ///
    /// Unreachable levels get a `failed` row and are skipped immediately. A
    /// full pass in which every level failed ends the escalation, since the
    /// next pass would fail the same way at the same instant.
    fn advance_locked(
        &self,
        conn: &Connection,
        incident: &mut Incident,
        policy: &EscalationPolicy,
        now: DateTime<Utc>,
        events: &mut Vec<OnCallEvent>,
    ) -> EscalationResult<AdvanceOutcome> {
        let levels = rows::levels_for_policy(conn, &policy.id)?;
        let last_level = levels.iter().map(|l| l.level_number).max().unwrap_or(0);
        let mut failed_levels = Vec::new();
        let mut level = incident.current_level;
        let mut cycle = incident.escalation_cycle;

        loop {
            let cursor = if failed_levels.len() as u32 >= last_level && last_level > 0 {
                Cursor::Exhausted { cycles: cycle + 1 }
            } else {
                next_cursor(level, cycle, last_level, policy.repeat_max_times)
            };

            let (next_level, next_cycle) = match cursor {
                Cursor::Exhausted { cycles } => {
                    transition(incident, EscalationStatus::Completed)?;
                    incident.current_level = level;
                    incident.escalation_cycle = cycle;
                    incident.updated_at = now;
                    write_incident(conn, incident)?;
                    info!(incident_id = %incident.id, cycles, "Escalation completed without acknowledgement");
                    events.push(OnCallEvent::EscalationCompleted {
                        incident_id: incident.id.clone(),
                        cycles,
                        timestamp: now,
                    });
                    return Ok(AdvanceOutcome::Completed {
                        cycles,
                        failed_levels,
                    });
                }
                Cursor::Level { level, cycle } => (level, cycle),
            };
            if next_cycle != cycle {
                // A new pass starts with a clean failure count
                failed_levels.clear();
            }
            level = next_level;
            cycle = next_cycle;

            let Some(def) = levels.iter().find(|l| l.level_number == level) else {
                let reason = format!("level {} is not defined", level);
                self.record_failed(conn, incident, policy, level, cycle, None, &reason, now, events)?;
                failed_levels.push(level);
                continue;
            };

            let resolution = match &self.resolver {
                Some(cache) => cache.resolve_target(conn, &def.target, &incident.group_id, now)?,
                None => resolve_target(conn, &def.target, &incident.group_id, now)?,
            };
            let requests = match resolution {
                TargetResolution::NotFound(reason) => {
                    self.record_failed(conn, incident, policy, level, cycle, Some(def), &reason, now, events)?;
                    failed_levels.push(level);
                    continue;
                }
                TargetResolution::Users(users) => {
                    let recipients: Vec<Recipient> = users.into_iter().map(Recipient::User).collect();
                    self.build_requests(incident, def, cycle, &recipients, now)
                }
                TargetResolution::External(id) => {
                    self.build_requests(incident, def, cycle, &[Recipient::External(id)], now)
                }
            };

            for request in &requests {
                queue::enqueue(conn, request, now)?;
            }
            let target_name = describe_recipients(&requests);
            rows::insert_escalation_step(
                conn,
                &NewEscalationStep {
                    incident_id: incident.id.clone(),
                    policy_id: policy.id.clone(),
                    level_number: level,
                    cycle,
                    target_type: def.target.kind().to_string(),
                    target_id: def.target.target_id().map(String::from),
                    target_name: target_name.clone(),
                    status: StepStatus::Executing,
                    note: None,
                    created_at: now,
                },
            )?;

            transition(incident, EscalationStatus::Escalating)?;
            incident.current_level = level;
            incident.escalation_cycle = cycle;
            incident.last_escalated_at = Some(now);
            incident.updated_at = now;
            write_incident(conn, incident)?;

            info!(
                incident_id = %incident.id,
                level,
                cycle,
                target = %def.target,
                requests = requests.len(),
                "Escalation level notified"
            );
            events.push(OnCallEvent::LevelNotified {
                incident_id: incident.id.clone(),
                level,
                cycle,
                target: target_name,
                requests: requests.len(),
                timestamp: now,
            });
            return Ok(AdvanceOutcome::Notified {
                level,
                cycle,
                requests: requests.len(),
                failed_levels,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failed(
        &self,
        conn: &Connection,
        incident: &Incident,
        policy: &EscalationPolicy,
        level: u32,
        cycle: u32,
        def: Option<&EscalationLevel>,
        reason: &str,
        now: DateTime<Utc>,
        events: &mut Vec<OnCallEvent>,
    ) -> EscalationResult<()> {
        warn!(incident_id = %incident.id, level, cycle, reason, "Escalation level unreachable");
        rows::insert_escalation_step(
            conn,
            &NewEscalationStep {
                incident_id: incident.id.clone(),
                policy_id: policy.id.clone(),
                level_number: level,
                cycle,
                target_type: def.map(|d| d.target.kind()).unwrap_or("unknown").to_string(),
                target_id: def.and_then(|d| d.target.target_id()).map(String::from),
                target_name: def.map(|d| d.target.to_string()).unwrap_or_default(),
                status: StepStatus::Failed,
                note: Some(reason.to_string()),
                created_at: now,
            },
        )?;
        events.push(OnCallEvent::LevelFailed {
            incident_id: incident.id.clone(),
            level,
            cycle,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    /// One request per (recipient, channel); channels of one recipient share
    /// a notification id.
    fn build_requests(
        &self,
        incident: &Incident,
        level: &EscalationLevel,
        cycle: u32,
        recipients: &[Recipient],
        now: DateTime<Utc>,
    ) -> Vec<NotificationRequest> {
        let channels = self.config.channels_for(level);
        let target = level.target.to_string();
        let ctx = TemplateContext::for_incident(incident, level.level_number, cycle, &target);
        let (subject, body) = render_message(level.message_template.as_deref(), &ctx);

        let mut requests = Vec::with_capacity(recipients.len() * channels.len());
        for recipient in recipients {
            let notification_id = uuid::Uuid::new_v4().to_string();
            for channel in channels {
                requests.push(NotificationRequest {
                    notification_id: notification_id.clone(),
                    incident_id: incident.id.clone(),
                    recipient: recipient.clone(),
                    channel: *channel,
                    requested_channels: channels.to_vec(),
                    priority: incident.priority,
                    subject: subject.clone(),
                    body: body.clone(),
                    created_at: now,
                    retry_count: 0,
                });
            }
        }
        requests
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn load_incident(conn: &Connection, incident_id: &str) -> EscalationResult<Incident> {
    rows::get_incident(conn, incident_id)?
        .ok_or_else(|| EscalationError::IncidentNotFound(incident_id.to_string()))
}

fn policy_of(incident: &Incident) -> EscalationResult<&str> {
    incident
        .escalation_policy_id
        .as_deref()
        .ok_or_else(|| EscalationError::PolicyNotFound(format!("incident {} has none", incident.id)))
}

fn load_active_policy(conn: &Connection, policy_id: &str) -> EscalationResult<EscalationPolicy> {
    match rows::get_policy(conn, policy_id)? {
        None => Err(EscalationError::PolicyNotFound(policy_id.to_string())),
        Some(p) if !p.active => Err(EscalationError::PolicyInactive(policy_id.to_string())),
        Some(p) => Ok(p),
    }
}

fn transition(incident: &mut Incident, to: EscalationStatus) -> EscalationResult<()> {
    let from = incident.escalation_status;
    if !can_transition(from, to) {
        return Err(EscalationError::InvalidTransition { from, to });
    }
    incident.escalation_status = to;
    Ok(())
}

fn stop_escalation(incident: &mut Incident) -> EscalationResult<()> {
    match incident.escalation_status {
        EscalationStatus::Completed | EscalationStatus::Stopped => Ok(()),
        _ => transition(incident, EscalationStatus::Stopped),
    }
}

/// Versioned write; keeps the in-memory version in step with the row.
fn write_incident(conn: &Connection, incident: &mut Incident) -> EscalationResult<()> {
    if !rows::update_incident_versioned(conn, incident)? {
        return Err(EscalationError::Conflict(incident.id.clone()));
    }
    incident.version += 1;
    Ok(())
}

fn describe_recipients(requests: &[NotificationRequest]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for r in requests {
        let id = r.recipient.id();
        if !names.contains(&id) {
            names.push(id);
        }
    }
    names.join(",")
}

fn record_advance(span: &tracing::Span, outcome: &AdvanceOutcome) {
    let (level, cycle) = match outcome {
        AdvanceOutcome::Notified { level, cycle, .. } => (*level, *cycle),
        _ => (0, 0),
    };
    otel::record_advance_result(span, outcome.label(), level, cycle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(timeout: Option<u32>, channels: Vec<Channel>) -> EscalationLevel {
        EscalationLevel {
            policy_id: "p".into(),
            level_number: 1,
            target: crate::store::EscalationTarget::User("u".into()),
            timeout_minutes: timeout,
            channels,
            message_template: None,
        }
    }

    fn policy(after: u32) -> EscalationPolicy {
        EscalationPolicy {
            id: "p".into(),
            group_id: "g".into(),
            name: String::new(),
            repeat_max_times: 1,
            escalate_after_minutes: after,
            active: true,
        }
    }

    #[test]
    fn test_level_timeout_fallbacks() {
        let config = EscalationConfig::default();
        assert_eq!(
            config.level_timeout(Some(&level(Some(3), vec![])), Some(&policy(7))),
            Duration::minutes(3)
        );
        assert_eq!(
            config.level_timeout(Some(&level(None, vec![])), Some(&policy(7))),
            Duration::minutes(7)
        );
        assert_eq!(
            config.level_timeout(None, Some(&policy(0))),
            Duration::minutes(15)
        );
    }

    #[test]
    fn test_empty_channel_list_uses_defaults() {
        let config = EscalationConfig::default();
        assert_eq!(
            config.channels_for(&level(None, vec![])),
            &[Channel::Email, Channel::Push]
        );
        assert_eq!(config.channels_for(&level(None, vec![Channel::Sms])), &[Channel::Sms]);
    }

    #[test]
    fn test_stop_escalation_keeps_terminal_states() {
        let mut incident = Incident::new("g", "t", Priority::Low, None, Utc::now());
        incident.escalation_status = EscalationStatus::Completed;
        stop_escalation(&mut incident).unwrap();
        assert_eq!(incident.escalation_status, EscalationStatus::Completed);

        incident.escalation_status = EscalationStatus::Escalating;
        stop_escalation(&mut incident).unwrap();
        assert_eq!(incident.escalation_status, EscalationStatus::Stopped);
    }
}
