//! Incident audit trail
//!
//! Read-side view over the append-only escalation steps and the delivery
//! log. [`IncidentTrail::timeline`] merges both into one chronological list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{
    AlertEscalation, DeliveryStatus, Incident, NotificationLog, SharedStore, StepStatus,
    StoreResult,
};

/// One line of an incident's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    Step(AlertEscalation),
    Delivery(NotificationLog),
}

impl TimelineEntry {
    /// When the entry happened: step creation, or the delivery's last update
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Step(step) => step.created_at,
            Self::Delivery(log) => log.sent_at.unwrap_or(log.updated_at),
        }
    }

    /// Single-line rendering for terminals and logs
    pub fn describe(&self) -> String {
        match self {
            Self::Step(step) => format!(
                "level {} cycle {} -> {} [{}]{}",
                step.level_number,
                step.cycle + 1,
                step.target_name,
                step.status,
                step.note
                    .as_deref()
                    .map(|n| format!(" {}", n))
                    .unwrap_or_default()
            ),
            Self::Delivery(log) => format!(
                "{} via {} [{}] retries={}{}",
                log.recipient,
                log.channel,
                log.status,
                log.retry_count,
                log.error_message
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Counts over an incident's trail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailSummary {
    pub steps: usize,
    pub failed_steps: usize,
    pub timed_out_steps: usize,
    /// Highest cycle seen, 1-based; 0 when nothing was escalated
    pub cycles: u32,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub in_flight: usize,
    /// Seconds from creation to acknowledgement
    pub time_to_ack_secs: Option<i64>,
}

/// Everything recorded about one incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentTrail {
    pub incident: Incident,
    pub steps: Vec<AlertEscalation>,
    pub deliveries: Vec<NotificationLog>,
}

impl IncidentTrail {
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = self
            .steps
            .iter()
            .cloned()
            .map(TimelineEntry::Step)
            .chain(self.deliveries.iter().cloned().map(TimelineEntry::Delivery))
            .collect();
        // Stable: steps stay ahead of deliveries they caused at equal times
        entries.sort_by_key(|e| e.at());
        entries
    }

    pub fn summary(&self) -> TrailSummary {
        let mut summary = TrailSummary {
            steps: self.steps.len(),
            time_to_ack_secs: self
                .incident
                .acknowledged_at
                .map(|at| (at - self.incident.created_at).num_seconds()),
            ..TrailSummary::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Failed => summary.failed_steps += 1,
                StepStatus::Timeout => summary.timed_out_steps += 1,
                _ => {}
            }
            summary.cycles = summary.cycles.max(step.cycle + 1);
        }
        for log in &self.deliveries {
            match log.status {
                DeliveryStatus::Sent => summary.sent += 1,
                DeliveryStatus::Skipped => summary.skipped += 1,
                DeliveryStatus::Failed => summary.failed += 1,
                DeliveryStatus::Pending | DeliveryStatus::Retrying => summary.in_flight += 1,
            }
        }
        summary
    }
}

/// Query facade over the store's audit tables
pub struct AuditLog {
    store: SharedStore,
}

impl AuditLog {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Escalation steps in creation order
    pub fn escalation_trail(&self, incident_id: &str) -> StoreResult<Vec<AlertEscalation>> {
        self.store.escalation_steps(incident_id)
    }

    /// Delivery log rows for one fan-out, one per channel
    pub fn deliveries(&self, notification_id: &str) -> StoreResult<Vec<NotificationLog>> {
        self.store.deliveries_for_notification(notification_id)
    }

    pub fn deliveries_for_incident(&self, incident_id: &str) -> StoreResult<Vec<NotificationLog>> {
        self.store.deliveries_for_incident(incident_id)
    }

    /// Full trail, `None` if the incident does not exist
    pub fn incident_trail(&self, incident_id: &str) -> StoreResult<Option<IncidentTrail>> {
        let Some(incident) = self.store.get_incident(incident_id)? else {
            return Ok(None);
        };
        Ok(Some(IncidentTrail {
            steps: self.store.escalation_steps(incident_id)?,
            deliveries: self.store.deliveries_for_incident(incident_id)?,
            incident,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Channel, Priority, Recipient, Store};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn step(level: u32, cycle: u32, status: StepStatus, at: DateTime<Utc>) -> AlertEscalation {
        AlertEscalation {
            id: level as i64,
            incident_id: "inc".into(),
            policy_id: "p".into(),
            level_number: level,
            cycle,
            target_type: "user".into(),
            target_id: Some("alice".into()),
            target_name: "user:alice".into(),
            status,
            note: None,
            created_at: at,
            updated_at: at,
            acknowledged_at: None,
            response_time_secs: None,
        }
    }

    fn delivery(channel: Channel, status: DeliveryStatus, at: DateTime<Utc>) -> NotificationLog {
        NotificationLog {
            notification_id: "n".into(),
            channel,
            recipient: Recipient::User("alice".into()),
            incident_id: "inc".into(),
            status,
            retry_count: 0,
            error_message: None,
            created_at: at,
            updated_at: at,
            sent_at: (status == DeliveryStatus::Sent).then_some(at),
        }
    }

    fn trail() -> IncidentTrail {
        let mut incident = Incident::new("g", "disk full", Priority::High, Some("p".into()), t0());
        incident.acknowledged_at = Some(t0() + Duration::minutes(7));
        IncidentTrail {
            incident,
            steps: vec![
                step(1, 0, StepStatus::Timeout, t0()),
                step(2, 0, StepStatus::Acknowledged, t0() + Duration::minutes(5)),
            ],
            deliveries: vec![
                delivery(Channel::Email, DeliveryStatus::Sent, t0() + Duration::seconds(2)),
                delivery(Channel::Push, DeliveryStatus::Retrying, t0() + Duration::seconds(1)),
                delivery(Channel::Sms, DeliveryStatus::Skipped, t0() + Duration::minutes(6)),
            ],
        }
    }

    #[test]
    fn test_timeline_is_chronological() {
        let timeline = trail().timeline();
        let times: Vec<_> = timeline.iter().map(|e| e.at()).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
        assert!(matches!(timeline[0], TimelineEntry::Step(_)));
        assert!(matches!(timeline[4], TimelineEntry::Delivery(_)));
    }

    #[test]
    fn test_summary_counts() {
        let summary = trail().summary();
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.timed_out_steps, 1);
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.in_flight, 1);
        assert_eq!(summary.time_to_ack_secs, Some(420));
    }

    #[test]
    fn test_describe_mentions_status() {
        let entry = TimelineEntry::Delivery(delivery(Channel::Chat, DeliveryStatus::Failed, t0()));
        assert!(entry.describe().contains("failed"));
        let entry = TimelineEntry::Step(step(3, 1, StepStatus::Failed, t0()));
        assert!(entry.describe().starts_with("level 3 cycle 2"));
    }

    #[test]
    fn test_missing_incident_has_no_trail() {
        let audit = AuditLog::new(Store::open_in_memory().unwrap().shared());
        assert!(audit.incident_trail("nope").unwrap().is_none());
    }

    #[test]
    fn test_trail_reads_store() {
        let store = Store::open_in_memory().unwrap().shared();
        let incident = Incident::new("g", "t", Priority::Low, None, t0());
        store.insert_incident(&incident).unwrap();
        let mut log = delivery(Channel::Email, DeliveryStatus::Sent, t0());
        log.incident_id = incident.id.clone();
        store.record_delivery(&log).unwrap();

        let audit = AuditLog::new(store);
        let trail = audit.incident_trail(&incident.id).unwrap().unwrap();
        assert!(trail.steps.is_empty());
        assert_eq!(trail.deliveries.len(), 1);
        assert_eq!(audit.deliveries("n").unwrap().len(), 1);
    }
}
