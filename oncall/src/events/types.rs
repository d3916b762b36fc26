//! Event types published by the escalation engine and notification router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Channel, IncidentId, NotificationId, Priority, UserId};

/// Everything observable about incident escalation and delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnCallEvent {
    /// An incident was stored
    IncidentCreated {
        incident_id: IncidentId,
        group_id: String,
        priority: Priority,
        timestamp: DateTime<Utc>,
    },

    /// A level produced at least one notification request
    LevelNotified {
        incident_id: IncidentId,
        level: u32,
        cycle: u32,
        target: String,
        requests: usize,
        timestamp: DateTime<Utc>,
    },

    /// A level's target could not be resolved
    LevelFailed {
        incident_id: IncidentId,
        level: u32,
        cycle: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A level timed out without acknowledgement
    LevelTimedOut {
        incident_id: IncidentId,
        level: u32,
        cycle: u32,
        timestamp: DateTime<Utc>,
    },

    /// Every cycle ran out without acknowledgement
    EscalationCompleted {
        incident_id: IncidentId,
        cycles: u32,
        timestamp: DateTime<Utc>,
    },

    IncidentAcknowledged {
        incident_id: IncidentId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    IncidentResolved {
        incident_id: IncidentId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// A channel adapter accepted a message
    NotificationSent {
        notification_id: NotificationId,
        incident_id: IncidentId,
        channel: Channel,
        timestamp: DateTime<Utc>,
    },

    /// Preference filtering dropped a channel
    NotificationSkipped {
        notification_id: NotificationId,
        incident_id: IncidentId,
        channel: Channel,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A transient failure was scheduled for another attempt
    NotificationRetrying {
        notification_id: NotificationId,
        incident_id: IncidentId,
        channel: Channel,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Delivery gave up
    NotificationFailed {
        notification_id: NotificationId,
        incident_id: IncidentId,
        channel: Channel,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OnCallEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IncidentCreated { .. } => "incident_created",
            Self::LevelNotified { .. } => "level_notified",
            Self::LevelFailed { .. } => "level_failed",
            Self::LevelTimedOut { .. } => "level_timed_out",
            Self::EscalationCompleted { .. } => "escalation_completed",
            Self::IncidentAcknowledged { .. } => "incident_acknowledged",
            Self::IncidentResolved { .. } => "incident_resolved",
            Self::NotificationSent { .. } => "notification_sent",
            Self::NotificationSkipped { .. } => "notification_skipped",
            Self::NotificationRetrying { .. } => "notification_retrying",
            Self::NotificationFailed { .. } => "notification_failed",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::IncidentCreated { timestamp, .. }
            | Self::LevelNotified { timestamp, .. }
            | Self::LevelFailed { timestamp, .. }
            | Self::LevelTimedOut { timestamp, .. }
            | Self::EscalationCompleted { timestamp, .. }
            | Self::IncidentAcknowledged { timestamp, .. }
            | Self::IncidentResolved { timestamp, .. }
            | Self::NotificationSent { timestamp, .. }
            | Self::NotificationSkipped { timestamp, .. }
            | Self::NotificationRetrying { timestamp, .. }
            | Self::NotificationFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn incident_id(&self) -> &str {
        match self {
            Self::IncidentCreated { incident_id, .. }
            | Self::LevelNotified { incident_id, .. }
            | Self::LevelFailed { incident_id, .. }
            | Self::LevelTimedOut { incident_id, .. }
            | Self::EscalationCompleted { incident_id, .. }
            | Self::IncidentAcknowledged { incident_id, .. }
            | Self::IncidentResolved { incident_id, .. }
            | Self::NotificationSent { incident_id, .. }
            | Self::NotificationSkipped { incident_id, .. }
            | Self::NotificationRetrying { incident_id, .. }
            | Self::NotificationFailed { incident_id, .. } => incident_id,
        }
    }
}
