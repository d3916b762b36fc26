//! Core record types for the on-call store
//!
//! These types are persisted in SQLite and represent schedules, escalation
//! policies, incidents, and the two append-only audit trails (escalation
//! steps and notification delivery attempts).

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unique identifier for incidents
pub type IncidentId = String;

/// Unique identifier for users
pub type UserId = String;

/// Groups the per-channel fan-out of one logical notification
pub type NotificationId = String;

/// Raised when a stored enum column holds text no variant matches
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Text encoding shared by every enum that is stored as a column.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Column encoding of this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// Channels and priorities
// ============================================================================

/// Delivery channel.
///
/// Variants are declared from least to most intrusive; the derived ordering is
/// what the quiet-hours fallback uses to pick the gentlest channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Chat,
    Push,
    Sms,
}

text_enum!(Channel, "channel", {
    Email => "email",
    Chat => "chat",
    Push => "push",
    Sms => "sms",
});

impl Channel {
    /// Every channel, least intrusive first
    pub fn all() -> &'static [Channel] {
        &[Channel::Email, Channel::Chat, Channel::Push, Channel::Sms]
    }
}

/// Incident / notification priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

text_enum!(Priority, "priority", {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl Priority {
    /// Urgent priorities bypass quiet hours and do-not-disturb.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::High
    }
}

// ============================================================================
// Schedules
// ============================================================================

/// A rotation belonging to a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Time-boxed assignment of one user within a scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: String,
    pub scheduler_id: String,
    pub user_id: UserId,
    /// Optional narrowing of the shift to a single service
    #[serde(default)]
    pub service_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Shift {
    /// Whether this shift puts its user on call at `at`.
    ///
    /// Malformed windows (start >= end) never cover anything.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.active && self.start < self.end && self.start <= at && at < self.end
    }
}

/// Temporary reassignment of a single shift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    pub original_shift_id: String,
    pub new_user_id: UserId,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Override {
    /// Whether the override is in force at `at`, independent of its shift.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.active && self.start < self.end && self.start <= at && at < self.end
    }
}

// ============================================================================
// Escalation policies
// ============================================================================

/// Ordered escalation policy owned by a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub name: String,
    /// Number of full passes through the levels before giving up
    #[serde(default = "default_repeat")]
    pub repeat_max_times: u32,
    /// Timeout applied to levels that do not set their own
    #[serde(default)]
    pub escalate_after_minutes: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// What a level pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTarget {
    /// A specific user, no resolution
    User(String),
    /// Every rotation of a group
    Group(String),
    /// One rotation
    Scheduler(String),
    /// Whoever is on call for a group right now (the incident's group if unset)
    CurrentSchedule(Option<String>),
    /// Handed to an external collaborator as-is
    External(String),
}

impl EscalationTarget {
    /// Column encoding of the target type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Group(_) => "group",
            Self::Scheduler(_) => "scheduler",
            Self::CurrentSchedule(_) => "current_schedule",
            Self::External(_) => "external",
        }
    }

    /// Column encoding of the target id
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::User(id) | Self::Group(id) | Self::Scheduler(id) | Self::External(id) => {
                Some(id)
            }
            Self::CurrentSchedule(group) => group.as_deref(),
        }
    }

    /// Rebuild a target from its stored (type, id) pair.
    pub fn from_parts(kind: &str, id: Option<String>) -> Result<Self, UnknownVariant> {
        let missing = || UnknownVariant {
            kind: "target id",
            value: format!("{kind} without id"),
        };
        match kind {
            "user" => id.map(Self::User).ok_or_else(missing),
            "group" => id.map(Self::Group).ok_or_else(missing),
            "scheduler" => id.map(Self::Scheduler).ok_or_else(missing),
            "current_schedule" => Ok(Self::CurrentSchedule(id)),
            "external" => id.map(Self::External).ok_or_else(missing),
            other => Err(UnknownVariant {
                kind: "target type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EscalationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target_id() {
            Some(id) => write!(f, "{}:{}", self.kind(), id),
            None => f.write_str(self.kind()),
        }
    }
}

/// One numbered step of a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationLevel {
    pub policy_id: String,
    /// 1-based, unique per policy
    pub level_number: u32,
    pub target: EscalationTarget,
    /// Falls back to the policy's `escalate_after_minutes` when unset
    pub timeout_minutes: Option<u32>,
    pub channels: Vec<Channel>,
    pub message_template: Option<String>,
}

// ============================================================================
// Incidents
// ============================================================================

/// Incident lifecycle as seen by responders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

text_enum!(IncidentStatus, "incident status", {
    Triggered => "triggered",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
});

/// Escalation progress of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    None,
    Pending,
    Escalating,
    Completed,
    Stopped,
}

text_enum!(EscalationStatus, "escalation status", {
    None => "none",
    Pending => "pending",
    Escalating => "escalating",
    Completed => "completed",
    Stopped => "stopped",
});

/// The subject of escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub title: String,
    pub group_id: String,
    pub priority: Priority,
    pub status: IncidentStatus,
    pub escalation_status: EscalationStatus,
    pub escalation_policy_id: Option<String>,
    /// Level currently paged; 0 before the first advance
    pub current_level: u32,
    /// 1-based pass through the policy; 0 before the first advance
    pub escalation_cycle: u32,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<UserId>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every write
    pub version: i64,
}

impl Incident {
    /// Create a freshly triggered incident
    pub fn new(
        group_id: impl Into<String>,
        title: impl Into<String>,
        priority: Priority,
        escalation_policy_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            group_id: group_id.into(),
            priority,
            status: IncidentStatus::Triggered,
            escalation_status: EscalationStatus::None,
            escalation_policy_id,
            current_level: 0,
            escalation_cycle: 0,
            last_escalated_at: None,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

// ============================================================================
// Escalation audit trail
// ============================================================================

/// Status of one escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executing,
    Completed,
    Failed,
    Acknowledged,
    Timeout,
}

text_enum!(StepStatus, "step status", {
    Executing => "executing",
    Completed => "completed",
    Failed => "failed",
    Acknowledged => "acknowledged",
    Timeout => "timeout",
});

/// Audit row: one escalation attempt at one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEscalation {
    pub id: i64,
    pub incident_id: IncidentId,
    pub policy_id: String,
    pub level_number: u32,
    pub cycle: u32,
    pub target_type: String,
    pub target_id: Option<String>,
    pub target_name: String,
    pub status: StepStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub response_time_secs: Option<i64>,
}

/// Insert form of [`AlertEscalation`]
#[derive(Debug, Clone)]
pub struct NewEscalationStep {
    pub incident_id: IncidentId,
    pub policy_id: String,
    pub level_number: u32,
    pub cycle: u32,
    pub target_type: String,
    pub target_id: Option<String>,
    pub target_name: String,
    pub status: StepStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Notification preferences
// ============================================================================

/// Per-channel enablement and address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSetting {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub address: Option<String>,
}

impl Default for ChannelSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
        }
    }
}

/// Daily local-time window; wraps midnight when `start > end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    /// Whether `t` falls in [start, end). An empty window (start == end) contains nothing.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Per-user routing preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub user_id: UserId,
    pub email: ChannelSetting,
    pub chat: ChannelSetting,
    pub push: ChannelSetting,
    pub sms: ChannelSetting,
    pub high_channels: Vec<Channel>,
    pub medium_channels: Vec<Channel>,
    pub low_channels: Vec<Channel>,
    pub quiet_hours: Option<QuietWindow>,
    pub dnd_enabled: bool,
    /// DND applies all day when enabled without a window
    pub dnd_window: Option<QuietWindow>,
    /// IANA zone name used to evaluate both windows
    pub timezone: String,
}

impl NotificationConfig {
    /// Default config created lazily for users without preferences. Every
    /// tier maps to every channel, so only the level's channel list decides.
    pub fn permissive(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: ChannelSetting::default(),
            chat: ChannelSetting::default(),
            push: ChannelSetting::default(),
            sms: ChannelSetting::default(),
            high_channels: Channel::all().to_vec(),
            medium_channels: Channel::all().to_vec(),
            low_channels: Channel::all().to_vec(),
            quiet_hours: None,
            dnd_enabled: false,
            dnd_window: None,
            timezone: "UTC".to_string(),
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelSetting {
        match channel {
            Channel::Email => &self.email,
            Channel::Chat => &self.chat,
            Channel::Push => &self.push,
            Channel::Sms => &self.sms,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelSetting {
        match channel {
            Channel::Email => &mut self.email,
            Channel::Chat => &mut self.chat,
            Channel::Push => &mut self.push,
            Channel::Sms => &mut self.sms,
        }
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.channel(channel).enabled
    }

    /// Channels mapped to a priority tier. Critical shares the high tier.
    pub fn tier_channels(&self, priority: Priority) -> &[Channel] {
        match priority {
            Priority::Critical | Priority::High => &self.high_channels,
            Priority::Medium => &self.medium_channels,
            Priority::Low => &self.low_channels,
        }
    }

    /// Wall-clock time in the user's zone. Unknown zones fall back to UTC.
    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveTime {
        match self.timezone.parse::<Tz>() {
            Ok(tz) => at.with_timezone(&tz).time(),
            Err(_) => at.time(),
        }
    }

    pub fn in_quiet_hours(&self, at: DateTime<Utc>) -> bool {
        self.quiet_hours
            .map(|w| w.contains(self.local_time(at)))
            .unwrap_or(false)
    }

    pub fn in_do_not_disturb(&self, at: DateTime<Utc>) -> bool {
        if !self.dnd_enabled {
            return false;
        }
        self.dnd_window
            .map(|w| w.contains(self.local_time(at)))
            .unwrap_or(true)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self::permissive(String::new())
    }
}

// ============================================================================
// Notification queue and delivery log
// ============================================================================

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    /// A resolved user; routed through their preferences
    User(UserId),
    /// An external target id passed through unresolved
    External(String),
}

impl Recipient {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::External(_) => "external",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::External(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Result<Self, UnknownVariant> {
        match kind {
            "user" => Ok(Self::User(id)),
            "external" => Ok(Self::External(id)),
            other => Err(UnknownVariant {
                kind: "recipient kind",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A request for one (recipient, channel) delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub notification_id: NotificationId,
    pub incident_id: IncidentId,
    pub recipient: Recipient,
    pub channel: Channel,
    /// Every channel of the same logical notification
    pub requested_channels: Vec<Channel>,
    pub priority: Priority,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// A queue message currently leased by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub message_id: i64,
    /// Proof of ownership; acks and requeues with a stale token are ignored
    pub lease_token: String,
    /// Times this message has been leased, including this one
    pub delivery_count: u32,
    pub request: NotificationRequest,
}

/// Outcome of one (notification, channel) delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Retrying,
    /// Deliberately not delivered by preference filtering
    Skipped,
}

text_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Retrying => "retrying",
    Skipped => "skipped",
});

impl DeliveryStatus {
    /// No further attempt will be made for this key.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Skipped)
    }
}

/// Audit row keyed by (notification id, channel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub notification_id: NotificationId,
    pub channel: Channel,
    pub recipient: Recipient,
    pub incident_id: IncidentId,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn default_repeat() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_channel_order_is_intrusiveness() {
        let mut channels = vec![Channel::Sms, Channel::Chat, Channel::Email, Channel::Push];
        channels.sort();
        assert_eq!(channels, Channel::all());
    }

    #[test]
    fn test_enum_text_roundtrip_and_unknown() {
        assert_eq!("medium".parse::<Priority>().unwrap(), Priority::Medium);
        assert_eq!(EscalationStatus::Escalating.as_str(), "escalating");
        let err = "pager".parse::<Channel>().unwrap_err();
        assert_eq!(err.kind, "channel");
        assert_eq!(err.value, "pager");
    }

    #[test]
    fn test_shift_covers_half_open_window() {
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 6, 17, 0, 0).unwrap();
        let mut shift = Shift {
            id: "s1".into(),
            scheduler_id: "sched".into(),
            user_id: "alice".into(),
            service_id: None,
            start,
            end,
            active: true,
        };
        assert!(shift.covers(start));
        assert!(!shift.covers(end));

        shift.active = false;
        assert!(!shift.covers(start));

        shift.active = true;
        shift.end = start;
        assert!(!shift.covers(start), "start == end covers nothing");
    }

    #[test]
    fn test_quiet_window_wraps_midnight() {
        let window = QuietWindow {
            start: hm(22, 0),
            end: hm(8, 0),
        };
        assert!(window.contains(hm(23, 0)));
        assert!(window.contains(hm(3, 30)));
        assert!(!window.contains(hm(8, 0)));
        assert!(!window.contains(hm(12, 0)));

        let day = QuietWindow {
            start: hm(12, 0),
            end: hm(13, 0),
        };
        assert!(day.contains(hm(12, 30)));
        assert!(!day.contains(hm(13, 0)));
    }

    #[test]
    fn test_quiet_hours_use_user_timezone() {
        let mut config = NotificationConfig::permissive("bob");
        config.quiet_hours = Some(QuietWindow {
            start: hm(22, 0),
            end: hm(8, 0),
        });
        config.timezone = "America/New_York".into();

        // 03:00 UTC in January is 22:00 EST
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 3, 0, 0).unwrap();
        assert!(config.in_quiet_hours(at));
        let noon_local = Utc.with_ymd_and_hms(2025, 1, 15, 17, 0, 0).unwrap();
        assert!(!config.in_quiet_hours(noon_local));
    }

    #[test]
    fn test_dnd_without_window_is_all_day() {
        let mut config = NotificationConfig::permissive("carol");
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        assert!(!config.in_do_not_disturb(at));
        config.dnd_enabled = true;
        assert!(config.in_do_not_disturb(at));
        config.dnd_window = Some(QuietWindow {
            start: hm(0, 0),
            end: hm(6, 0),
        });
        assert!(!config.in_do_not_disturb(at));
    }

    #[test]
    fn test_target_parts_roundtrip() {
        let target = EscalationTarget::Scheduler("primary".into());
        let rebuilt =
            EscalationTarget::from_parts(target.kind(), target.target_id().map(String::from))
                .unwrap();
        assert_eq!(rebuilt, target);
        assert_eq!(
            EscalationTarget::from_parts("current_schedule", None).unwrap(),
            EscalationTarget::CurrentSchedule(None)
        );
        assert!(EscalationTarget::from_parts("user", None).is_err());
        assert!(EscalationTarget::from_parts("team", Some("x".into())).is_err());
    }

    #[test]
    fn test_critical_uses_high_tier() {
        let mut config = NotificationConfig::permissive("dave");
        config.high_channels = vec![Channel::Sms];
        assert_eq!(config.tier_channels(Priority::Critical), &[Channel::Sms]);
        assert!(Priority::Critical.is_urgent());
        assert!(!Priority::Medium.is_urgent());
    }

    #[test]
    fn test_permissive_tiers_cover_every_channel() {
        let config = NotificationConfig::permissive("erin");
        for priority in [Priority::Low, Priority::Medium, Priority::High] {
            assert_eq!(config.tier_channels(priority), Channel::all());
        }
        assert!(Channel::all().iter().all(|c| config.is_enabled(*c)));
    }
}
