//! Per-user channel filtering
//!
//! Decides whether one (recipient, channel) message of a fan-out is delivered
//! given the recipient's preferences, the incident priority and the local
//! time. Filtering never fails: a message that should not go out is a skip.
//!
//! Order of checks:
//!
//! 1. High/critical: tier ∩ enabled ∩ requested, falling back to
//!    requested ∩ enabled, then to requested. Never suppressed.
//! 2. Low/medium inside do-not-disturb: suppressed.
//! 3. Low/medium inside quiet hours: only the least intrusive channel of
//!    requested ∩ enabled goes out.
//! 4. Otherwise: the channel must be requested, enabled and in the tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Channel, NotificationConfig, Priority};

/// Why a channel was not used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotRequested,
    ChannelDisabled,
    NotInTier { priority: Priority },
    DoNotDisturb,
    /// Quiet hours reduced the fan-out to a gentler channel (or none)
    QuietHours { delivered_via: Option<Channel> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRequested => write!(f, "channel not requested"),
            Self::ChannelDisabled => write!(f, "channel disabled by user"),
            Self::NotInTier { priority } => write!(f, "channel not in {} tier", priority),
            Self::DoNotDisturb => write!(f, "do not disturb"),
            Self::QuietHours {
                delivered_via: Some(c),
            } => write!(f, "quiet hours, delivered via {}", c),
            Self::QuietHours { delivered_via: None } => write!(f, "quiet hours"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Deliver,
    Skip(SkipReason),
}

/// Decide whether `channel` is used for a message of `priority` at `at`.
pub fn route(
    config: &NotificationConfig,
    channel: Channel,
    requested: &[Channel],
    priority: Priority,
    at: DateTime<Utc>,
) -> RouteDecision {
    let tier = config.tier_channels(priority);
    let requested_enabled: Vec<Channel> = requested
        .iter()
        .copied()
        .filter(|c| config.is_enabled(*c))
        .collect();

    if priority.is_urgent() {
        let allowed = urgent_channels(tier, &requested_enabled, requested);
        return if allowed.contains(&channel) {
            RouteDecision::Deliver
        } else {
            RouteDecision::Skip(SkipReason::NotInTier { priority })
        };
    }

    if config.in_do_not_disturb(at) {
        return RouteDecision::Skip(SkipReason::DoNotDisturb);
    }

    if config.in_quiet_hours(at) {
        let gentlest = requested_enabled.iter().min().copied();
        return if gentlest == Some(channel) {
            RouteDecision::Deliver
        } else {
            RouteDecision::Skip(SkipReason::QuietHours {
                delivered_via: gentlest,
            })
        };
    }

    if !requested.contains(&channel) {
        RouteDecision::Skip(SkipReason::NotRequested)
    } else if !config.is_enabled(channel) {
        RouteDecision::Skip(SkipReason::ChannelDisabled)
    } else if !tier.contains(&channel) {
        RouteDecision::Skip(SkipReason::NotInTier { priority })
    } else {
        RouteDecision::Deliver
    }
}

fn urgent_channels(tier: &[Channel], requested_enabled: &[Channel], requested: &[Channel]) -> Vec<Channel> {
    let tiered: Vec<Channel> = requested_enabled
        .iter()
        .copied()
        .filter(|c| tier.contains(c))
        .collect();
    if !tiered.is_empty() {
        tiered
    } else if !requested_enabled.is_empty() {
        requested_enabled.to_vec()
    } else {
        requested.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QuietWindow;
    use chrono::{NaiveTime, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    fn quiet(start: u32, end: u32) -> Option<QuietWindow> {
        Some(QuietWindow {
            start: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
        })
    }

    #[test]
    fn test_quiet_hours_pick_least_intrusive() {
        let mut cfg = NotificationConfig::permissive("u");
        cfg.medium_channels = vec![Channel::Chat];
        cfg.quiet_hours = quiet(22, 8);
        let requested = [Channel::Chat, Channel::Email];

        assert_eq!(
            route(&cfg, Channel::Email, &requested, Priority::Medium, at(23)),
            RouteDecision::Deliver
        );
        assert_eq!(
            route(&cfg, Channel::Chat, &requested, Priority::Medium, at(23)),
            RouteDecision::Skip(SkipReason::QuietHours {
                delivered_via: Some(Channel::Email)
            })
        );

        // Outside quiet hours the tier decides
        assert_eq!(
            route(&cfg, Channel::Chat, &requested, Priority::Medium, at(12)),
            RouteDecision::Deliver
        );
        assert!(matches!(
            route(&cfg, Channel::Email, &requested, Priority::Medium, at(12)),
            RouteDecision::Skip(SkipReason::NotInTier { .. })
        ));
    }

    #[test]
    fn test_urgent_never_suppressed() {
        let mut cfg = NotificationConfig::permissive("u");
        cfg.dnd_enabled = true;
        cfg.quiet_hours = quiet(0, 23);
        cfg.high_channels = vec![Channel::Sms];
        cfg.sms.enabled = false;
        let requested = [Channel::Push, Channel::Sms];

        // Tier ∩ enabled is empty, so requested ∩ enabled is used
        assert_eq!(
            route(&cfg, Channel::Push, &requested, Priority::Critical, at(3)),
            RouteDecision::Deliver
        );
        assert!(matches!(
            route(&cfg, Channel::Sms, &requested, Priority::High, at(3)),
            RouteDecision::Skip(_)
        ));

        // Nothing enabled at all: every requested channel still goes out
        cfg.push.enabled = false;
        assert_eq!(
            route(&cfg, Channel::Sms, &requested, Priority::High, at(3)),
            RouteDecision::Deliver
        );
    }

    #[test]
    fn test_dnd_suppresses_low_priority() {
        let mut cfg = NotificationConfig::permissive("u");
        cfg.dnd_enabled = true;
        assert_eq!(
            route(&cfg, Channel::Email, &[Channel::Email], Priority::Low, at(12)),
            RouteDecision::Skip(SkipReason::DoNotDisturb)
        );

        cfg.dnd_window = quiet(1, 2);
        assert_eq!(
            route(&cfg, Channel::Email, &[Channel::Email], Priority::Low, at(12)),
            RouteDecision::Deliver
        );
    }

    #[test]
    fn test_disabled_and_unrequested_channels() {
        let mut cfg = NotificationConfig::permissive("u");
        cfg.email.enabled = false;
        assert_eq!(
            route(&cfg, Channel::Email, &[Channel::Email], Priority::Low, at(12)),
            RouteDecision::Skip(SkipReason::ChannelDisabled)
        );
        assert_eq!(
            route(&cfg, Channel::Chat, &[Channel::Email], Priority::Low, at(12)),
            RouteDecision::Skip(SkipReason::NotRequested)
        );
    }
}
