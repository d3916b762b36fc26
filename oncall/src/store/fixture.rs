//! YAML fixture import
//!
//! Loads schedulers, shifts, overrides, policies with their levels, and user
//! preferences from one document and upserts them in a single transaction.
//!
//! ```yaml
//! schedulers:
//!   - { id: sched-a, group_id: ops, name: primary }
//! shifts:
//!   - { id: sh-1, scheduler_id: sched-a, user_id: alice,
//!       start: "2025-03-01T08:00:00Z", end: "2025-03-01T20:00:00Z" }
//! policies:
//!   - id: pol-ops
//!     group_id: ops
//!     escalate_after_minutes: 5
//!     levels:
//!       - { level_number: 1, target_type: scheduler, target_id: sched-a, channels: [sms] }
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::rows;
use super::store::{Store, StoreError};
use super::types::*;

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse fixture: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Policy {policy_id} level {level_number}: {source}")]
    InvalidLevel {
        policy_id: String,
        level_number: u32,
        source: UnknownVariant,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Level as written in a fixture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelFixture {
    pub level_number: u32,
    pub target_type: String,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub message_template: Option<String>,
}

/// Policy with its levels inline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFixture {
    #[serde(flatten)]
    pub policy: EscalationPolicy,
    #[serde(default)]
    pub levels: Vec<LevelFixture>,
}

/// Whole fixture document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub schedulers: Vec<Scheduler>,
    pub shifts: Vec<Shift>,
    pub overrides: Vec<Override>,
    pub policies: Vec<PolicyFixture>,
    pub notification_configs: Vec<NotificationConfig>,
}

/// Row counts written by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub schedulers: usize,
    pub shifts: usize,
    pub overrides: usize,
    pub policies: usize,
    pub levels: usize,
    pub notification_configs: usize,
}

impl Fixture {
    pub fn from_yaml(text: &str) -> Result<Self, FixtureError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Convert inline levels to store levels, rejecting unknown target types.
    fn levels(&self) -> Result<Vec<EscalationLevel>, FixtureError> {
        let mut out = Vec::new();
        for p in &self.policies {
            for l in &p.levels {
                let target = EscalationTarget::from_parts(&l.target_type, l.target_id.clone())
                    .map_err(|source| FixtureError::InvalidLevel {
                        policy_id: p.policy.id.clone(),
                        level_number: l.level_number,
                        source,
                    })?;
                out.push(EscalationLevel {
                    policy_id: p.policy.id.clone(),
                    level_number: l.level_number,
                    target,
                    timeout_minutes: l.timeout_minutes,
                    channels: l.channels.clone(),
                    message_template: l.message_template.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Upsert everything in one transaction.
    pub fn import(&self, store: &Store, now: DateTime<Utc>) -> Result<ImportSummary, FixtureError> {
        let levels = self.levels()?;
        let summary = store.transaction(|tx| -> Result<ImportSummary, StoreError> {
            for s in &self.schedulers {
                rows::upsert_scheduler(tx, s)?;
            }
            for s in &self.shifts {
                rows::upsert_shift(tx, s)?;
            }
            for o in &self.overrides {
                rows::upsert_override(tx, o)?;
            }
            for p in &self.policies {
                rows::upsert_policy(tx, &p.policy)?;
            }
            for l in &levels {
                rows::upsert_level(tx, l)?;
            }
            for c in &self.notification_configs {
                rows::upsert_notification_config(tx, c, now)?;
            }
            Ok(ImportSummary {
                schedulers: self.schedulers.len(),
                shifts: self.shifts.len(),
                overrides: self.overrides.len(),
                policies: self.policies.len(),
                levels: levels.len(),
                notification_configs: self.notification_configs.len(),
            })
        })?;
        info!(
            schedulers = summary.schedulers,
            shifts = summary.shifts,
            policies = summary.policies,
            levels = summary.levels,
            "Imported fixture"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DOC: &str = r#"
schedulers:
  - { id: sched-a, group_id: ops, name: primary }
shifts:
  - id: sh-1
    scheduler_id: sched-a
    user_id: alice
    start: "2025-03-01T08:00:00Z"
    end: "2025-03-01T20:00:00Z"
overrides:
  - id: ov-1
    original_shift_id: sh-1
    new_user_id: bob
    start: "2025-03-01T10:00:00Z"
    end: "2025-03-01T12:00:00Z"
policies:
  - id: pol-ops
    group_id: ops
    escalate_after_minutes: 5
    levels:
      - { level_number: 1, target_type: scheduler, target_id: sched-a, channels: [sms, push] }
      - { level_number: 2, target_type: current_schedule }
notification_configs:
  - user_id: alice
    sms: { enabled: false }
    timezone: Europe/Berlin
"#;

    #[test]
    fn test_import_fixture() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let summary = Fixture::from_yaml(DOC).unwrap().import(&store, now).unwrap();
        assert_eq!(summary.levels, 2);
        assert_eq!(summary.overrides, 1);

        let policy = store.get_policy("pol-ops").unwrap().unwrap();
        assert_eq!(policy.repeat_max_times, 1);
        let levels = store.levels_for_policy("pol-ops").unwrap();
        assert_eq!(levels[1].target, EscalationTarget::CurrentSchedule(None));

        let alice = store.get_notification_config("alice").unwrap().unwrap();
        assert!(!alice.sms.enabled);
        assert!(alice.email.enabled);
        assert_eq!(alice.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_unknown_target_type_rejected_before_writing() {
        let store = Store::open_in_memory().unwrap();
        let doc = r#"
schedulers:
  - { id: sched-a, group_id: ops }
policies:
  - id: p
    group_id: ops
    levels:
      - { level_number: 1, target_type: fax, target_id: x }
"#;
        let err = Fixture::from_yaml(doc)
            .unwrap()
            .import(&store, Utc::now())
            .unwrap_err();
        assert!(matches!(err, FixtureError::InvalidLevel { level_number: 1, .. }));
        assert!(store.get_policy("p").unwrap().is_none());
    }
}
