//! Effective on-call resolution
//!
//! Answers "who is on call for this scheduler or group at instant `t`",
//! taking shift overrides into account, and turns an escalation target into
//! concrete recipients.
//!
//! # Selection rules
//!
//! ```text
//! scope ──▶ active schedulers ──▶ active shifts with start <= t < end
//!                                      │
//!                     none ──▶ NotFound (a value, not an error)
//!                     many ──▶ earliest start, then smallest shift id
//!                                      │
//!           active overrides of that shift with start <= t < end
//!                     none ──▶ shift user
//!                     many ──▶ latest start, then smallest override id
//! ```
//!
//! Resolution reads through [`ScheduleSource`] and has no side effects, so it
//! can run on a locked connection, inside an escalation transaction, or over
//! an in-memory [`ScheduleSnapshot`].

pub mod cache;

pub use cache::ResolverCache;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::rows;
use crate::store::{EscalationTarget, Override, Scheduler, Shift, Store, StoreResult, UserId};

// ============================================================================
// Types
// ============================================================================

/// What to resolve
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Scheduler(String),
    Group(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler(id) => write!(f, "scheduler:{}", id),
            Self::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// Result of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Who actually gets paged
    pub effective_user_id: UserId,
    /// Owner of the chosen shift
    pub original_user_id: UserId,
    pub is_overridden: bool,
    pub shift_id: String,
    pub scheduler_id: String,
    pub override_id: Option<String>,
}

/// Concrete recipients of an escalation target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetResolution {
    /// Distinct users, in resolution order
    Users(Vec<UserId>),
    /// External collaborator id passed through unresolved
    External(String),
    /// Nobody could be found; carries a human-readable reason
    NotFound(String),
}

// ============================================================================
// Data access
// ============================================================================

/// Read-only view of schedule data
pub trait ScheduleSource {
    fn scheduler(&self, id: &str) -> StoreResult<Option<Scheduler>>;

    /// All schedulers of a group ordered by id, active or not
    fn schedulers_in_group(&self, group_id: &str) -> StoreResult<Vec<Scheduler>>;

    /// Shifts of a scheduler that may cover `at`. Callers re-check coverage.
    fn shifts_covering(&self, scheduler_id: &str, at: DateTime<Utc>) -> StoreResult<Vec<Shift>>;

    fn overrides_for_shift(&self, shift_id: &str) -> StoreResult<Vec<Override>>;
}

impl ScheduleSource for Connection {
    fn scheduler(&self, id: &str) -> StoreResult<Option<Scheduler>> {
        rows::get_scheduler(self, id)
    }

    fn schedulers_in_group(&self, group_id: &str) -> StoreResult<Vec<Scheduler>> {
        rows::schedulers_in_group(self, group_id)
    }

    fn shifts_covering(&self, scheduler_id: &str, at: DateTime<Utc>) -> StoreResult<Vec<Shift>> {
        rows::shifts_covering(self, scheduler_id, at)
    }

    fn overrides_for_shift(&self, shift_id: &str) -> StoreResult<Vec<Override>> {
        rows::overrides_for_shift(self, shift_id)
    }
}

impl ScheduleSource for Store {
    fn scheduler(&self, id: &str) -> StoreResult<Option<Scheduler>> {
        self.read(|c| rows::get_scheduler(c, id))
    }

    fn schedulers_in_group(&self, group_id: &str) -> StoreResult<Vec<Scheduler>> {
        self.read(|c| rows::schedulers_in_group(c, group_id))
    }

    fn shifts_covering(&self, scheduler_id: &str, at: DateTime<Utc>) -> StoreResult<Vec<Shift>> {
        self.read(|c| rows::shifts_covering(c, scheduler_id, at))
    }

    fn overrides_for_shift(&self, shift_id: &str) -> StoreResult<Vec<Override>> {
        self.read(|c| rows::overrides_for_shift(c, shift_id))
    }
}

/// In-memory schedule data
#[derive(Debug, Clone, Default)]
pub struct ScheduleSnapshot {
    pub schedulers: Vec<Scheduler>,
    pub shifts: Vec<Shift>,
    pub overrides: Vec<Override>,
}

impl ScheduleSource for ScheduleSnapshot {
    fn scheduler(&self, id: &str) -> StoreResult<Option<Scheduler>> {
        Ok(self.schedulers.iter().find(|s| s.id == id).cloned())
    }

    fn schedulers_in_group(&self, group_id: &str) -> StoreResult<Vec<Scheduler>> {
        let mut found: Vec<Scheduler> = self
            .schedulers
            .iter()
            .filter(|s| s.group_id == group_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn shifts_covering(&self, scheduler_id: &str, at: DateTime<Utc>) -> StoreResult<Vec<Shift>> {
        Ok(self
            .shifts
            .iter()
            .filter(|s| s.scheduler_id == scheduler_id && s.covers(at))
            .cloned()
            .collect())
    }

    fn overrides_for_shift(&self, shift_id: &str) -> StoreResult<Vec<Override>> {
        Ok(self
            .overrides
            .iter()
            .filter(|o| o.original_shift_id == shift_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Choose the covering shift: earliest start, then smallest id.
pub fn pick_shift<'a>(
    candidates: impl IntoIterator<Item = &'a Shift>,
    at: DateTime<Utc>,
) -> Option<&'a Shift> {
    candidates
        .into_iter()
        .filter(|s| s.covers(at))
        .min_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)))
}

/// Choose the override in force for `shift`: latest start, then smallest id.
pub fn pick_override<'a>(
    shift: &Shift,
    candidates: impl IntoIterator<Item = &'a Override>,
    at: DateTime<Utc>,
) -> Option<&'a Override> {
    candidates
        .into_iter()
        .filter(|o| o.original_shift_id == shift.id && o.covers(at))
        .min_by(|a, b| b.start.cmp(&a.start).then_with(|| a.id.cmp(&b.id)))
}

fn active_schedulers<S: ScheduleSource + ?Sized>(
    source: &S,
    scope: &Scope,
) -> StoreResult<Vec<Scheduler>> {
    Ok(match scope {
        Scope::Scheduler(id) => source.scheduler(id)?.into_iter().collect(),
        Scope::Group(group_id) => source.schedulers_in_group(group_id)?,
    }
    .into_iter()
    .filter(|s| s.active)
    .collect())
}

/// Resolve the effective on-call user for `scope` at `at`.
///
/// `Ok(None)` means nobody is on call; an inactive or unknown scheduler
/// resolves to nobody as well.
pub fn resolve<S: ScheduleSource + ?Sized>(
    source: &S,
    scope: &Scope,
    at: DateTime<Utc>,
) -> StoreResult<Option<Assignment>> {
    let mut candidates = Vec::new();
    for scheduler in active_schedulers(source, scope)? {
        candidates.extend(source.shifts_covering(&scheduler.id, at)?);
    }

    let Some(shift) = pick_shift(&candidates, at) else {
        debug!(scope = %scope, at = %at, "No covering shift");
        return Ok(None);
    };

    let overrides = source.overrides_for_shift(&shift.id)?;
    let assignment = match pick_override(shift, &overrides, at) {
        Some(ov) => Assignment {
            effective_user_id: ov.new_user_id.clone(),
            original_user_id: shift.user_id.clone(),
            is_overridden: true,
            shift_id: shift.id.clone(),
            scheduler_id: shift.scheduler_id.clone(),
            override_id: Some(ov.id.clone()),
        },
        None => Assignment {
            effective_user_id: shift.user_id.clone(),
            original_user_id: shift.user_id.clone(),
            is_overridden: false,
            shift_id: shift.id.clone(),
            scheduler_id: shift.scheduler_id.clone(),
            override_id: None,
        },
    };
    Ok(Some(assignment))
}

/// Turn an escalation target into recipients.
///
/// `incident_group` is used by `current_schedule` targets without their own
/// group id.
pub fn resolve_target<S: ScheduleSource + ?Sized>(
    source: &S,
    target: &EscalationTarget,
    incident_group: &str,
    at: DateTime<Utc>,
) -> StoreResult<TargetResolution> {
    resolve_target_with(source, target, incident_group, at, resolve::<S>)
}

/// [`resolve_target`] with the per-scope lookup supplied by the caller.
pub(crate) fn resolve_target_with<S, F>(
    source: &S,
    target: &EscalationTarget,
    incident_group: &str,
    at: DateTime<Utc>,
    lookup: F,
) -> StoreResult<TargetResolution>
where
    S: ScheduleSource + ?Sized,
    F: Fn(&S, &Scope, DateTime<Utc>) -> StoreResult<Option<Assignment>>,
{
    let resolution = match target {
        EscalationTarget::User(user_id) => TargetResolution::Users(vec![user_id.clone()]),
        EscalationTarget::External(id) => TargetResolution::External(id.clone()),
        EscalationTarget::Scheduler(id) => {
            match lookup(source, &Scope::Scheduler(id.clone()), at)? {
                Some(a) => TargetResolution::Users(vec![a.effective_user_id]),
                None => TargetResolution::NotFound(format!("nobody on call in scheduler {}", id)),
            }
        }
        EscalationTarget::CurrentSchedule(group) => {
            let group_id = group.as_deref().unwrap_or(incident_group);
            match lookup(source, &Scope::Group(group_id.to_string()), at)? {
                Some(a) => TargetResolution::Users(vec![a.effective_user_id]),
                None => TargetResolution::NotFound(format!("nobody on call in group {}", group_id)),
            }
        }
        EscalationTarget::Group(group_id) => {
            let mut users: Vec<UserId> = Vec::new();
            for scheduler in active_schedulers(source, &Scope::Group(group_id.clone()))? {
                if let Some(a) = lookup(source, &Scope::Scheduler(scheduler.id), at)? {
                    if !users.contains(&a.effective_user_id) {
                        users.push(a.effective_user_id);
                    }
                }
            }
            if users.is_empty() {
                TargetResolution::NotFound(format!("no scheduler of group {} has coverage", group_id))
            } else {
                TargetResolution::Users(users)
            }
        }
    };
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    fn scheduler(id: &str, group: &str) -> Scheduler {
        Scheduler {
            id: id.into(),
            group_id: group.into(),
            name: id.into(),
            active: true,
        }
    }

    fn shift(id: &str, sched: &str, user: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Shift {
        Shift {
            id: id.into(),
            scheduler_id: sched.into(),
            user_id: user.into(),
            service_id: None,
            start,
            end,
            active: true,
        }
    }

    fn ov(id: &str, shift: &str, user: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Override {
        Override {
            id: id.into(),
            original_shift_id: shift.into(),
            new_user_id: user.into(),
            reason: None,
            active: true,
            start,
            end,
        }
    }

    #[test]
    fn test_pick_shift_tie_break() {
        let a = shift("b-shift", "s", "u1", at(8, 0), at(18, 0));
        let b = shift("a-shift", "s", "u2", at(8, 0), at(18, 0));
        let c = shift("c-shift", "s", "u3", at(7, 0), at(9, 0));
        let all = [a.clone(), b.clone(), c.clone()];

        // Earliest start wins
        assert_eq!(pick_shift(&all, at(8, 30)).unwrap().id, "c-shift");
        // Equal starts fall back to id, regardless of input order
        assert_eq!(pick_shift(&all, at(10, 0)).unwrap().id, "a-shift");
        let reversed = [b, a];
        assert_eq!(pick_shift(&reversed, at(10, 0)).unwrap().id, "a-shift");
    }

    #[test]
    fn test_pick_shift_ignores_inverted_and_inactive() {
        let inverted = shift("x", "s", "u1", at(18, 0), at(8, 0));
        let mut inactive = shift("y", "s", "u2", at(8, 0), at(18, 0));
        inactive.active = false;
        assert!(pick_shift(&[inverted, inactive], at(10, 0)).is_none());
    }

    #[test]
    fn test_pick_override_latest_start_wins() {
        let s = shift("sh", "s", "alice", at(0, 0), at(23, 0));
        let early = ov("o2", "sh", "bob", at(8, 0), at(12, 0));
        let late = ov("o1", "sh", "carol", at(9, 0), at(12, 0));
        let other_shift = ov("o0", "other", "dave", at(9, 30), at(12, 0));
        let all = [early, late, other_shift];
        assert_eq!(pick_override(&s, &all, at(10, 0)).unwrap().id, "o1");
        assert_eq!(pick_override(&s, &all, at(8, 30)).unwrap().id, "o2");
        assert!(pick_override(&s, &all, at(12, 0)).is_none());
    }

    #[test]
    fn test_group_target_collects_distinct_users() {
        let snap = ScheduleSnapshot {
            schedulers: vec![
                scheduler("s1", "ops"),
                scheduler("s2", "ops"),
                scheduler("s3", "ops"),
            ],
            shifts: vec![
                shift("a", "s1", "alice", at(0, 0), at(23, 0)),
                shift("b", "s2", "alice", at(0, 0), at(23, 0)),
                shift("c", "s3", "bob", at(0, 0), at(23, 0)),
            ],
            overrides: vec![],
        };
        let got = resolve_target(&snap, &EscalationTarget::Group("ops".into()), "ops", at(10, 0))
            .unwrap();
        assert_eq!(got, TargetResolution::Users(vec!["alice".into(), "bob".into()]));
    }

    #[test]
    fn test_current_schedule_uses_incident_group() {
        let snap = ScheduleSnapshot {
            schedulers: vec![scheduler("s1", "ops")],
            shifts: vec![shift("a", "s1", "alice", at(9, 0), at(17, 0))],
            overrides: vec![],
        };
        let target = EscalationTarget::CurrentSchedule(None);
        assert_eq!(
            resolve_target(&snap, &target, "ops", at(10, 0)).unwrap(),
            TargetResolution::Users(vec!["alice".into()])
        );
        assert!(matches!(
            resolve_target(&snap, &target, "dbas", at(10, 0)).unwrap(),
            TargetResolution::NotFound(_)
        ));
    }

    #[test]
    fn test_inactive_scheduler_resolves_to_nobody() {
        let mut s1 = scheduler("s1", "ops");
        s1.active = false;
        let snap = ScheduleSnapshot {
            schedulers: vec![s1],
            shifts: vec![shift("a", "s1", "alice", at(9, 0), at(17, 0))],
            overrides: vec![],
        };
        let scope = Scope::Scheduler("s1".into());
        assert_eq!(resolve(&snap, &scope, at(10, 0)).unwrap(), None);
        assert_eq!(
            resolve(&snap, &scope, at(10, 0) + Duration::hours(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_user_and_external_targets_pass_through() {
        let snap = ScheduleSnapshot::default();
        assert_eq!(
            resolve_target(&snap, &EscalationTarget::User("u9".into()), "g", at(1, 0)).unwrap(),
            TargetResolution::Users(vec!["u9".into()])
        );
        assert_eq!(
            resolve_target(&snap, &EscalationTarget::External("hook".into()), "g", at(1, 0))
                .unwrap(),
            TargetResolution::External("hook".into())
        );
    }
}
