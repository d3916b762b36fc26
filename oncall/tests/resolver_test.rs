//! Integration tests for effective on-call resolution
//!
//! Exercises the resolver against a real SQLite store, including the
//! override scenarios and target dispatch used by escalation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use oncall::resolver::{resolve, resolve_target, ResolverCache, Scope, TargetResolution};
use oncall::store::{EscalationTarget, Override, Scheduler, Shift, Store};

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
}

fn scheduler(id: &str, group: &str) -> Scheduler {
    Scheduler {
        id: id.into(),
        group_id: group.into(),
        name: id.into(),
        active: true,
    }
}

fn shift(id: &str, scheduler_id: &str, user: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Shift {
    Shift {
        id: id.into(),
        scheduler_id: scheduler_id.into(),
        user_id: user.into(),
        service_id: None,
        start,
        end,
        active: true,
    }
}

fn override_of(id: &str, shift_id: &str, user: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Override {
    Override {
        id: id.into(),
        original_shift_id: shift_id.into(),
        new_user_id: user.into(),
        reason: None,
        active: true,
        start,
        end,
    }
}

/// Store with one scheduler and A on shift 09:00-17:00
fn day_shift_store() -> Store {
    let store = Store::open_in_memory().unwrap();
    store.put_scheduler(&scheduler("primary", "ops")).unwrap();
    store
        .put_shift(&shift("day", "primary", "alice", at(9, 0), at(17, 0)))
        .unwrap();
    store
}

#[test]
fn test_override_covering_whole_shift_replaces_user() {
    let store = day_shift_store();
    store
        .put_override(&override_of("ov", "day", "bob", at(9, 0), at(17, 0)))
        .unwrap();

    let a = resolve(&store, &Scope::Scheduler("primary".into()), at(10, 0))
        .unwrap()
        .unwrap();
    assert_eq!(a.effective_user_id, "bob");
    assert_eq!(a.original_user_id, "alice");
    assert!(a.is_overridden);
    assert_eq!(a.override_id.as_deref(), Some("ov"));
}

#[test]
fn test_override_outside_its_window_has_no_effect() {
    let store = day_shift_store();
    store
        .put_override(&override_of("ov", "day", "bob", at(9, 0), at(12, 0)))
        .unwrap();

    let a = resolve(&store, &Scope::Scheduler("primary".into()), at(14, 0))
        .unwrap()
        .unwrap();
    assert_eq!(a.effective_user_id, "alice");
    assert_eq!(a.original_user_id, "alice");
    assert!(!a.is_overridden);

    // The end is exclusive
    let a = resolve(&store, &Scope::Scheduler("primary".into()), at(12, 0))
        .unwrap()
        .unwrap();
    assert!(!a.is_overridden);
}

#[test]
fn test_no_covering_shift_is_nobody() {
    let store = day_shift_store();
    assert!(resolve(&store, &Scope::Scheduler("primary".into()), at(18, 0))
        .unwrap()
        .is_none());
    assert!(resolve(&store, &Scope::Group("ops".into()), at(8, 59))
        .unwrap()
        .is_none());

    let target = EscalationTarget::Scheduler("primary".into());
    assert!(matches!(
        resolve_target(&store, &target, "ops", at(18, 0)).unwrap(),
        TargetResolution::NotFound(_)
    ));
}

#[test]
fn test_overlapping_shifts_resolve_deterministically() {
    let store = day_shift_store();
    store
        .put_shift(&shift("late", "primary", "carol", at(8, 0), at(20, 0)))
        .unwrap();
    store
        .put_shift(&shift("a-twin", "primary", "dave", at(8, 0), at(12, 0)))
        .unwrap();

    // Earliest start wins, ties go to the smallest id
    for _ in 0..3 {
        let a = resolve(&store, &Scope::Scheduler("primary".into()), at(10, 0))
            .unwrap()
            .unwrap();
        assert_eq!(a.shift_id, "a-twin");
        assert_eq!(a.effective_user_id, "dave");
    }

    let a = resolve(&store, &Scope::Scheduler("primary".into()), at(13, 0))
        .unwrap()
        .unwrap();
    assert_eq!(a.shift_id, "late");
}

#[test]
fn test_malformed_and_inactive_rows_are_ignored() {
    let store = Store::open_in_memory().unwrap();
    store.put_scheduler(&scheduler("primary", "ops")).unwrap();
    // start >= end never covers
    store
        .put_shift(&shift("broken", "primary", "mallory", at(17, 0), at(9, 0)))
        .unwrap();
    let mut off = shift("off", "primary", "oscar", at(9, 0), at(17, 0));
    off.active = false;
    store.put_shift(&off).unwrap();

    assert!(resolve(&store, &Scope::Scheduler("primary".into()), at(10, 0))
        .unwrap()
        .is_none());

    let mut retired = scheduler("retired", "ops");
    retired.active = false;
    store.put_scheduler(&retired).unwrap();
    store
        .put_shift(&shift("r1", "retired", "rita", at(9, 0), at(17, 0)))
        .unwrap();
    assert!(resolve(&store, &Scope::Group("ops".into()), at(10, 0))
        .unwrap()
        .is_none());
}

#[test]
fn test_group_target_collects_distinct_users() {
    let store = day_shift_store();
    store.put_scheduler(&scheduler("secondary", "ops")).unwrap();
    store.put_scheduler(&scheduler("tertiary", "ops")).unwrap();
    store
        .put_shift(&shift("s2", "secondary", "erin", at(0, 0), at(23, 0)))
        .unwrap();
    store
        .put_shift(&shift("s3", "tertiary", "alice", at(0, 0), at(23, 0)))
        .unwrap();

    let resolution = resolve_target(
        &store,
        &EscalationTarget::Group("ops".into()),
        "ignored",
        at(10, 0),
    )
    .unwrap();
    assert_eq!(
        resolution,
        TargetResolution::Users(vec!["alice".to_string(), "erin".to_string()])
    );
}

#[test]
fn test_current_schedule_defaults_to_incident_group() {
    let store = day_shift_store();
    let resolution = resolve_target(
        &store,
        &EscalationTarget::CurrentSchedule(None),
        "ops",
        at(11, 0),
    )
    .unwrap();
    assert_eq!(resolution, TargetResolution::Users(vec!["alice".to_string()]));

    let resolution = resolve_target(
        &store,
        &EscalationTarget::CurrentSchedule(Some("db".into())),
        "ops",
        at(11, 0),
    )
    .unwrap();
    assert!(matches!(resolution, TargetResolution::NotFound(_)));
}

#[test]
fn test_user_and_external_targets_pass_through() {
    let store = Store::open_in_memory().unwrap();
    assert_eq!(
        resolve_target(&store, &EscalationTarget::User("zoe".into()), "g", at(3, 0)).unwrap(),
        TargetResolution::Users(vec!["zoe".to_string()])
    );
    assert_eq!(
        resolve_target(&store, &EscalationTarget::External("slack-ops".into()), "g", at(3, 0))
            .unwrap(),
        TargetResolution::External("slack-ops".to_string())
    );
}

#[test]
fn test_cache_serves_until_invalidated() {
    let store = day_shift_store();
    let cache = ResolverCache::new(std::time::Duration::from_secs(60));
    let scope = Scope::Scheduler("primary".into());

    let first = cache.resolve(&store, &scope, at(10, 0)).unwrap().unwrap();
    assert_eq!(first.effective_user_id, "alice");

    store
        .put_override(&override_of("ov", "day", "bob", at(9, 0), at(17, 0)))
        .unwrap();
    let cached = cache.resolve(&store, &scope, at(10, 0)).unwrap().unwrap();
    assert_eq!(cached.effective_user_id, "alice");

    cache.invalidate();
    let fresh = cache.resolve(&store, &scope, at(10, 0)).unwrap().unwrap();
    assert_eq!(fresh.effective_user_id, "bob");

    // A different instant is a different key
    assert!(cache
        .resolve(&store, &scope, at(10, 0) + Duration::hours(12))
        .unwrap()
        .is_none());
    assert_eq!(cache.len(), 2);
}
