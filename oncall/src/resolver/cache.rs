//! Short-lived memo of resolutions
//!
//! Keyed by (scope, instant). Entries expire after a TTL measured on the
//! monotonic clock, so a schedule change becomes visible within one TTL even
//! if nobody calls [`ResolverCache::invalidate`].
//!
//! The escalation engine shares one cache across a tick pass, which resolves
//! every due incident at the same instant. Expired entries are swept once the
//! map reaches its capacity, so a long-lived cache stays bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::{resolve, resolve_target_with, Assignment, ScheduleSource, Scope, TargetResolution};
use crate::store::{EscalationTarget, StoreResult};

const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    value: Option<Assignment>,
    inserted: Instant,
}

/// TTL cache in front of [`resolve`]
pub struct ResolverCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<(Scope, i64), Entry>>,
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve through the cache. Misses (including "nobody on call") are
    /// cached too.
    pub fn resolve<S: ScheduleSource + ?Sized>(
        &self,
        source: &S,
        scope: &Scope,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Assignment>> {
        let key = (scope.clone(), at.timestamp_millis());
        if let Ok(entries) = self.entries.lock() {
            if let Some(entry) = entries.get(&key) {
                if entry.inserted.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = resolve(source, scope, at)?;
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                let ttl = self.ttl;
                entries.retain(|_, e| e.inserted.elapsed() < ttl);
                if entries.len() >= self.capacity {
                    entries.clear();
                }
            }
            entries.insert(
                key,
                Entry {
                    value: value.clone(),
                    inserted: Instant::now(),
                },
            );
        }
        Ok(value)
    }

    /// [`resolve_target`](super::resolve_target) with every scope lookup
    /// going through the cache.
    pub fn resolve_target<S: ScheduleSource + ?Sized>(
        &self,
        source: &S,
        target: &EscalationTarget,
        incident_group: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<TargetResolution> {
        resolve_target_with(source, target, incident_group, at, |s, scope, at| {
            self.resolve(s, scope, at)
        })
    }

    /// Drop every entry, e.g. after a schedule import.
    pub fn invalidate(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResolverCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ScheduleSnapshot;
    use crate::store::{Scheduler, Shift};
    use chrono::TimeZone;

    fn snapshot(user: &str) -> ScheduleSnapshot {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        ScheduleSnapshot {
            schedulers: vec![Scheduler {
                id: "s1".into(),
                group_id: "ops".into(),
                name: String::new(),
                active: true,
            }],
            shifts: vec![Shift {
                id: "sh".into(),
                scheduler_id: "s1".into(),
                user_id: user.into(),
                service_id: None,
                start,
                end: start + chrono::Duration::days(1),
                active: true,
            }],
            overrides: vec![],
        }
    }

    #[test]
    fn test_cache_hit_until_invalidated() {
        let cache = ResolverCache::new(Duration::from_secs(60));
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let scope = Scope::Scheduler("s1".into());

        let first = cache.resolve(&snapshot("alice"), &scope, at).unwrap().unwrap();
        assert_eq!(first.effective_user_id, "alice");

        // Different data, same key: served from cache
        let cached = cache.resolve(&snapshot("bob"), &scope, at).unwrap().unwrap();
        assert_eq!(cached.effective_user_id, "alice");

        cache.invalidate();
        assert!(cache.is_empty());
        let fresh = cache.resolve(&snapshot("bob"), &scope, at).unwrap().unwrap();
        assert_eq!(fresh.effective_user_id, "bob");
    }

    #[test]
    fn test_zero_ttl_never_serves_stale() {
        let cache = ResolverCache::new(Duration::ZERO);
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let scope = Scope::Group("ops".into());
        cache.resolve(&snapshot("alice"), &scope, at).unwrap();
        let again = cache.resolve(&snapshot("bob"), &scope, at).unwrap().unwrap();
        assert_eq!(again.effective_user_id, "bob");
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_expired_entries_swept_at_capacity() {
        let cache = ResolverCache::with_capacity(Duration::ZERO, 4);
        let scope = Scope::Scheduler("s1".into());
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        for minute in 0..50 {
            let at = start + chrono::Duration::minutes(minute);
            cache.resolve(&snapshot("alice"), &scope, at).unwrap();
            assert!(cache.len() <= 4);
        }
    }

    #[test]
    fn test_target_lookup_shares_entries() {
        let cache = ResolverCache::new(Duration::from_secs(60));
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let target = EscalationTarget::Scheduler("s1".into());

        let first = cache.resolve_target(&snapshot("alice"), &target, "ops", at).unwrap();
        assert_eq!(first, TargetResolution::Users(vec!["alice".into()]));
        assert_eq!(cache.len(), 1);

        let cached = cache.resolve_target(&snapshot("bob"), &target, "ops", at).unwrap();
        assert_eq!(cached, first);
    }
}
