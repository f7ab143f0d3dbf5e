//! Activity Registry (§4.B): time-bounded leases that veto suspend.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::info;

/// 15 minutes, in milliseconds — the clamp ceiling for `activityStart`.
pub const MAX_LEASE_DURATION_MS: u64 = 15 * 60 * 1000;

/// Leases at or above this duration are diagnostic-class: their natural
/// expiry is logged (§4.B).
const DIAGNOSTIC_LOG_THRESHOLD_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityLease {
    pub id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
}

struct Roster {
    /// Keyed by id for O(1) lookup/replace.
    by_id: std::collections::HashMap<String, ActivityLease>,
    /// Ordered by end_time for O(1) min/max; value is the id so a lease can
    /// be removed from both structures in lockstep. Ties broken by id.
    by_end_time: BTreeMap<(i64, String), ()>,
    frozen: bool,
}

impl Roster {
    fn new() -> Self {
        Self {
            by_id: std::collections::HashMap::new(),
            by_end_time: BTreeMap::new(),
            frozen: false,
        }
    }

    fn remove(&mut self, id: &str) -> Option<ActivityLease> {
        let lease = self.by_id.remove(id)?;
        self.by_end_time.remove(&(lease.end_time, lease.id.clone()));
        Some(lease)
    }

    fn insert(&mut self, lease: ActivityLease) {
        self.by_end_time
            .insert((lease.end_time, lease.id.clone()), ());
        self.by_id.insert(lease.id.clone(), lease);
    }
}

/// The Activity Registry. A single mutex protects the roster and the freeze
/// flag; `freeze`/`thaw` bracket the suspend critical section (§5).
pub struct ActivityRegistry {
    roster: Mutex<Roster>,
    /// Fired by a successful `start` so the idle watcher can re-check sooner
    /// (a new lease may be a shorter "long pole" than the last check
    /// assumed). The registry stays decoupled from the state machine itself
    /// (§9 "Cyclic references avoided") — this is a plain notification, not
    /// a reference back into it.
    idle_recheck: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            roster: Mutex::new(Roster::new()),
            idle_recheck: Mutex::new(None),
        }
    }

    pub fn set_idle_recheck_notifier<F>(&self, notifier: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.idle_recheck.lock().unwrap() = Some(Box::new(notifier));
    }

    /// Creates or replaces a lease. Returns `false` iff the registry is
    /// frozen (a successful start does not fail — it additionally signals
    /// that an idle re-check is worth taking, via the returned bool on the
    /// caller side; callers observe this by checking `can_sleep` again).
    pub fn start(&self, id: &str, duration_ms: u64) -> bool {
        let duration_ms = duration_ms.min(MAX_LEASE_DURATION_MS);
        let mut roster = self.roster.lock().unwrap();
        roster.remove(id);

        if roster.frozen {
            return false;
        }

        // start_time/end_time are wall seconds; duration is ms.
        let now = now_wall_seconds();
        let end_time = now + (duration_ms as i64 + 999) / 1000;
        roster.insert(ActivityLease {
            id: id.to_string(),
            start_time: now,
            end_time,
            duration_ms,
        });
        drop(roster);

        if let Some(notify) = self.idle_recheck.lock().unwrap().as_ref() {
            notify();
        }
        true
    }

    pub fn stop(&self, id: &str) {
        let mut roster = self.roster.lock().unwrap();
        roster.remove(id);
    }

    /// True iff no lease has `end_time > now`.
    pub fn can_sleep(&self, now: i64) -> bool {
        let roster = self.roster.lock().unwrap();
        roster
            .by_end_time
            .keys()
            .next_back()
            .map(|(end_time, _)| *end_time <= now)
            .unwrap_or(true)
    }

    pub fn count(&self, from: i64) -> usize {
        let roster = self.roster.lock().unwrap();
        roster
            .by_end_time
            .keys()
            .filter(|(end_time, _)| *end_time > from)
            .count()
    }

    /// Longest remaining duration among unexpired leases, in milliseconds.
    pub fn max_remaining(&self, now: i64) -> u64 {
        let roster = self.roster.lock().unwrap();
        roster
            .by_end_time
            .keys()
            .next_back()
            .map(|(end_time, _)| ((end_time - now).max(0) as u64) * 1000)
            .unwrap_or(0)
    }

    /// Sweeps the time-ordered set from the earliest end_time until it finds
    /// a still-valid lease; O(expired). Leases >= 10 minutes are logged.
    pub fn remove_expired(&self, now: i64) {
        let mut roster = self.roster.lock().unwrap();
        loop {
            let Some((&(end_time, ref id), _)) = roster.by_end_time.iter().next() else {
                break;
            };
            if end_time > now {
                break;
            }
            let id = id.clone();
            if let Some(lease) = roster.remove(&id) {
                if lease.duration_ms >= DIAGNOSTIC_LOG_THRESHOLD_MS {
                    info!(
                        target: "activity",
                        id = %lease.id,
                        duration_ms = lease.duration_ms,
                        "long-pole activity lease expired"
                    );
                }
            }
        }
    }

    /// Takes the roster lock; if any unexpired lease exists, releases it and
    /// returns `false`. Otherwise sets the frozen flag and returns `true`
    /// *while still holding the lock*, guaranteeing no new lease can appear
    /// between the idleness check and the suspend call.
    pub fn freeze(&self, now: i64) -> FreezeGuard<'_> {
        let mut roster = self.roster.lock().unwrap();
        let has_unexpired = roster
            .by_end_time
            .keys()
            .next_back()
            .map(|(end_time, _)| *end_time > now)
            .unwrap_or(false);

        if has_unexpired {
            drop(roster);
            return FreezeGuard {
                registry: self,
                held: false,
            };
        }

        roster.frozen = true;
        drop(roster);
        FreezeGuard {
            registry: self,
            held: true,
        }
    }

    fn thaw_locked(&self) {
        let mut roster = self.roster.lock().unwrap();
        roster.frozen = false;
    }

    pub fn snapshot_text(&self) -> String {
        let roster = self.roster.lock().unwrap();
        let mut out = String::new();
        for lease in roster.by_id.values() {
            out.push_str(&format!(
                "{} end={} dur_ms={}\n",
                lease.id, lease.end_time, lease.duration_ms
            ));
        }
        out
    }
}

/// RAII handle returned by `freeze`. `held()` reports whether the freeze
/// actually took effect; dropping the guard thaws if it did.
pub struct FreezeGuard<'a> {
    registry: &'a ActivityRegistry,
    held: bool,
}

impl FreezeGuard<'_> {
    pub fn held(&self) -> bool {
        self.held
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.registry.thaw_locked();
        }
    }
}

fn now_wall_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_clamps_duration_at_15_minutes() {
        let reg = ActivityRegistry::new();
        assert!(reg.start("x", 30 * 60 * 1000));
        let now = now_wall_seconds();
        assert!(reg.max_remaining(now) <= MAX_LEASE_DURATION_MS + 1000);
    }

    #[test]
    fn start_replaces_existing_lease_with_same_id() {
        let reg = ActivityRegistry::new();
        reg.start("x", 1000);
        assert_eq!(reg.count(now_wall_seconds() - 1), 1);
        reg.start("x", 2000);
        assert_eq!(reg.count(now_wall_seconds() - 1), 1);
    }

    #[test]
    fn can_sleep_false_while_any_lease_unexpired() {
        let reg = ActivityRegistry::new();
        let now = now_wall_seconds();
        reg.start("x", 60_000);
        assert!(!reg.can_sleep(now));
    }

    #[test]
    fn can_sleep_true_with_no_leases() {
        let reg = ActivityRegistry::new();
        assert!(reg.can_sleep(now_wall_seconds()));
    }

    #[test]
    fn freeze_fails_if_unexpired_lease_exists() {
        let reg = ActivityRegistry::new();
        let now = now_wall_seconds();
        reg.start("x", 60_000);
        let guard = reg.freeze(now);
        assert!(!guard.held());
    }

    #[test]
    fn freeze_succeeds_and_thaw_releases_on_drop() {
        let reg = ActivityRegistry::new();
        let now = now_wall_seconds();
        {
            let guard = reg.freeze(now);
            assert!(guard.held());
            // While frozen, start() must fail.
            assert!(!reg.start("late", 1000));
        }
        // After drop (thaw), start() succeeds again.
        assert!(reg.start("after", 1000));
    }

    #[test]
    fn remove_expired_sweeps_from_earliest() {
        let reg = ActivityRegistry::new();
        let now = now_wall_seconds();
        reg.start("a", 0);
        reg.start("b", 3600_000);
        reg.remove_expired(now + 1);
        assert_eq!(reg.count(now - 1), 1);
    }
}
