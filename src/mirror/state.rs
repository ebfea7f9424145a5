//! Per-target processing state.
//!
//! The only process-wide mutable state: which targets have been processed in
//! this controller lifetime and which are cooling down after a failure. One
//! mutex guards both maps; a target is never in both at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A snapshot row of the push cache, as served by the admin endpoints.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub target: String,
    pub digest: Option<String>,
    pub last_push: Option<DateTime<Utc>>,
    pub inflight: bool,
}

#[derive(Debug, Clone, Default)]
struct PushedEntry {
    digest: Option<String>,
    last_push: Option<DateTime<Utc>>,
    inflight: bool,
}

/// Outcome of asking to process a target.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// The caller is the first processor; the target is now recorded.
    Begin,
    /// Already processed during this controller lifetime.
    AlreadyProcessed,
    /// A previous failure is still cooling down.
    Cooldown { retry_at: Instant },
}

#[derive(Default)]
struct Inner {
    pushed: HashMap<String, PushedEntry>,
    failed: HashMap<String, Instant>,
}

pub struct PushState {
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl PushState {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("push state poisoned")
    }

    /// Admits a target for processing. Cooldown is checked first; an elapsed
    /// cooldown entry is discarded and the target re-admitted.
    pub fn begin(&self, target: &str, now: Instant) -> Admission {
        let mut inner = self.lock();

        if !self.cooldown.is_zero() {
            if let Some(last_failure) = inner.failed.get(target) {
                let retry_at = *last_failure + self.cooldown;
                if now < retry_at {
                    return Admission::Cooldown { retry_at };
                }
                inner.failed.remove(target);
            }
        }

        if inner.pushed.contains_key(target) {
            return Admission::AlreadyProcessed;
        }
        inner.pushed.insert(
            target.to_owned(),
            PushedEntry {
                inflight: true,
                ..Default::default()
            },
        );
        Admission::Begin
    }

    /// Atomically migrates both maps from `old` to `new` when a session
    /// re-derives its target mid-pipeline. The old key is never left live
    /// after a successful reassignment.
    pub fn reassign(&self, old: &str, new: &str, now: Instant) -> Admission {
        if old == new {
            return Admission::Begin;
        }

        let mut inner = self.lock();

        if !self.cooldown.is_zero() {
            if let Some(last_failure) = inner.failed.get(new) {
                let retry_at = *last_failure + self.cooldown;
                if now < retry_at {
                    inner.pushed.remove(old);
                    return Admission::Cooldown { retry_at };
                }
                inner.failed.remove(new);
            }
            if let Some(last_failure) = inner.failed.remove(old) {
                inner.failed.insert(new.to_owned(), last_failure);
            }
        }

        if inner.pushed.contains_key(new) {
            inner.pushed.remove(old);
            return Admission::AlreadyProcessed;
        }

        if let Some(entry) = inner.pushed.remove(old) {
            inner.pushed.insert(new.to_owned(), entry);
        }
        Admission::Begin
    }

    /// Records a failure. The target leaves the pushed set; when the
    /// cooldown is enabled the failure instant is recorded and the
    /// resulting retry time returned.
    pub fn fail(&self, target: &str, now: Instant) -> Option<Instant> {
        let mut inner = self.lock();
        inner.pushed.remove(target);
        if self.cooldown.is_zero() {
            return None;
        }
        inner.failed.insert(target.to_owned(), now);
        Some(now + self.cooldown)
    }

    /// Marks a processed target as settled, recording the digest observed at
    /// the target.
    pub fn complete(&self, target: &str, digest: Option<String>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.pushed.get_mut(target) {
            entry.digest = digest;
            entry.last_push = Some(Utc::now());
            entry.inflight = false;
        }
    }

    /// Clears all cooldown entries. Returns how many were cleared and
    /// whether the cooldown is enabled at all.
    pub fn reset_cooldown(&self) -> (usize, bool) {
        if self.cooldown.is_zero() {
            return (0, false);
        }
        let mut inner = self.lock();
        let cleared = inner.failed.len();
        inner.failed.clear();
        (cleared, true)
    }

    /// Sorted snapshot of the push cache.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let inner = self.lock();
        let mut entries: Vec<CacheEntry> = inner
            .pushed
            .iter()
            .map(|(target, entry)| CacheEntry {
                target: target.clone(),
                digest: entry.digest.clone(),
                last_push: entry.last_push,
                inflight: entry.inflight,
            })
            .collect();
        entries.sort_by(|a, b| a.target.cmp(&b.target));
        entries
    }

    /// Removes a single cache entry by exact target.
    pub fn evict(&self, target: &str) -> bool {
        self.lock().pushed.remove(target).is_some()
    }

    /// Removes all cache entries whose target starts with the prefix.
    pub fn evict_prefix(&self, prefix: &str) -> Vec<String> {
        let mut inner = self.lock();
        let mut removed: Vec<String> = inner
            .pushed
            .keys()
            .filter(|target| target.starts_with(prefix))
            .cloned()
            .collect();
        for target in &removed {
            inner.pushed.remove(target);
        }
        removed.sort();
        removed
    }

    /// Drops the whole push cache, returning the removed targets.
    pub fn reset_cache(&self) -> Vec<String> {
        let mut inner = self.lock();
        let mut removed: Vec<String> = inner.pushed.keys().cloned().collect();
        inner.pushed.clear();
        removed.sort();
        removed
    }

    #[cfg(test)]
    pub(crate) fn is_pushed(&self, target: &str) -> bool {
        self.lock().pushed.contains_key(target)
    }

    #[cfg(test)]
    pub(crate) fn is_cooling(&self, target: &str) -> bool {
        self.lock().failed.contains_key(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(600);

    #[test]
    fn begin_admits_then_skips() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        assert_eq!(state.begin("t1", now), Admission::Begin);
        assert_eq!(state.begin("t1", now), Admission::AlreadyProcessed);
    }

    #[test]
    fn cooldown_is_observed_and_elapses() {
        let state = PushState::new(COOLDOWN);
        let t0 = Instant::now();
        assert_eq!(state.begin("t1", t0), Admission::Begin);
        let retry_at = state.fail("t1", t0).expect("cooldown enabled");
        assert_eq!(retry_at, t0 + COOLDOWN);

        match state.begin("t1", t0 + COOLDOWN / 2) {
            Admission::Cooldown { retry_at: at } => assert_eq!(at, retry_at),
            other => panic!("expected cooldown, got {other:?}"),
        }

        assert_eq!(state.begin("t1", t0 + COOLDOWN + Duration::from_secs(1)), Admission::Begin);
        assert!(!state.is_cooling("t1"));
    }

    #[test]
    fn failure_removes_pushed_entry() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("t1", now);
        state.fail("t1", now);
        assert!(!state.is_pushed("t1"));
        assert!(state.is_cooling("t1"));
    }

    #[test]
    fn disabled_cooldown_never_records_failures() {
        let state = PushState::new(Duration::ZERO);
        let now = Instant::now();
        state.begin("t1", now);
        assert_eq!(state.fail("t1", now), None);
        assert!(!state.is_cooling("t1"));
        let (cleared, enabled) = state.reset_cooldown();
        assert_eq!((cleared, enabled), (0, false));
    }

    #[test]
    fn reassign_migrates_pushed_key() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("old", now);
        assert_eq!(state.reassign("old", "new", now), Admission::Begin);
        assert!(!state.is_pushed("old"));
        assert!(state.is_pushed("new"));
    }

    #[test]
    fn reassign_to_processed_target_drops_old() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("new", now);
        state.begin("old", now);
        assert_eq!(state.reassign("old", "new", now), Admission::AlreadyProcessed);
        assert!(!state.is_pushed("old"));
    }

    #[test]
    fn reassign_into_cooldown_aborts() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("new", now);
        state.fail("new", now);
        state.begin("old", now);
        assert!(matches!(
            state.reassign("old", "new", now + Duration::from_secs(1)),
            Admission::Cooldown { .. }
        ));
        assert!(!state.is_pushed("old"));
    }

    #[test]
    fn reassign_without_prior_entry_inserts_nothing() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        assert_eq!(state.reassign("old", "new", now), Admission::Begin);
        assert!(!state.is_pushed("old"));
        assert!(!state.is_pushed("new"));
    }

    #[test]
    fn reassign_to_same_target_is_a_continue() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("t1", now);
        assert_eq!(state.reassign("t1", "t1", now), Admission::Begin);
        assert!(state.is_pushed("t1"));
    }

    #[test]
    fn pushed_and_failed_are_disjoint() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("t1", now);
        state.fail("t1", now);
        assert!(!state.is_pushed("t1") || !state.is_cooling("t1"));
        assert_eq!(state.begin("t1", now + COOLDOWN * 2), Admission::Begin);
        assert!(state.is_pushed("t1") && !state.is_cooling("t1"));
    }

    #[test]
    fn complete_settles_entry() {
        let state = PushState::new(COOLDOWN);
        state.begin("t1", Instant::now());
        state.complete("t1", Some("sha256:abc".into()));
        let entries = state.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest.as_deref(), Some("sha256:abc"));
        assert!(!entries[0].inflight);
        assert!(entries[0].last_push.is_some());
    }

    #[test]
    fn eviction_by_target_prefix_and_all() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        for target in ["reg/mirror/a:1", "reg/mirror/b:1", "reg/other/c:1"] {
            state.begin(target, now);
        }
        assert!(state.evict("reg/other/c:1"));
        assert!(!state.evict("reg/other/c:1"));
        assert_eq!(state.evict_prefix("reg/mirror/"), vec!["reg/mirror/a:1", "reg/mirror/b:1"]);
        state.begin("reg/mirror/a:1", now);
        assert_eq!(state.reset_cache(), vec!["reg/mirror/a:1"]);
        assert!(state.entries().is_empty());
    }

    #[test]
    fn reset_cooldown_clears_entries() {
        let state = PushState::new(COOLDOWN);
        let now = Instant::now();
        state.begin("t1", now);
        state.fail("t1", now);
        let (cleared, enabled) = state.reset_cooldown();
        assert_eq!((cleared, enabled), (1, true));
        assert_eq!(state.begin("t1", now), Admission::Begin);
    }
}
