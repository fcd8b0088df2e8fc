//! Fixed-window admission counters.
//!
//! Each key (e.g. `global` or `request:<id>`) gets a counter that resets
//! when its window elapses. Time is passed in by the caller so the limiter
//! follows whatever clock the owning queue uses.
//!
//! # Example
//!
//! ```ignore
//! use relayq_extras::rate_limit::FixedWindowLimiter;
//! use std::time::Duration;
//!
//! let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
//! let admission = limiter.acquire("global", 60, chrono::Utc::now());
//! if !admission.allowed {
//!     println!("retry in {}s", admission.retry_after_secs());
//! }
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Hits counted in the current window (including this one when acquired)
    pub count: u32,
    pub remaining: u32,
    /// Time until the current window resets
    pub retry_after: Duration,
}

impl Admission {
    /// `retry_after` rounded up to whole seconds, never below 1.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Per-key fixed-window counter store.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    entries: DashMap<String, WindowEntry>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Report whether one more hit would be admitted, without counting it.
    pub fn check(&self, key: &str, limit: u32, now: DateTime<Utc>) -> Admission {
        match self.entries.get(key) {
            Some(entry) if !self.expired(&entry, now) => {
                self.admission(entry.count < limit, entry.count, limit, entry.window_start, now)
            }
            _ => self.admission(limit > 0, 0, limit, now, now),
        }
    }

    /// Count a hit if the limit allows it.
    ///
    /// The read and the increment happen under the entry lock, so concurrent
    /// callers never both take the last slot.
    pub fn acquire(&self, key: &str, limit: u32, now: DateTime<Utc>) -> Admission {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: now,
            });

        if self.expired(&entry, now) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count < limit {
            entry.count += 1;
            self.admission(true, entry.count, limit, entry.window_start, now)
        } else {
            self.admission(false, entry.count, limit, entry.window_start, now)
        }
    }

    /// Drop counters whose window has elapsed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.expired(entry, now));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn expired(&self, entry: &WindowEntry, now: DateTime<Utc>) -> bool {
        elapsed(entry.window_start, now) >= self.window
    }

    fn admission(
        &self,
        allowed: bool,
        count: u32,
        limit: u32,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Admission {
        Admission {
            allowed,
            count,
            remaining: limit.saturating_sub(count),
            retry_after: self.window.saturating_sub(elapsed(window_start, now)),
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        assert!(limiter.acquire("global", 2, at(0)).allowed);
        assert!(limiter.acquire("global", 2, at(10)).allowed);

        let rejected = limiter.acquire("global", 2, at(20_000));
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Duration::from_secs(40));
        assert_eq!(rejected.retry_after_secs(), 40);
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        limiter.acquire("k", 1, at(0));
        assert!(!limiter.acquire("k", 1, at(59_999)).allowed);
        assert!(limiter.acquire("k", 1, at(60_000)).allowed);
    }

    #[test]
    fn check_does_not_count() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("k", 1, at(0)).allowed);
        }
        assert!(limiter.acquire("k", 1, at(0)).allowed);
        assert!(!limiter.check("k", 1, at(1)).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        assert!(limiter.acquire("request:a", 1, at(0)).allowed);
        assert!(limiter.acquire("request:b", 1, at(0)).allowed);
        assert!(!limiter.acquire("request:a", 1, at(0)).allowed);
    }

    #[test]
    fn purge_removes_only_stale_windows() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
        limiter.acquire("old", 5, at(0));
        limiter.acquire("new", 5, at(30_000));
        assert_eq!(limiter.purge_expired(at(61_000)), 1);
        assert!(!limiter.check("new", 1, at(61_000)).allowed);
    }

    #[test]
    fn sub_second_wait_rounds_up() {
        let admission = Admission {
            allowed: false,
            count: 1,
            remaining: 0,
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(admission.retry_after_secs(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_admits_more_than_limit(limit in 0u32..20, hits in 0usize..60) {
            let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
            let admitted = (0..hits)
                .filter(|i| limiter.acquire("k", limit, at(*i as i64)).allowed)
                .count();
            prop_assert_eq!(admitted, hits.min(limit as usize));
        }
    }
}
