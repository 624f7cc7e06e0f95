//! Domain-level rate limiting.
//!
//! Two shapes cover the gateway's needs: a sliding-window limiter for
//! registration attempts per source IP, and a minimum-spacing limiter for
//! heartbeats per session.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sliding window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sliding-window limiter keyed by an arbitrary string (source IP here).
/// Both windows must have room for the attempt to pass; every attempt,
/// allowed or not, is recorded.
pub struct SlidingWindowLimiter {
    per_minute: u32,
    per_hour: u32,
    hits: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_minute,
            per_hour,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key` and report whether it is allowed.
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut hits = self.hits.lock();
        let window = hits.entry(key.to_owned()).or_default();

        let hour_ago = now - Duration::hours(1);
        while window.front().is_some_and(|t| *t < hour_ago) {
            window.pop_front();
        }

        let minute_ago = now - Duration::minutes(1);
        let last_minute = window.iter().filter(|t| **t >= minute_ago).count();
        let last_hour = window.len();

        let allowed =
            last_minute < self.per_minute as usize && last_hour < self.per_hour as usize;
        window.push_back(now);
        allowed
    }

    /// Drop keys with no hits in the last hour. Called from a maintenance
    /// tick so the map does not grow with every IP ever seen.
    pub fn prune(&self, now: DateTime<Utc>) {
        let hour_ago = now - Duration::hours(1);
        let mut hits = self.hits.lock();
        hits.retain(|_, window| {
            while window.front().is_some_and(|t| *t < hour_ago) {
                window.pop_front();
            }
            !window.is_empty()
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Minimum spacing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforces a minimum interval between events per session. A zero interval
/// disables the limiter.
pub struct MinIntervalLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl MinIntervalLimiter {
    pub fn new(min_interval_seconds: u64) -> Self {
        Self {
            min_interval: Duration::seconds(min_interval_seconds as i64),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an event for `session_id` is allowed now. Allowed events
    /// update the recorded timestamp; rejected ones do not (a client
    /// hammering heartbeats does not push its own window forward).
    pub fn check(&self, session_id: Uuid, now: DateTime<Utc>) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }
        let mut last = self.last.lock();
        match last.get(&session_id) {
            Some(prev) if now.signed_duration_since(*prev) < self.min_interval => false,
            _ => {
                last.insert(session_id, now);
                true
            }
        }
    }

    /// Forget a session (called when it expires).
    pub fn forget(&self, session_id: Uuid) {
        self.last.lock().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_window_enforced() {
        let limiter = SlidingWindowLimiter::new(3, 100);
        let now = Utc::now();
        assert!(limiter.check("ip", now));
        assert!(limiter.check("ip", now));
        assert!(limiter.check("ip", now));
        assert!(!limiter.check("ip", now));
        // A minute later the window has slid.
        assert!(limiter.check("ip", now + Duration::seconds(61)));
    }

    #[test]
    fn hour_window_enforced_independently() {
        let limiter = SlidingWindowLimiter::new(100, 5);
        let now = Utc::now();
        // Spread attempts so the minute window never trips.
        for i in 0..5 {
            assert!(limiter.check("ip", now + Duration::minutes(i * 2)));
        }
        assert!(!limiter.check("ip", now + Duration::minutes(12)));
        // After the first hits age out, room again.
        assert!(limiter.check("ip", now + Duration::minutes(70)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, 10);
        let now = Utc::now();
        assert!(limiter.check("a", now));
        assert!(!limiter.check("a", now));
        assert!(limiter.check("b", now));
    }

    #[test]
    fn prune_drops_stale_keys() {
        let limiter = SlidingWindowLimiter::new(10, 10);
        let now = Utc::now();
        limiter.check("old", now - Duration::hours(2));
        limiter.check("fresh", now);
        limiter.prune(now);
        let hits = limiter.hits.lock();
        assert!(!hits.contains_key("old"));
        assert!(hits.contains_key("fresh"));
    }

    #[test]
    fn heartbeat_spacing() {
        let limiter = MinIntervalLimiter::new(5);
        let session = Uuid::new_v4();
        let now = Utc::now();
        assert!(limiter.check(session, now));
        assert!(!limiter.check(session, now + Duration::seconds(3)));
        // Rejected attempts do not push the window forward.
        assert!(limiter.check(session, now + Duration::seconds(6)));
    }

    #[test]
    fn zero_interval_disables() {
        let limiter = MinIntervalLimiter::new(0);
        let session = Uuid::new_v4();
        let now = Utc::now();
        assert!(limiter.check(session, now));
        assert!(limiter.check(session, now));
    }
}
