//! Per-identity temporal deduplication.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Time of the last ledger attempt per identity. Process-local; starts empty.
#[derive(Debug)]
pub struct LastSeen {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl LastSeen {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True if `identity_id` has no entry or its last attempt is strictly
    /// more than the window before `now`.
    pub fn should_attempt(&self, identity_id: &str, now: Instant) -> bool {
        match self.seen.get(identity_id) {
            Some(&last) => now.saturating_duration_since(last) > self.window,
            None => true,
        }
    }

    pub fn record(&mut self, identity_id: &str, now: Instant) {
        self.seen.insert(identity_id.to_string(), now);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for LastSeen {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_identity_attempts() {
        let seen = LastSeen::default();
        assert!(seen.should_attempt("a", Instant::now()));
    }

    #[test]
    fn test_within_window_suppressed() {
        let t0 = Instant::now();
        let mut seen = LastSeen::default();
        seen.record("a", t0);
        assert!(!seen.should_attempt("a", t0 + Duration::from_secs(2)));
        assert!(seen.should_attempt("b", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_exactly_window_still_suppressed() {
        let t0 = Instant::now();
        let mut seen = LastSeen::default();
        seen.record("a", t0);
        assert!(!seen.should_attempt("a", t0 + DEFAULT_DEDUP_WINDOW));
    }

    #[test]
    fn test_after_window_attempts_again() {
        let t0 = Instant::now();
        let mut seen = LastSeen::default();
        seen.record("a", t0);
        assert!(seen.should_attempt("a", t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let t0 = Instant::now();
        let mut seen = LastSeen::default();
        seen.record("a", t0);
        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.should_attempt("a", t0));
    }
}
