use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_WINDOW_ENTRIES: usize = 4096; // Prevent unbounded growth

/// Sliding-window message rate limiter.
///
/// Tracks individual message timestamps and only counts messages within
/// the last minute, so a sender cannot burst at a fixed-window boundary.
/// A limit of zero disables the limiter entirely.
#[derive(Debug)]
pub struct RateLimiter {
    window: VecDeque<Instant>,
    limit: u32,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit_per_minute` messages. Zero means
    /// unlimited.
    #[must_use]
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(64),
            limit: limit_per_minute,
        }
    }

    fn expire_old_entries(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks the limit and records the message in one pass.
    /// Returns `true` if the message is allowed.
    pub fn check_and_record(&mut self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = Instant::now();
        self.expire_old_entries(now);

        if self.window.len() >= self.limit as usize {
            return false;
        }

        self.window.push_back(now);
        if self.window.len() > MAX_WINDOW_ENTRIES {
            self.window.pop_front();
        }
        true
    }

    /// Number of messages counted in the current window.
    #[must_use]
    pub fn current_count(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let mut limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.check_and_record());
        }
        assert!(!limiter.check_and_record());
        assert_eq!(limiter.current_count(), 5);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let mut limiter = RateLimiter::new(0);
        for _ in 0..10_000 {
            assert!(limiter.check_and_record());
        }
        // Unlimited mode records nothing.
        assert_eq!(limiter.current_count(), 0);
    }

    #[test]
    fn old_entries_expire_out_of_the_window() {
        let mut limiter = RateLimiter::new(2);
        limiter.window.push_back(Instant::now() - Duration::from_secs(61));
        limiter.window.push_back(Instant::now());
        assert!(limiter.check_and_record());
        assert_eq!(limiter.current_count(), 2);
    }

    #[test]
    fn sliding_window_prevents_clock_edge_burst() {
        let mut limiter = RateLimiter::new(60);
        let now = Instant::now();
        for i in 0..60 {
            limiter
                .window
                .push_back(now - Duration::from_secs(59) + Duration::from_millis(i * 10));
        }
        // Still 60 messages inside the last minute.
        assert!(!limiter.check_and_record());
    }

    #[test]
    fn rejected_messages_are_not_recorded() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.check_and_record());
        assert!(!limiter.check_and_record());
        assert!(!limiter.check_and_record());
        assert_eq!(limiter.current_count(), 1);
    }
}
