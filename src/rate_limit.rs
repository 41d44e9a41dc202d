// In-memory sliding-window rate limiter for battle invitations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limit exceeded: max {max} invites per {per} for '{target}'")]
pub struct RateLimitError {
    pub target: String,
    pub max: usize,
    /// Human-readable window, e.g. "hour".
    pub per: String,
}

fn describe_window(window: Duration) -> String {
    match window.as_secs() {
        3600 => "hour".to_string(),
        60 => "minute".to_string(),
        s => format!("{s}s"),
    }
}

/// Thread-safe in-memory rate limiter keyed by target username (case-insensitive).
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `max` events per hour.
    pub fn per_hour(max: usize) -> Self {
        Self::new(max, Duration::from_secs(3600))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if `target` is within the limit.
    /// If within limits, records the event and returns Ok(()).
    pub fn check_limit(&self, target: &str) -> Result<(), RateLimitError> {
        let mut map = self.lock();
        let now = Instant::now();
        let window = self.window;
        let entries = map.entry(target.to_ascii_lowercase()).or_default();

        // Remove expired entries
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= self.max {
            return Err(RateLimitError {
                target: target.to_string(),
                max: self.max,
                per: describe_window(window),
            });
        }

        entries.push(now);
        Ok(())
    }

    /// Give back the oldest recorded event, e.g. when an invite never went out.
    pub fn release(&self, target: &str) {
        let mut map = self.lock();
        if let Some(entries) = map.get_mut(&target.to_ascii_lowercase()) {
            if !entries.is_empty() {
                entries.remove(0);
            }
        }
    }

    /// Current count for `target` (for testing/diagnostics).
    pub fn current_count(&self, target: &str) -> usize {
        let mut map = self.lock();
        let now = Instant::now();
        let window = self.window;
        match map.get_mut(&target.to_ascii_lowercase()) {
            Some(entries) => {
                entries.retain(|t| now.duration_since(*t) < window);
                entries.len()
            }
            None => 0,
        }
    }

    /// Number of targets with at least one event still recorded.
    pub fn tracked_targets(&self) -> usize {
        self.lock().len()
    }

    /// Drop keys whose events have all expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.window;
        self.lock().retain(|_, entries| {
            entries.retain(|t| now.duration_since(*t) < window);
            !entries.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_hour(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_within_limit() {
        let limiter = RateLimiter::per_hour(10);
        for _ in 0..10 {
            assert!(limiter.check_limit("ash").is_ok());
        }
    }

    #[test]
    fn test_rate_limiter_denies_over_limit() {
        let limiter = RateLimiter::per_hour(3);
        for _ in 0..3 {
            assert!(limiter.check_limit("ash").is_ok());
        }
        let err = limiter.check_limit("ash").unwrap_err();
        assert_eq!(err.max, 3);
        assert_eq!(err.target, "ash");
    }

    #[test]
    fn test_rate_limiter_separate_targets() {
        let limiter = RateLimiter::per_hour(3);
        for _ in 0..3 {
            assert!(limiter.check_limit("ash").is_ok());
        }
        assert!(limiter.check_limit("ash").is_err());

        // Another user should still be fine
        assert!(limiter.check_limit("misty").is_ok());
    }

    #[test]
    fn test_rate_limiter_is_case_insensitive() {
        let limiter = RateLimiter::per_hour(1);
        assert!(limiter.check_limit("Ash").is_ok());
        assert!(limiter.check_limit("ASH").is_err());
    }

    #[test]
    fn test_rate_limiter_release() {
        let limiter = RateLimiter::per_hour(3);
        for _ in 0..3 {
            assert!(limiter.check_limit("ash").is_ok());
        }
        assert!(limiter.check_limit("ash").is_err());

        limiter.release("ash");

        assert!(limiter.check_limit("ash").is_ok());
        assert!(limiter.check_limit("ash").is_err());
    }

    #[test]
    fn test_rate_limiter_current_count() {
        let limiter = RateLimiter::per_hour(10);
        assert_eq!(limiter.current_count("ash"), 0);

        limiter.check_limit("ash").unwrap();
        assert_eq!(limiter.current_count("ash"), 1);

        limiter.check_limit("ash").unwrap();
        assert_eq!(limiter.current_count("ash"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window_expires() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_limit("ash").is_ok());
        assert!(limiter.check_limit("ash").is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_limit("ash").is_ok());
        limiter.prune();
        assert_eq!(limiter.current_count("ash"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_forgets_expired_targets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.check_limit("ash").unwrap();
        limiter.check_limit("misty").unwrap();
        assert_eq!(limiter.tracked_targets(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.check_limit("brock").unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        limiter.prune();
        assert_eq!(limiter.tracked_targets(), 1);
        assert_eq!(limiter.current_count("brock"), 1);
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimiter::per_hour(10);
        for _ in 0..10 {
            err.check_limit("ash").unwrap();
        }
        assert_eq!(
            err.check_limit("ash").unwrap_err().to_string(),
            "Rate limit exceeded: max 10 invites per hour for 'ash'"
        );
    }
}
