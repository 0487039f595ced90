//! Retry classification and backoff schedule
//!
//! Transient transport failures and 429/502/503/504 responses are
//! retried with exponential backoff and symmetric jitter; a 429 with a
//! parseable `Retry-After` waits the server-requested interval instead
//! (capped by the backoff ceiling).

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// HTTP statuses worth a retry.
pub const RETRYABLE_STATUSES: &[u16] = &[429, 502, 503, 504];

#[must_use]
pub fn status_is_retryable(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Computes per-attempt backoff delays.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    config: RetryConfig,
}

impl RetrySchedule {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Backoff before retry number `attempt` (1-based: the delay after
    /// the first failure is `backoff(1)`).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff_ms as f64;
        let exp = base * self.config.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.config.max_backoff_ms as f64);
        Duration::from_millis(self.jittered(capped))
    }

    /// Honor a server-provided Retry-After, still jittered and capped.
    #[must_use]
    pub fn backoff_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => {
                let capped = (hint.as_millis() as f64).min(self.config.max_backoff_ms as f64);
                Duration::from_millis(self.jittered(capped))
            }
            None => self.backoff(attempt),
        }
    }

    fn jittered(&self, millis: f64) -> u64 {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return millis as u64;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        (millis * factor).max(0.0) as u64
    }
}

/// Parse a `Retry-After` header value: either delta-seconds or an
/// HTTP-date.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(jitter: f64) -> RetrySchedule {
        RetrySchedule::new(RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            jitter,
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = schedule(0.0);
        assert_eq!(s.backoff(1), Duration::from_secs(1));
        assert_eq!(s.backoff(2), Duration::from_secs(2));
        assert_eq!(s.backoff(3), Duration::from_secs(4));
        assert_eq!(s.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let s = schedule(0.2);
        for _ in 0..64 {
            let d = s.backoff(2).as_millis() as f64;
            assert!((1600.0..=2400.0).contains(&d), "got {d}");
        }
    }

    #[test]
    fn retry_after_hint_overrides_schedule() {
        let s = schedule(0.0);
        let d = s.backoff_with_hint(1, Some(Duration::from_secs(7)));
        assert_eq!(d, Duration::from_secs(7));
        // Hint beyond the ceiling is capped.
        let d = s.backoff_with_hint(1, Some(Duration::from_secs(600)));
        assert_eq!(d, Duration::from_secs(30));
    }

    #[test]
    fn parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn retryable_statuses_match_policy() {
        assert!(status_is_retryable(429));
        assert!(status_is_retryable(503));
        assert!(!status_is_retryable(404));
        assert!(!status_is_retryable(500));
    }
}
