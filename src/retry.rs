//! Retry policy shared by every worker.
//!
//! All failure handling funnels through the same two ideas: a binary
//! transient/permanent classification, and capped exponential backoff.
//! Keeping the arithmetic here means each worker states only its base
//! interval, cap, and attempt ceiling.

use chrono::Duration;
use rand::Rng;

/// How a failed operation should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff: network I/O, provider 5xx, 429,
    /// SMTP 4xx, store contention.
    Transient,
    /// Retrying cannot help: auth failures, 4xx, decode errors,
    /// constraint violations. Recorded against the owning entity.
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Capped exponential backoff: `min(2^attempts * base, cap)`.
///
/// The first failed attempt (attempts = 1) waits `2 * base`.
pub fn backoff(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.min(30);
    let scaled = base
        .checked_mul(1i32.checked_shl(exp).unwrap_or(i32::MAX))
        .unwrap_or(cap);
    scaled.min(cap)
}

/// Schedule-row backoff after consecutive oracle errors:
/// `min(2^attempts * 30 s, 1 h)`.
pub fn schedule_backoff(attempts: u32) -> Duration {
    backoff(attempts, Duration::seconds(30), Duration::hours(1))
}

/// Analysis-job backoff: `min(2^attempts * 30 s, 30 min)`.
pub fn analysis_backoff(attempts: u32) -> Duration {
    backoff(attempts, Duration::seconds(30), Duration::minutes(30))
}

/// Email-send backoff: `min(2^attempts * 60 s, 6 h)`.
pub fn email_backoff(attempts: u32) -> Duration {
    backoff(attempts, Duration::seconds(60), Duration::hours(6))
}

/// Attempt ceilings before a unit of work is dead-lettered.
pub const ANALYSIS_MAX_ATTEMPTS: u32 = 6;
pub const EMAIL_MAX_ATTEMPTS: u32 = 8;

/// Add uniform jitter in `[0, 0.2 * delta]` to a cadence delta, breaking
/// thundering herds across schedule rows that land on the same instant.
pub fn jittered(delta: Duration) -> Duration {
    let span_ms = delta.num_milliseconds() / 5;
    if span_ms <= 0 {
        return delta;
    }
    let extra = rand::rng().random_range(0..=span_ms);
    delta + Duration::milliseconds(extra)
}

/// A uniform duration in `[min, max]` (used for the quiet-quarter cadence).
pub fn uniform_between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.num_milliseconds(), max.num_milliseconds());
    if hi <= lo {
        return min;
    }
    Duration::milliseconds(rand::rng().random_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_backoff_doubles_then_clamps() {
        // 60, 120, 240, 480, 960 seconds for attempts 1..5, clamped to 1 h.
        assert_eq!(schedule_backoff(1), Duration::seconds(60));
        assert_eq!(schedule_backoff(2), Duration::seconds(120));
        assert_eq!(schedule_backoff(3), Duration::seconds(240));
        assert_eq!(schedule_backoff(4), Duration::seconds(480));
        assert_eq!(schedule_backoff(5), Duration::seconds(960));
        assert_eq!(schedule_backoff(10), Duration::hours(1));
        assert_eq!(schedule_backoff(100), Duration::hours(1));
    }

    #[test]
    fn test_analysis_backoff_caps_at_thirty_minutes() {
        assert_eq!(analysis_backoff(1), Duration::seconds(60));
        assert_eq!(analysis_backoff(6), Duration::minutes(30));
    }

    #[test]
    fn test_email_backoff_caps_at_six_hours() {
        assert_eq!(email_backoff(1), Duration::seconds(120));
        assert_eq!(email_backoff(9), Duration::hours(6));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delta = Duration::minutes(10);
        for _ in 0..100 {
            let jittered = jittered(delta);
            assert!(jittered >= delta);
            assert!(jittered <= delta + Duration::minutes(2));
        }
    }

    #[test]
    fn test_uniform_between_bounds() {
        let lo = Duration::hours(4);
        let hi = Duration::hours(6);
        for _ in 0..100 {
            let picked = uniform_between(lo, hi);
            assert!(picked >= lo && picked <= hi);
        }
    }

    #[test]
    fn test_degenerate_ranges() {
        assert_eq!(jittered(Duration::zero()), Duration::zero());
        assert_eq!(
            uniform_between(Duration::hours(2), Duration::hours(2)),
            Duration::hours(2)
        );
    }
}
