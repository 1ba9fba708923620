//! Clamped conversions for durations that arrive from remote input.

use std::time::Duration;
use tokio::time::Instant;

/// Ceiling for pacing hints: `Retry-After`, rate-limit resets, `retryAfter` in error bodies.
pub const MAX_SERVER_HINT: Duration = Duration::from_secs(86_400);

/// Ceiling for cache lifetimes, token lifetimes and declared rate-limit windows.
pub const MAX_LIFETIME: Duration = Duration::from_secs(365 * 86_400);

/// Seconds as a `Duration`, capped at `ceiling`. Negative and NaN inputs are rejected.
pub fn secs_f64(secs: f64, ceiling: Duration) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(ceiling).min(ceiling))
}

/// `now + after` with `after` capped at `ceiling`.
pub fn deadline(now: Instant, after: Duration, ceiling: Duration) -> Instant {
    now.checked_add(after.min(ceiling)).unwrap_or(now)
}
