//! Per-host request budgets.
//!
//! Each host gets a token bucket (capacity = burst ceiling, refilled at `requests / window`)
//! plus a fixed-window counter for the declared budget. Server feedback (remaining-budget
//! headers, `Retry-After`, 429s) refines both.

use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{Manifest, RateLimitSpec};
use crate::utils::time::{deadline, secs_f64, MAX_LIFETIME, MAX_SERVER_HINT};

/// Fallback block when a host reports zero remaining budget without a reset hint.
pub(crate) const DEFAULT_BLOCK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limited by {host}; retry after {:.3}s", .retry_after.as_secs_f64())]
pub struct RateLimitedError {
    pub host: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub requests: u32,
    pub window: Duration,
    /// Bucket capacity; defaults to `requests`.
    pub burst: u32,
}

impl RateLimiterConfig {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self {
            requests,
            window,
            burst: requests.max(1),
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1);
        self
    }

    pub fn from_spec(spec: &RateLimitSpec) -> Option<Self> {
        let window = spec.window_duration()?.min(MAX_LIFETIME);
        if spec.requests == 0 {
            return None;
        }
        let mut cfg = Self::new(spec.requests, window);
        if let Some(burst) = spec.burst_limit {
            cfg = cfg.with_burst(burst);
        }
        Some(cfg)
    }

    /// Tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.requests as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub host: String,
    pub config: Option<RateLimiterConfig>,
    pub tokens: f64,
    /// Requests admitted in the current window.
    pub window_count: u32,
    /// Last budget reported by the host.
    pub remaining: Option<u64>,
    /// Time until the next request would be admitted, if currently denied.
    pub estimated_wait: Option<Duration>,
}

#[derive(Debug)]
struct HostState {
    cfg: Option<RateLimiterConfig>,
    tokens: f64,
    last: Instant,
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
    remaining: Option<u64>,
}

impl HostState {
    fn new(cfg: Option<RateLimiterConfig>) -> Self {
        let now = Instant::now();
        Self {
            tokens: cfg.as_ref().map(|c| c.burst as f64).unwrap_or(0.0),
            cfg,
            last: now,
            window_start: now,
            count: 0,
            blocked_until: None,
            remaining: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let Some(cfg) = &self.cfg else { return };
        if now >= self.window_start + cfg.window {
            let elapsed = now.saturating_duration_since(self.window_start);
            let windows = (elapsed.as_nanos() / cfg.window.as_nanos().max(1)) as u32;
            self.window_start += cfg.window * windows;
            self.count = 0;
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * cfg.refill_rate()).min(cfg.burst as f64);
            self.last = now;
        }
    }

    /// Wait until admission, or `None` if a request may go now.
    fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        if let Some(until) = self.blocked_until {
            if until > now {
                return Some(until - now);
            }
            self.blocked_until = None;
        }
        self.refill(now);
        let cfg = self.cfg.as_ref()?;
        if self.count >= cfg.requests {
            return Some((self.window_start + cfg.window).saturating_duration_since(now));
        }
        if self.tokens < 1.0 {
            let missing = 1.0 - self.tokens;
            return Some(secs_f64(missing / cfg.refill_rate(), cfg.window).unwrap_or(cfg.window));
        }
        None
    }
}

type Slot = Arc<Mutex<HostState>>;

fn lock(slot: &Slot) -> MutexGuard<'_, HostState> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Admission granted for one request.
///
/// Dropping a permit without [`commit`](RatePermit::commit) returns its token, so a call
/// cancelled before dispatch does not consume budget.
#[derive(Debug)]
pub struct RatePermit {
    slot: Slot,
    window_start: Instant,
    committed: bool,
}

impl RatePermit {
    /// Mark the request as sent; the token is spent.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut st = lock(&self.slot);
        let Some(cap) = st.cfg.as_ref().map(|c| c.burst as f64) else {
            return;
        };
        st.tokens = (st.tokens + 1.0).min(cap);
        if st.window_start == self.window_start {
            st.count = st.count.saturating_sub(1);
        }
        if let Some(rem) = st.remaining.as_mut() {
            *rem += 1;
        }
    }
}

/// Registry of per-host budgets. Hosts without a declared limit are admitted freely until
/// the server pushes back.
#[derive(Debug, Default)]
pub struct RateLimiter {
    hosts: Mutex<HashMap<String, Slot>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, host: &str) -> Slot {
        let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostState::new(None))))
            .clone()
    }

    /// Seed (or re-seed) a host's declared budget. Server-observed state is kept.
    pub fn configure(&self, host: &str, cfg: Option<RateLimiterConfig>) {
        let slot = self.slot(host);
        let mut st = lock(&slot);
        st.tokens = cfg.as_ref().map(|c| c.burst as f64).unwrap_or(0.0);
        st.last = Instant::now();
        st.window_start = st.last;
        st.count = 0;
        st.cfg = cfg;
    }

    pub fn configure_from_manifest(&self, host: &str, manifest: &Manifest) {
        let cfg = manifest.rate_limit.as_ref().and_then(RateLimiterConfig::from_spec);
        debug!(host, declared = cfg.is_some(), "rate limit seeded from manifest");
        self.configure(host, cfg);
    }

    fn grant(slot: &Slot, st: &mut HostState) -> RatePermit {
        if st.cfg.is_some() {
            st.tokens -= 1.0;
            st.count += 1;
        }
        if let Some(rem) = st.remaining.as_mut() {
            *rem = rem.saturating_sub(1);
        }
        RatePermit {
            slot: slot.clone(),
            window_start: st.window_start,
            committed: false,
        }
    }

    /// Admit one request now or report how long to wait.
    pub fn try_acquire(&self, host: &str) -> Result<RatePermit, RateLimitedError> {
        let slot = self.slot(host);
        let mut st = lock(&slot);
        match st.wait_time(Instant::now()) {
            None => Ok(Self::grant(&slot, &mut st)),
            Some(retry_after) => {
                debug!(host, wait_ms = retry_after.as_millis() as u64, "rate limit denied");
                Err(RateLimitedError {
                    host: host.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Admit one request, sleeping until budget is available.
    ///
    /// Dropping the future while it sleeps holds no budget.
    pub async fn acquire(&self, host: &str) -> RatePermit {
        loop {
            match self.try_acquire(host) {
                Ok(permit) => return permit,
                Err(e) => tokio::time::sleep(e.retry_after.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// A 429 restarts the window when `retry_after` elapses, overriding local accounting.
    pub fn on_throttled(&self, host: &str, retry_after: Duration) {
        let slot = self.slot(host);
        let mut st = lock(&slot);
        let retry_after = retry_after.min(MAX_SERVER_HINT);
        let until = deadline(Instant::now(), retry_after, MAX_SERVER_HINT);
        st.blocked_until = Some(until);
        st.window_start = until;
        st.last = until;
        st.count = 0;
        st.tokens = st.cfg.as_ref().map(|c| c.burst as f64).unwrap_or(0.0);
        st.remaining = None;
        warn!(host, retry_after_ms = retry_after.as_millis() as u64, "host throttled");
    }

    /// Record a server-reported budget.
    pub fn update_budget(&self, host: &str, remaining: Option<u64>, reset_after: Option<Duration>) {
        let slot = self.slot(host);
        let mut st = lock(&slot);
        if let Some(rem) = remaining {
            st.remaining = Some(rem);
            if rem == 0 {
                let after = reset_after.unwrap_or(DEFAULT_BLOCK);
                st.blocked_until = Some(deadline(Instant::now(), after, MAX_SERVER_HINT));
            } else {
                st.blocked_until = None;
            }
        }
    }

    /// Refine state from rate-limit response headers.
    pub fn observe_headers(&self, host: &str, headers: &HeaderMap) {
        let remaining = header_first(headers, &["x-ratelimit-remaining", "ratelimit-remaining"])
            .and_then(|v| v.parse::<u64>().ok());
        let reset_after = retry_after(headers).or_else(|| {
            header_first(headers, &["x-ratelimit-reset", "ratelimit-reset"]).and_then(|v| parse_reset(&v))
        });
        if remaining.is_some() {
            self.update_budget(host, remaining, reset_after);
        }
    }

    pub fn snapshot(&self, host: &str) -> RateLimiterSnapshot {
        let slot = self.slot(host);
        let mut st = lock(&slot);
        let estimated_wait = st.wait_time(Instant::now());
        RateLimiterSnapshot {
            host: host.to_string(),
            config: st.cfg.clone(),
            tokens: st.tokens,
            window_count: st.count,
            remaining: st.remaining,
            estimated_wait,
        }
    }
}

pub(crate) fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// `Retry-After: <seconds>`, capped at [`MAX_SERVER_HINT`]; the HTTP-date form is not supported.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_first(headers, &["retry-after"])?;
    secs_f64(raw.parse().ok()?, MAX_SERVER_HINT)
}

/// Reset counters are either delta seconds or a Unix epoch timestamp.
fn parse_reset(raw: &str) -> Option<Duration> {
    let n: u64 = raw.parse().ok()?;
    let secs = if n > 1_000_000_000 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        n.saturating_sub(now)
    } else {
        n
    };
    Some(Duration::from_secs(secs).min(MAX_SERVER_HINT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const HOST: &str = "shop.example";

    fn limiter(requests: u32, window_secs: u64, burst: Option<u32>) -> RateLimiter {
        let rl = RateLimiter::new();
        let mut cfg = RateLimiterConfig::new(requests, Duration::from_secs(window_secs));
        if let Some(b) = burst {
            cfg = cfg.with_burst(b);
        }
        rl.configure(HOST, Some(cfg));
        rl
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_denied() {
        let rl = limiter(3, 60, None);
        for _ in 0..3 {
            rl.try_acquire(HOST).unwrap().commit();
        }
        let err = rl.try_acquire(HOST).unwrap_err();
        assert!(err.retry_after > Duration::ZERO);
        assert!(err.retry_after <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_budget() {
        let rl = limiter(2, 10, None);
        rl.try_acquire(HOST).unwrap().commit();
        rl.try_acquire(HOST).unwrap().commit();
        assert!(rl.try_acquire(HOST).is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(rl.try_acquire(HOST).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_ceiling_limits_back_to_back_requests() {
        let rl = limiter(60, 60, Some(2));
        rl.try_acquire(HOST).unwrap().commit();
        rl.try_acquire(HOST).unwrap().commit();
        let err = rl.try_acquire(HOST).unwrap_err();
        // one token per second
        assert!(err.retry_after <= Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(rl.try_acquire(HOST).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_is_refunded() {
        let rl = limiter(1, 60, None);
        {
            let _permit = rl.try_acquire(HOST).unwrap();
        }
        let snap = rl.snapshot(HOST);
        assert_eq!(snap.window_count, 0);
        assert!(rl.try_acquire(HOST).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_blocks_until_retry_after() {
        let rl = RateLimiter::new();
        assert!(rl.try_acquire(HOST).is_ok());
        rl.on_throttled(HOST, Duration::from_secs(5));

        let err = rl.try_acquire(HOST).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(rl.try_acquire(HOST).is_err());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(rl.try_acquire(HOST).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_out_the_block() {
        let rl = RateLimiter::new();
        rl.on_throttled(HOST, Duration::from_secs(3));
        let start = Instant::now();
        rl.acquire(HOST).await.commit();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_remaining_header_blocks() {
        let rl = RateLimiter::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("2"));
        rl.observe_headers(HOST, &headers);

        let snap = rl.snapshot(HOST);
        assert_eq!(snap.remaining, Some(0));
        assert_eq!(snap.estimated_wait, Some(Duration::from_secs(2)));
        assert!(rl.try_acquire(HOST).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_server_hints_are_capped() {
        let rl = RateLimiter::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("18446744073709551615"));
        rl.observe_headers(HOST, &headers);
        assert_eq!(rl.snapshot(HOST).estimated_wait, Some(MAX_SERVER_HINT));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e300"));
        assert_eq!(retry_after(&headers), Some(MAX_SERVER_HINT));
        headers.insert("retry-after", HeaderValue::from_static("-3"));
        assert_eq!(retry_after(&headers), None);

        rl.on_throttled(HOST, Duration::MAX);
        assert_eq!(rl.try_acquire(HOST).unwrap_err().retry_after, MAX_SERVER_HINT);
    }

    #[test]
    fn reset_accepts_epoch_and_delta() {
        assert_eq!(parse_reset("30"), Some(Duration::from_secs(30)));
        let past_epoch = "1000000001";
        assert_eq!(parse_reset(past_epoch), Some(Duration::ZERO));
        assert_eq!(parse_reset("soon"), None);
    }

    #[test]
    fn config_from_spec() {
        let spec = RateLimitSpec {
            requests: 100,
            window: "1m".into(),
            burst_limit: Some(10),
        };
        let cfg = RateLimiterConfig::from_spec(&spec).unwrap();
        assert_eq!(cfg.burst, 10);
        assert_eq!(cfg.window, Duration::from_secs(60));
        assert!((cfg.refill_rate() - 100.0 / 60.0).abs() < 1e-9);

        let huge = RateLimitSpec {
            requests: 1,
            window: "99999999999d".into(),
            burst_limit: None,
        };
        assert_eq!(RateLimiterConfig::from_spec(&huge).unwrap().window, MAX_LIFETIME);
    }
}
