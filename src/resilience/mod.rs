//! # Resilience primitives
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Per-host token bucket + window budget, refined by server feedback |
//! | [`retry`] | Bounded exponential backoff shared by discovery and invocation |
//!
//! ```rust
//! use atp_runtime::resilience::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new();
//! limiter.configure("shop.example", Some(RateLimiterConfig::new(100, Duration::from_secs(60))));
//!
//! match limiter.try_acquire("shop.example") {
//!     Ok(permit) => permit.commit(),
//!     Err(denied) => println!("retry in {:?}", denied.retry_after),
//! }
//! # }
//! ```

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{
    RateLimitedError, RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RatePermit,
};
pub use retry::{Decision, RetryPolicy};
