//! `tracing` subscriber setup for applications embedding the runtime.

use tracing_subscriber::EnvFilter;

/// Filter directives: `ATP_LOG`, then `RUST_LOG`, then `info`.
pub fn env_filter() -> EnvFilter {
    std::env::var("ATP_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install a fmt subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}
