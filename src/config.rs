//! Runtime configuration
//!
//! Defaults are production-friendly; every knob can be overridden through `ATP_*` environment
//! variables via [`RuntimeConfig::from_env`] or set directly with the `with_*` builders.

use std::env;
use std::time::Duration;

/// Protocol version sent in the `X-ATP-Version` header.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Path of the manifest relative to a host's origin.
pub const WELL_KNOWN_PATH: &str = "/.well-known/agent.json";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub http_timeout: Duration,
    pub proxy_url: Option<String>,
    pub pool_max_idle_per_host: usize,
    /// Agent identification string (User-Agent).
    pub user_agent: String,
    /// Verifiable agent identity (`did:web:...`), sent when a host asks for it.
    pub agent_identity: Option<String>,
    pub discovery_max_attempts: u32,
    /// Freshness used when a host declares none.
    pub manifest_ttl: Duration,
    pub manifest_cache_capacity: usize,
    pub max_retries: u32,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
    /// Treat a response schema mismatch as an error instead of a diagnostic.
    pub strict_response_schema: bool,
    /// Concurrency bound for `invoke_batch`.
    pub batch_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            proxy_url: None,
            pool_max_idle_per_host: 32,
            user_agent: format!("atp-runtime/{}", env!("CARGO_PKG_VERSION")),
            agent_identity: None,
            discovery_max_attempts: 3,
            manifest_ttl: Duration::from_secs(300),
            manifest_cache_capacity: 64,
            max_retries: 2,
            retry_min_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5_000),
            strict_response_schema: false,
            batch_concurrency: 4,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `ATP_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("ATP_HTTP_TIMEOUT_SECS") {
            cfg.http_timeout = Duration::from_secs(secs);
        }
        if let Ok(proxy) = env::var("ATP_PROXY_URL") {
            if !proxy.trim().is_empty() {
                cfg.proxy_url = Some(proxy);
            }
        }
        if let Ok(name) = env::var("ATP_AGENT_NAME") {
            if !name.trim().is_empty() {
                cfg.user_agent = name;
            }
        }
        if let Ok(identity) = env::var("ATP_AGENT_IDENTITY") {
            if !identity.trim().is_empty() {
                cfg.agent_identity = Some(identity);
            }
        }
        if let Some(n) = env_parse::<u32>("ATP_DISCOVERY_MAX_ATTEMPTS") {
            cfg.discovery_max_attempts = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("ATP_MANIFEST_TTL_SECS") {
            cfg.manifest_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("ATP_MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("ATP_RETRY_MIN_DELAY_MS") {
            cfg.retry_min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ATP_RETRY_MAX_DELAY_MS") {
            cfg.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(strict) = env_flag("ATP_STRICT_RESPONSE_SCHEMA") {
            cfg.strict_response_schema = strict;
        }
        cfg
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_agent_identity(mut self, identity: impl Into<String>) -> Self {
        self.agent_identity = Some(identity.into());
        self
    }

    pub fn with_discovery_max_attempts(mut self, attempts: u32) -> Self {
        self.discovery_max_attempts = attempts.max(1);
        self
    }

    pub fn with_manifest_ttl(mut self, ttl: Duration) -> Self {
        self.manifest_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delays(mut self, min: Duration, max: Duration) -> Self {
        self.retry_min_delay = min;
        self.retry_max_delay = max.max(min);
        self
    }

    pub fn with_strict_response_schema(mut self, strict: bool) -> Self {
        self.strict_response_schema = strict;
        self
    }

    pub fn with_batch_concurrency(mut self, n: usize) -> Self {
        self.batch_concurrency = n.max(1);
        self
    }
}
