use keyring::Entry;
use std::env;
use tracing::trace;

use super::session::Secret;

/// Keyring service under which per-host credentials are stored.
pub const KEYRING_SERVICE: &str = "atp";

/// `shop.example:8443` -> `SHOP_EXAMPLE_8443`
pub fn env_prefix(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn lookup(host: &str, keyring_user: &str, env_suffix: &str) -> Option<Secret> {
    // 1. OS keyring
    if let Ok(entry) = Entry::new(KEYRING_SERVICE, keyring_user) {
        if let Ok(secret) = entry.get_password() {
            trace!(host, "credential resolved from keyring");
            return Some(Secret::new(secret));
        }
    }

    // 2. ATP_<HOST>_<SUFFIX>
    let var = format!("ATP_{}_{}", env_prefix(host), env_suffix);
    env::var(&var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            trace!(host, var = %var, "credential resolved from environment");
            Secret::new(v)
        })
}

pub fn lookup_api_key(host: &str) -> Option<Secret> {
    lookup(host, host, "API_KEY")
}

pub fn lookup_bearer_token(host: &str) -> Option<Secret> {
    lookup(host, &format!("{}#bearer", host), "TOKEN")
}
