//! Manifest discovery
//!
//! `discover(host)` fetches `https://{host}/.well-known/agent.json`, validates it and caches
//! the result per host using the HTTP freshness the host declares. Conditional requests
//! (`If-None-Match` / `If-Modified-Since`) turn a `304` into a cache hit.

use lru::LruCache;
use reqwest::header::HeaderMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::error::DiscoveryError;
use super::manifest::Manifest;
use super::validator::ManifestValidator;
use crate::config::{RuntimeConfig, PROTOCOL_VERSION, WELL_KNOWN_PATH};
use crate::resilience::rate_limiter::{header_first, retry_after};
use crate::resilience::{Decision, RetryPolicy};
use crate::transport::{PreparedRequest, Transport, TransportResponse};
use crate::utils::time::{deadline, MAX_LIFETIME};

/// Relation name of the forward pointer in a `Link` header.
pub const MANIFEST_LINK_REL: &str = "agent-manifest";
/// Header carrying a forward pointer to the manifest.
pub const MANIFEST_POINTER_HEADER: &str = "x-agent-manifest";

/// A validated manifest and where it came from.
#[derive(Debug, Clone)]
pub struct DiscoveredManifest {
    pub manifest: Arc<Manifest>,
    /// URL the document was served from; relative endpoints resolve against it.
    pub source_url: Url,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    manifest: Arc<Manifest>,
    source_url: Url,
    etag: Option<String>,
    last_modified: Option<String>,
    fresh_until: Instant,
}

enum Freshness {
    NoStore,
    For(Duration),
}

pub struct ManifestFetcher {
    transport: Arc<dyn Transport>,
    validator: ManifestValidator,
    cache: Mutex<LruCache<String, CacheEntry>>,
    retry: RetryPolicy,
    default_ttl: Duration,
}

impl ManifestFetcher {
    pub fn new(transport: Arc<dyn Transport>, config: &RuntimeConfig) -> Self {
        let capacity = NonZeroUsize::new(config.manifest_cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            transport,
            validator: ManifestValidator::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            retry: RetryPolicy::for_discovery(config),
            default_ttl: config.manifest_ttl,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the cached manifest for `host`; the next `discover` refetches.
    pub fn invalidate(&self, host: &str) {
        if let Ok((_, key)) = origin_for(host) {
            self.cache().pop(&key);
        }
    }

    /// Like [`discover`](Self::discover), abandoning the fetch when `cancel` fires.
    pub async fn discover_with_cancel(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredManifest, DiscoveryError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DiscoveryError::Cancelled { host: host.to_string() }),
            r = self.discover(host) => r,
        }
    }

    pub async fn discover(&self, host: &str) -> Result<DiscoveredManifest, DiscoveryError> {
        let (origin, key) = origin_for(host)?;

        let cached = self.cache().get(&key).cloned();
        if let Some(entry) = &cached {
            if Instant::now() < entry.fresh_until {
                debug!(host = %key, "manifest cache hit");
                return Ok(DiscoveredManifest {
                    manifest: entry.manifest.clone(),
                    source_url: entry.source_url.clone(),
                    from_cache: true,
                });
            }
        }

        let url = match &cached {
            Some(entry) => entry.source_url.clone(),
            None => origin.join(WELL_KNOWN_PATH).map_err(|_| DiscoveryError::InvalidHost {
                host: host.to_string(),
            })?,
        };
        debug!(host = %key, url = %url, revalidate = cached.is_some(), "fetching manifest");

        let mut request = manifest_request(&url);
        if let Some(entry) = &cached {
            if let Some(etag) = &entry.etag {
                request.set_header("If-None-Match", etag.clone());
            }
            if let Some(lm) = &entry.last_modified {
                request.set_header("If-Modified-Since", lm.clone());
            }
        }

        let response = self.fetch_with_retry(request).await?;
        match response.status {
            304 => match cached {
                Some(mut entry) => {
                    debug!(host = %key, "manifest not modified");
                    match freshness(&response.headers, self.default_ttl) {
                        Freshness::NoStore => {
                            self.cache().pop(&key);
                        }
                        Freshness::For(ttl) => {
                            entry.fresh_until = deadline(Instant::now(), ttl, MAX_LIFETIME);
                            self.cache().put(key, entry.clone());
                        }
                    }
                    Ok(DiscoveredManifest {
                        manifest: entry.manifest,
                        source_url: entry.source_url,
                        from_cache: true,
                    })
                }
                None => Err(DiscoveryError::Http {
                    url: url.to_string(),
                    status: 304,
                }),
            },
            200..=299 => self.accept(&key, url, &response),
            404 => {
                if cached.is_some() {
                    self.cache().pop(&key);
                }
                match self.find_pointer(&origin).await {
                    Some(pointer) => {
                        info!(host = %key, pointer = %pointer, "following manifest forward pointer");
                        let response = self.fetch_with_retry(manifest_request(&pointer)).await?;
                        match response.status {
                            200..=299 => self.accept(&key, pointer, &response),
                            404 => Err(DiscoveryError::NotFound { host: key }),
                            status => Err(DiscoveryError::Http {
                                url: pointer.to_string(),
                                status,
                            }),
                        }
                    }
                    None => Err(DiscoveryError::NotFound { host: key }),
                }
            }
            status => Err(DiscoveryError::Http {
                url: url.to_string(),
                status,
            }),
        }
    }

    fn accept(
        &self,
        key: &str,
        url: Url,
        response: &TransportResponse,
    ) -> Result<DiscoveredManifest, DiscoveryError> {
        let body = String::from_utf8_lossy(&response.body);
        let manifest = self
            .validator
            .validate_str(&body)
            .map_err(|errors| {
                warn!(url = %url, problems = errors.len(), "discovered manifest is invalid");
                DiscoveryError::Invalid {
                    url: url.to_string(),
                    errors,
                }
            })?;
        let manifest = Arc::new(manifest);

        match freshness(&response.headers, self.default_ttl) {
            Freshness::NoStore => {
                self.cache().pop(key);
            }
            Freshness::For(ttl) => {
                let entry = CacheEntry {
                    manifest: manifest.clone(),
                    source_url: url.clone(),
                    etag: header_first(&response.headers, &["etag"]),
                    last_modified: header_first(&response.headers, &["last-modified"]),
                    fresh_until: deadline(Instant::now(), ttl, MAX_LIFETIME),
                };
                self.cache().put(key.to_string(), entry);
            }
        }

        info!(host = %key, manifest = %manifest.name, version = %manifest.version, "manifest discovered");
        Ok(DiscoveredManifest {
            manifest,
            source_url: url,
            from_cache: false,
        })
    }

    async fn fetch_with_retry(&self, request: PreparedRequest) -> Result<TransportResponse, DiscoveryError> {
        let url = request.url.clone();
        let mut attempt: u32 = 0;
        loop {
            let (reason, hint) = match self.transport.send(request.clone()).await {
                Ok(resp) if resp.status >= 500 => {
                    (format!("HTTP {}", resp.status), retry_after(&resp.headers))
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() => (e.to_string(), None),
                Err(e) => {
                    return Err(DiscoveryError::Network {
                        url,
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    })
                }
            };

            match self.retry.decide(attempt, true, hint) {
                Decision::Retry { delay } => {
                    debug!(url = %url, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, reason = %reason, "retrying manifest fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Decision::Fail => {
                    return Err(DiscoveryError::Network {
                        url,
                        attempts: attempt + 1,
                        reason,
                    })
                }
            }
        }
    }

    /// Probe the site root for a forward pointer to the manifest.
    async fn find_pointer(&self, origin: &Url) -> Option<Url> {
        let response = self
            .transport
            .send(PreparedRequest::get(origin.as_str()))
            .await
            .ok()?;
        let raw = link_pointer(&response.headers)
            .or_else(|| header_first(&response.headers, &[MANIFEST_POINTER_HEADER]))?;
        let pointer = origin.join(&raw).ok()?;
        if pointer.scheme() != "https" {
            warn!(pointer = %pointer, "ignoring non-https manifest pointer");
            return None;
        }
        Some(pointer)
    }
}

fn manifest_request(url: &Url) -> PreparedRequest {
    PreparedRequest::get(url.as_str())
        .with_header("Accept", "application/json")
        .with_header("X-ATP-Version", PROTOCOL_VERSION)
}

/// Normalize a host (or https origin) into an origin URL and a cache key.
pub(crate) fn origin_for(host: &str) -> Result<(Url, String), DiscoveryError> {
    let host = host.trim();
    let candidate = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    let url = Url::parse(&candidate).map_err(|_| DiscoveryError::InvalidHost {
        host: host.to_string(),
    })?;
    if url.scheme() != "https" {
        return Err(DiscoveryError::InsecureTransport { url: candidate });
    }
    let name = url.host_str().ok_or_else(|| DiscoveryError::InvalidHost {
        host: host.to_string(),
    })?;
    let key = match url.port() {
        Some(port) => format!("{}:{}", name, port),
        None => name.to_string(),
    };
    let origin = Url::parse(&format!("https://{}/", key)).map_err(|_| DiscoveryError::InvalidHost {
        host: host.to_string(),
    })?;
    Ok((origin, key))
}

fn freshness(headers: &HeaderMap, default_ttl: Duration) -> Freshness {
    let Some(cc) = header_first(headers, &["cache-control"]) else {
        return Freshness::For(default_ttl);
    };
    let mut ttl = default_ttl;
    for directive in cc.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        if directive == "no-store" {
            return Freshness::NoStore;
        }
        if directive == "no-cache" {
            ttl = Duration::ZERO;
        } else if let Some(v) = directive.strip_prefix("max-age=") {
            if let Ok(secs) = v.trim_matches('"').parse::<u64>() {
                ttl = Duration::from_secs(secs).min(MAX_LIFETIME);
            }
        }
    }
    Freshness::For(ttl)
}

/// Target of `Link: <url>; rel="agent-manifest"`, if present.
fn link_pointer(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all("link") {
        let Ok(value) = value.to_str() else { continue };
        for link in value.split(',') {
            let mut parts = link.split(';');
            let target = parts.next()?.trim();
            let Some(target) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
                continue;
            };
            let is_manifest = parts.any(|p| {
                let p = p.trim();
                p.strip_prefix("rel=")
                    .map(|r| {
                        r.trim_matches('"')
                            .split_whitespace()
                            .any(|r| r.eq_ignore_ascii_case(MANIFEST_LINK_REL))
                    })
                    .unwrap_or(false)
            });
            if is_manifest {
                return Some(target.to_string());
            }
        }
    }
    None
}
