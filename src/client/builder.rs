use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;
use url::Url;

use super::core::{AgentClient, LoadedManifest};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::AuthManager;
use crate::config::RuntimeConfig;
use crate::protocol::discovery::origin_for;
use crate::protocol::{Manifest, ManifestFetcher, ManifestValidator};
use crate::resilience::{RateLimiter, RetryPolicy};
use crate::transport::{HttpTransport, Transport};
use crate::Result;

/// Builder for [`AgentClient`].
///
/// Anything not set explicitly comes from [`RuntimeConfig::from_env`].
pub struct AgentClientBuilder {
    host: String,
    config: Option<RuntimeConfig>,
    transport: Option<Arc<dyn Transport>>,
    limiter: Option<Arc<RateLimiter>>,
    audit: Arc<dyn AuditSink>,
    retry: Option<RetryPolicy>,
    strict_response_schema: Option<bool>,
    fetcher: Option<Arc<ManifestFetcher>>,
}

impl AgentClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            config: None,
            transport: None,
            limiter: None,
            audit: Arc::new(TracingAuditSink),
            retry: None,
            strict_response_schema: None,
            fetcher: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the HTTP transport (test doubles, custom clients).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a limiter between clients so per-host budgets are accounted once.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Inject an audit sink. Default is [`TracingAuditSink`]; pass
    /// [`NoopAuditSink`](crate::audit::NoopAuditSink) to discard records.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Treat response schema mismatches as errors instead of diagnostics.
    pub fn strict_response_schema(mut self, strict: bool) -> Self {
        self.strict_response_schema = Some(strict);
        self
    }

    /// Share a manifest fetcher (and its cache) between clients.
    pub fn fetcher(mut self, fetcher: Arc<ManifestFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn resolve(&mut self) -> Result<(RuntimeConfig, Arc<dyn Transport>)> {
        let config = self.config.take().unwrap_or_else(RuntimeConfig::from_env);
        let transport: Arc<dyn Transport> = match self.transport.take() {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        Ok((config, transport))
    }

    /// Discover the host's manifest, then build.
    pub async fn discover(mut self) -> Result<AgentClient> {
        let (config, transport) = self.resolve()?;
        let fetcher = match self.fetcher.take() {
            Some(f) => f,
            None => Arc::new(ManifestFetcher::new(transport.clone(), &config)),
        };
        let discovered = fetcher.discover(&self.host).await?;
        let base_url = discovered.source_url.clone();
        self.assemble(config, transport, discovered.manifest, base_url, Some(fetcher))
    }

    /// Build from a manifest value already in hand (validated here).
    pub fn from_manifest(mut self, manifest: Manifest) -> Result<AgentClient> {
        ManifestValidator::new().validate_manifest(&manifest)?;
        let (config, transport) = self.resolve()?;
        let (origin, _) = origin_for(&self.host)?;
        let fetcher = self.fetcher.take();
        self.assemble(config, transport, Arc::new(manifest), origin, fetcher)
    }

    fn assemble(
        self,
        config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        manifest: Arc<Manifest>,
        base_url: Url,
        fetcher: Option<Arc<ManifestFetcher>>,
    ) -> Result<AgentClient> {
        let (_, host) = origin_for(&self.host)?;

        let limiter = self.limiter.unwrap_or_default();
        limiter.configure_from_manifest(&host, &manifest);

        let auth = AuthManager::new(host.clone(), manifest.auth.clone(), transport.clone())
            .with_agent_identity(config.agent_identity.clone());
        let retry = self.retry.unwrap_or_else(|| RetryPolicy::from_config(&config));
        let strict_response_schema = self
            .strict_response_schema
            .unwrap_or(config.strict_response_schema);

        info!(
            host = %host,
            manifest = %manifest.name,
            version = %manifest.version,
            capabilities = manifest.capabilities.len(),
            "agent client ready"
        );

        Ok(AgentClient {
            host,
            base_url,
            loaded: ArcSwap::from_pointee(LoadedManifest::new(manifest)),
            transport,
            auth: ArcSwap::from_pointee(auth),
            limiter,
            audit: self.audit,
            fetcher,
            config,
            retry,
            strict_response_schema,
        })
    }
}
