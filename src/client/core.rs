use arc_swap::ArcSwap;
use futures::StreamExt;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::confirmation::{self, Acknowledgment};
use super::error::{ErrorBody, InvocationError, ScopeError};
use super::request;
use super::validation;
use crate::audit::{AuditSink, InvocationRecord, Outcome};
use crate::auth::{AuthError, AuthManager, CredentialInput, Negotiation, Session};
use crate::config::RuntimeConfig;
use crate::protocol::{schema, Capability, Manifest, ManifestFetcher, ManifestValidator};
use crate::resilience::rate_limiter::{retry_after, DEFAULT_BLOCK};
use crate::resilience::{Decision, RateLimitedError, RateLimiter, RatePermit, RetryPolicy};
use crate::transport::{PreparedRequest, Transport, TransportError, TransportResponse};
use crate::workflow::{ConfirmationProvider, WorkflowExecutor, WorkflowRun};
use crate::{Error, Result};

/// A validated manifest plus the response schemas compiled from it.
pub(crate) struct LoadedManifest {
    pub(crate) manifest: Arc<Manifest>,
    response_schemas: HashMap<String, JSONSchema>,
}

impl LoadedManifest {
    pub(crate) fn new(manifest: Arc<Manifest>) -> Self {
        let mut response_schemas = HashMap::new();
        for cap in &manifest.capabilities {
            let Some(rs) = &cap.response_schema else {
                continue;
            };
            match schema::compile_response_schema(rs, &manifest.schemas) {
                Ok(compiled) => {
                    response_schemas.insert(cap.id.clone(), compiled);
                }
                Err(e) => warn!(capability = %cap.id, error = %e, "response schema does not compile; responses go unchecked"),
            }
        }
        Self {
            manifest,
            response_schemas,
        }
    }
}

/// What to do when the host's rate budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Sleep until the budget refills.
    #[default]
    Wait,
    /// Fail immediately with [`RateLimitedError`].
    FailFast,
}

/// Per-call options. Not `Clone`: the acknowledgment belongs to one call.
#[derive(Debug, Default)]
pub struct InvokeOptions {
    pub acknowledgment: Option<Acknowledgment>,
    pub admission: AdmissionPolicy,
    /// Deadline for the whole call, retries included.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledge(mut self, ack: Acknowledgment) -> Self {
        self.acknowledgment = Some(ack);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.admission = AdmissionPolicy::FailFast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub capability_id: String,
    pub status: u16,
    /// Parsed JSON body; `Null` for an empty body, a string for non-JSON text.
    pub body: Value,
    /// Non-fatal findings: deprecation, response schema mismatches.
    pub diagnostics: Vec<String>,
    pub attempts: u32,
    pub request_id: String,
    pub duration_ms: u64,
}

/// One entry of [`AgentClient::invoke_batch`].
#[derive(Debug)]
pub struct BatchCall {
    pub capability_id: String,
    pub arguments: Value,
    pub options: InvokeOptions,
}

impl BatchCall {
    pub fn new(capability_id: impl Into<String>, arguments: Value) -> Self {
        Self {
            capability_id: capability_id.into(),
            arguments,
            options: InvokeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Default)]
struct CallTrace {
    attempts: u32,
    http_status: Option<u16>,
}

/// Emits exactly one audit record per call, including calls whose future is dropped.
struct AuditGuard {
    sink: Arc<dyn AuditSink>,
    request_id: String,
    host: String,
    capability_id: String,
    agent_identity: Option<String>,
    started: Instant,
    trace: CallTrace,
    done: bool,
}

impl AuditGuard {
    fn record(&self, outcome: Outcome, error: Option<String>) -> InvocationRecord {
        let mut record = InvocationRecord::new(&self.request_id, &self.host, &self.capability_id, outcome)
            .with_agent_identity(self.agent_identity.clone())
            .with_http_status(self.trace.http_status)
            .with_attempts(self.trace.attempts)
            .with_duration_ms(self.started.elapsed().as_millis() as u64);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        record
    }

    async fn finish(mut self, result: &Result<InvocationResult>) {
        self.done = true;
        let record = match result {
            Ok(_) => self.record(Outcome::Success, None),
            Err(e) => self.record(Outcome::from_error(e), Some(e.to_string())),
        };
        if let Err(e) = self.sink.record(record).await {
            warn!(request_id = %self.request_id, error = %e, "audit sink rejected record");
        }
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let record = self.record(Outcome::Cancelled, Some("invocation dropped".to_string()));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sink = self.sink.clone();
            handle.spawn(async move {
                if let Err(e) = sink.record(record).await {
                    warn!(error = %e, "audit sink rejected record");
                }
            });
        }
    }
}

/// Invocation context for one host.
///
/// Bundles the validated manifest with the host's long-lived state: the [`AuthManager`], the
/// shared [`RateLimiter`] and the audit sink. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct AgentClient {
    pub(crate) host: String,
    pub(crate) base_url: Url,
    pub(crate) loaded: ArcSwap<LoadedManifest>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) auth: ArcSwap<AuthManager>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) fetcher: Option<Arc<ManifestFetcher>>,
    pub(crate) config: RuntimeConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) strict_response_schema: bool,
}

impl AgentClient {
    /// Discover `host`'s manifest and build a client with defaults from the environment.
    pub async fn discover(host: &str) -> Result<Self> {
        super::builder::AgentClientBuilder::new(host).discover().await
    }

    pub fn builder(host: impl Into<String>) -> super::builder::AgentClientBuilder {
        super::builder::AgentClientBuilder::new(host)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Current manifest snapshot.
    pub fn manifest(&self) -> Arc<Manifest> {
        self.loaded.load().manifest.clone()
    }

    pub fn auth(&self) -> Arc<AuthManager> {
        self.auth.load_full()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Negotiate a session with the scheme `input` targets.
    pub async fn authenticate(&self, input: CredentialInput) -> Result<Negotiation> {
        let kind = input.kind();
        Ok(self.auth().acquire_session(kind, input).await?)
    }

    /// Swap in a new manifest. It is validated first; on failure the old one stays.
    pub fn reload_manifest(&self, manifest: Manifest) -> Result<()> {
        ManifestValidator::new().validate_manifest(&manifest)?;
        if manifest.auth != self.manifest().auth {
            warn!(host = %self.host, "auth schemes changed; existing sessions are dropped");
            let auth = AuthManager::new(self.host.clone(), manifest.auth.clone(), self.transport.clone())
                .with_agent_identity(self.config.agent_identity.clone());
            self.auth.store(Arc::new(auth));
        }
        self.limiter.configure_from_manifest(&self.host, &manifest);
        info!(host = %self.host, version = %manifest.version, "manifest reloaded");
        self.loaded.store(Arc::new(LoadedManifest::new(Arc::new(manifest))));
        Ok(())
    }

    /// Re-run discovery (bypassing the cache) and reload the result.
    pub async fn rediscover(&self) -> Result<()> {
        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            Error::configuration_with_context(
                "client was built from a manifest value; there is nothing to rediscover",
                crate::ErrorContext::new().with_source("agent_client"),
            )
        })?;
        fetcher.invalidate(&self.host);
        let discovered = fetcher.discover(&self.host).await?;
        self.reload_manifest(discovered.manifest.as_ref().clone())
    }

    /// Invoke one capability.
    ///
    /// Gates run in order and each aborts before the next: argument validation, scope check,
    /// confirmation, rate admission, then dispatch with retries. The first three never touch
    /// the network. Exactly one audit record is written per call.
    pub async fn invoke(
        &self,
        capability_id: &str,
        arguments: Value,
        session: &Session,
        options: InvokeOptions,
    ) -> Result<InvocationResult> {
        let request_id = Uuid::new_v4().to_string();
        let mut audit = AuditGuard {
            sink: self.audit.clone(),
            request_id: request_id.clone(),
            host: self.host.clone(),
            capability_id: capability_id.to_string(),
            agent_identity: session
                .agent_identity()
                .map(str::to_string)
                .or_else(|| self.config.agent_identity.clone()),
            started: Instant::now(),
            trace: CallTrace::default(),
            done: false,
        };

        let result = self
            .run(capability_id, &arguments, session, options, &request_id, &mut audit.trace)
            .await;

        match &result {
            Ok(r) => info!(
                capability = capability_id,
                status = r.status,
                attempts = r.attempts,
                duration_ms = r.duration_ms,
                "capability invoked"
            ),
            Err(e) => warn!(
                capability = capability_id,
                attempts = audit.trace.attempts,
                http_status = audit.trace.http_status,
                error = %e,
                "capability invocation failed"
            ),
        }
        audit.finish(&result).await;
        result
    }

    async fn run(
        &self,
        capability_id: &str,
        arguments: &Value,
        session: &Session,
        mut options: InvokeOptions,
        request_id: &str,
        trace: &mut CallTrace,
    ) -> Result<InvocationResult> {
        let started = Instant::now();
        let loaded = self.loaded.load_full();
        let cap = loaded
            .manifest
            .capability(capability_id)
            .ok_or_else(|| InvocationError::UnknownCapability {
                id: capability_id.to_string(),
            })?;

        let arguments = validation::validate_arguments(cap, arguments)?;

        let missing = session.missing_scopes(&cap.required_scopes);
        if !missing.is_empty() {
            return Err(ScopeError {
                capability: cap.id.clone(),
                missing: missing.into_iter().map(str::to_string).collect(),
            }
            .into());
        }

        confirmation::check(cap, options.acknowledgment.take())?;

        let mut diagnostics = Vec::new();
        if let Some(dep) = &cap.deprecated {
            let mut note = format!("capability '{}' is deprecated", cap.id);
            if let Some(since) = &dep.since {
                note.push_str(&format!(" since {}", since));
            }
            if let Some(replacement) = &dep.replaced_by {
                note.push_str(&format!("; use '{}'", replacement));
            }
            warn!(capability = %cap.id, "{}", note);
            diagnostics.push(note);
        }

        let mut request = request::build_request(cap, &self.base_url, &arguments, &self.config, request_id)?;
        // Local precondition: a required identity that is missing fails here.
        self.auth().attach_identity(&mut request, session)?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let work = self.dispatch(request, session, options.admission, trace);
        let guarded = async {
            match options.timeout {
                Some(after) => tokio::time::timeout(after, work)
                    .await
                    .map_err(|_| Error::from(InvocationError::Timeout { after }))?,
                None => work.await,
            }
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvocationError::Cancelled.into()),
            r = guarded => r?,
        };

        let body = self.parse_body(cap, &loaded, &response, &mut diagnostics)?;
        Ok(InvocationResult {
            capability_id: cap.id.clone(),
            status: response.status,
            body,
            diagnostics,
            attempts: trace.attempts,
            request_id: request_id.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn admit(&self, policy: AdmissionPolicy) -> Result<RatePermit> {
        match policy {
            AdmissionPolicy::Wait => Ok(self.limiter.acquire(&self.host).await),
            AdmissionPolicy::FailFast => Ok(self.limiter.try_acquire(&self.host)?),
        }
    }

    async fn dispatch(
        &self,
        mut request: PreparedRequest,
        session: &Session,
        admission: AdmissionPolicy,
        trace: &mut CallTrace,
    ) -> Result<TransportResponse> {
        let auth = self.auth();
        let mut session = auth.latest(session).await;
        if session.is_expired() {
            debug!(host = %self.host, "session expired; refreshing before dispatch");
            session = auth.refresh(&session).await?;
        }
        auth.attach_identity(&mut request, &session)?;

        let mut refreshed = false;
        let mut retries: u32 = 0;
        loop {
            let permit = self.admit(admission).await?;
            permit.commit();
            trace.attempts += 1;

            let response = match self.transport.send(request.clone()).await {
                Ok(r) => r,
                Err(e) if e.is_transient() => match self.retry.decide(retries, true, None) {
                    Decision::Retry { delay } => {
                        debug!(url = %request.url, attempt = trace.attempts, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transport failure");
                        tokio::time::sleep(delay).await;
                        retries += 1;
                        continue;
                    }
                    Decision::Fail => return Err(self.transport_failure(e, trace.attempts)),
                },
                Err(e) => return Err(self.transport_failure(e, trace.attempts)),
            };

            trace.http_status = Some(response.status);
            self.limiter.observe_headers(&self.host, &response.headers);

            match response.status {
                200..=299 => return Ok(response),
                status @ (401 | 403) => {
                    let body = ErrorBody::parse(&response.body);
                    if refreshed {
                        return Err(AuthError::Unauthorized { status, body }.into());
                    }
                    refreshed = true;
                    info!(host = %self.host, status, "credential rejected; refreshing once");
                    session = auth.refresh(&session).await?;
                    auth.attach_identity(&mut request, &session)?;
                }
                429 => {
                    let hint = retry_after(&response.headers)
                        .or_else(|| ErrorBody::parse(&response.body).and_then(|b| b.retry_after()));
                    let wait = hint.unwrap_or(DEFAULT_BLOCK);
                    self.limiter.on_throttled(&self.host, wait);
                    return Err(RateLimitedError {
                        host: self.host.clone(),
                        retry_after: wait,
                    }
                    .into());
                }
                status if status >= 500 => {
                    let body = ErrorBody::parse(&response.body);
                    let hint = retry_after(&response.headers).or_else(|| body.as_ref().and_then(ErrorBody::retry_after));
                    match self.retry.decide(retries, true, hint) {
                        Decision::Retry { delay } => {
                            debug!(url = %request.url, status, attempt = trace.attempts, delay_ms = delay.as_millis() as u64, "retrying after server error");
                            tokio::time::sleep(delay).await;
                            retries += 1;
                        }
                        Decision::Fail => {
                            return Err(InvocationError::Server {
                                status,
                                attempts: trace.attempts,
                                body,
                            }
                            .into())
                        }
                    }
                }
                status => {
                    return Err(InvocationError::ClientFault {
                        status,
                        body: ErrorBody::parse(&response.body),
                    }
                    .into())
                }
            }
        }
    }

    fn transport_failure(&self, error: TransportError, attempts: u32) -> Error {
        match error {
            TransportError::Timeout => InvocationError::Timeout {
                after: self.config.http_timeout,
            },
            other => InvocationError::Network {
                attempts,
                reason: other.to_string(),
            },
        }
        .into()
    }

    fn parse_body(
        &self,
        cap: &Capability,
        loaded: &LoadedManifest,
        response: &TransportResponse,
        diagnostics: &mut Vec<String>,
    ) -> Result<Value> {
        let body = if response.body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice::<Value>(&response.body) {
                Ok(v) => v,
                Err(e) => {
                    let declared_json = response
                        .header("content-type")
                        .map(|ct| ct.contains("json"))
                        .unwrap_or(false);
                    if declared_json {
                        return Err(InvocationError::Malformed {
                            capability: cap.id.clone(),
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    Value::String(String::from_utf8_lossy(&response.body).into_owned())
                }
            }
        };

        if let Some(compiled) = loaded.response_schemas.get(&cap.id) {
            let problems: Vec<String> = match compiled.validate(&body) {
                Ok(()) => Vec::new(),
                Err(errors) => errors
                    .map(|e| format!("{}: {}", e.instance_path, e))
                    .collect(),
            };
            if !problems.is_empty() {
                if self.strict_response_schema {
                    return Err(InvocationError::ResponseSchema {
                        capability: cap.id.clone(),
                        problems,
                    }
                    .into());
                }
                warn!(capability = %cap.id, problems = problems.len(), "response does not match declared schema");
                diagnostics.extend(problems.into_iter().map(|p| format!("response schema: {}", p)));
            }
        }
        Ok(body)
    }

    /// Invoke several capabilities concurrently (bounded by `batch_concurrency`).
    ///
    /// Results preserve input order.
    pub async fn invoke_batch(&self, calls: Vec<BatchCall>, session: &Session) -> Vec<Result<InvocationResult>> {
        let n = calls.len();
        if n == 0 {
            return Vec::new();
        }
        let limit = self.config.batch_concurrency.max(1);
        let mut out: Vec<Option<Result<InvocationResult>>> = (0..n).map(|_| None).collect();

        let results: Vec<(usize, Result<InvocationResult>)> = futures::stream::iter(calls.into_iter().enumerate())
            .map(|(idx, call)| async move {
                let r = self
                    .invoke(&call.capability_id, call.arguments, session, call.options)
                    .await;
                (idx, r)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (idx, r) in results {
            out[idx] = Some(r);
        }
        out.into_iter()
            .map(|o| o.unwrap_or_else(|| Err(InvocationError::Cancelled.into())))
            .collect()
    }

    /// Run a declared workflow. See [`WorkflowExecutor`].
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        initial_arguments: Value,
        session: &Session,
        confirmations: &dyn ConfirmationProvider,
    ) -> Result<WorkflowRun> {
        WorkflowExecutor::new(self)
            .with_confirmations(confirmations)
            .execute(workflow_id, initial_arguments, session)
            .await
    }
}
