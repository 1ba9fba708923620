use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials;
use super::oauth::{self, TokenResponse};
use super::session::{ClientAuth, CredentialInput, Secret, Session};
use super::AuthError;
use crate::protocol::{ApiKeyLocation, AuthScheme, AuthSpec, SchemeKind, DEFAULT_API_KEY_HEADER};
use crate::transport::{PreparedRequest, Transport};

/// Observable negotiation state of one scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Negotiating,
    Authorized,
    Expired,
    Refreshing,
    /// Terminal: the session must be negotiated again from scratch.
    RefreshFailed,
}

/// Result of starting a negotiation.
#[derive(Debug)]
pub enum Negotiation {
    Authorized(Session),
    /// The authorization-code flow is waiting for the user's redirect.
    Pending(PendingAuthorization),
}

impl Negotiation {
    pub fn into_session(self) -> Option<Session> {
        match self {
            Negotiation::Authorized(s) => Some(s),
            Negotiation::Pending(_) => None,
        }
    }
}

/// Suspended authorization-code negotiation. Send the user to
/// [`authorization_url`](Self::authorization_url), then resume with
/// [`AuthManager::complete_authorization`].
#[derive(Debug)]
pub struct PendingAuthorization {
    host: String,
    authorization_url: Url,
    state: String,
    code_verifier: Secret,
    redirect_uri: String,
    client_id: String,
    client_secret: Option<Secret>,
    requested: std::collections::BTreeSet<String>,
}

impl PendingAuthorization {
    pub fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

/// Values delivered to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCallback {
    pub code: String,
    pub state: String,
}

impl AuthorizationCallback {
    /// Parse `?code=...&state=...` (or `?error=...`) from the redirect URL.
    pub fn from_redirect_url(raw: &str) -> Result<Self, AuthError> {
        let url = Url::parse(raw).map_err(|e| AuthError::Exchange {
            url: raw.to_string(),
            status: None,
            reason: e.to_string(),
        })?;
        let mut code = None;
        let mut state = None;
        let mut error = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "code" => code = Some(v.into_owned()),
                "state" => state = Some(v.into_owned()),
                "error" => error = Some(v.into_owned()),
                _ => {}
            }
        }
        if let Some(error) = error {
            return Err(AuthError::Exchange {
                url: raw.to_string(),
                status: None,
                reason: format!("authorization denied: {}", error),
            });
        }
        match (code, state) {
            (Some(code), Some(state)) => Ok(Self { code, state }),
            _ => Err(AuthError::Exchange {
                url: raw.to_string(),
                status: None,
                reason: "redirect is missing code or state".to_string(),
            }),
        }
    }
}

struct SlotInner {
    session: Option<Session>,
    generation: u64,
}

struct SchemeSlot {
    /// Held for the whole of a negotiation or refresh; this is what makes refresh single-flight.
    inner: tokio::sync::Mutex<SlotInner>,
    state: Mutex<AuthState>,
}

impl SchemeSlot {
    fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(SlotInner {
                session: None,
                generation: 0,
            }),
            state: Mutex::new(AuthState::Unauthenticated),
        }
    }

    fn get_state(&self) -> AuthState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, to: AuthState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

/// Transitional state that rolls back if the owning future is dropped.
struct Transition<'a> {
    slot: &'a SchemeSlot,
    rollback: Option<AuthState>,
}

impl<'a> Transition<'a> {
    fn begin(slot: &'a SchemeSlot, during: AuthState) -> Self {
        let prev = slot.get_state();
        slot.set_state(during);
        Self {
            slot,
            rollback: Some(prev),
        }
    }

    fn finish(mut self, to: AuthState) {
        self.rollback = None;
        self.slot.set_state(to);
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if let Some(prev) = self.rollback.take() {
            self.slot.set_state(prev);
        }
    }
}

/// Per-host credential state machine.
///
/// Each declared scheme has its own slot. Negotiations and refreshes on a slot are serialized,
/// so concurrent callers that notice an expired session share one refresh.
pub struct AuthManager {
    host: String,
    auth: AuthSpec,
    transport: Arc<dyn Transport>,
    agent_identity: Option<String>,
    slots: Mutex<HashMap<SchemeKind, Arc<SchemeSlot>>>,
}

impl AuthManager {
    pub fn new(host: impl Into<String>, auth: AuthSpec, transport: Arc<dyn Transport>) -> Self {
        Self {
            host: host.into(),
            auth,
            transport,
            agent_identity: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Verifiable identity stamped on every session this manager creates.
    pub fn with_agent_identity(mut self, identity: Option<String>) -> Self {
        self.agent_identity = identity;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn auth_spec(&self) -> &AuthSpec {
        &self.auth
    }

    fn slot(&self, kind: SchemeKind) -> Arc<SchemeSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(kind).or_insert_with(|| Arc::new(SchemeSlot::new())).clone()
    }

    fn scheme(&self, kind: SchemeKind) -> Result<&AuthScheme, AuthError> {
        self.auth
            .scheme(kind)
            .ok_or(AuthError::UnsupportedScheme { scheme: kind })
    }

    pub fn state(&self, kind: SchemeKind) -> AuthState {
        let slot = self.slot(kind);
        let state = slot.get_state();
        if state == AuthState::Authorized {
            if let Ok(inner) = slot.inner.try_lock() {
                if inner.session.as_ref().map(Session::is_expired).unwrap_or(false) {
                    return AuthState::Expired;
                }
            }
        }
        state
    }

    /// Latest session for the scheme, if one is authorized.
    pub async fn current_session(&self, kind: SchemeKind) -> Option<Session> {
        let slot = self.slot(kind);
        let inner = slot.inner.lock().await;
        inner.session.clone()
    }

    /// The newest session for `session`'s scheme: `session` itself unless a refresh replaced it.
    pub(crate) async fn latest(&self, session: &Session) -> Session {
        match self.current_session(session.scheme()).await {
            Some(current) if current.generation > session.generation => current,
            _ => session.clone(),
        }
    }

    fn finish_session(&self, inner: &mut SlotInner, mut session: Session) -> Session {
        inner.generation += 1;
        session.generation = inner.generation;
        if let Some(identity) = &self.agent_identity {
            if session.agent_identity().is_none() {
                session = session.with_agent_identity(identity.clone());
            }
        }
        inner.session = Some(session.clone());
        session
    }

    fn session_from_token(
        &self,
        kind: SchemeKind,
        token: TokenResponse,
        requested: std::collections::BTreeSet<String>,
        client: Option<ClientAuth>,
    ) -> Session {
        let scopes = oauth::granted_from_response(&token, requested);
        let mut session = Session::new(self.host.clone(), kind, token.access_token, scopes);
        if let Some(secs) = token.expires_in {
            session = session.with_expires_in(Duration::from_secs(secs));
        }
        if let Some(rt) = token.refresh_token {
            session = session.with_refresh_token(rt);
        }
        session.client = client;
        session
    }

    /// Start (or, for static credentials, complete) a negotiation.
    pub async fn acquire_session(
        &self,
        kind: SchemeKind,
        input: CredentialInput,
    ) -> Result<Negotiation, AuthError> {
        let scheme = self.scheme(kind)?.clone();
        if input.kind() != kind {
            return Err(AuthError::CredentialMismatch {
                scheme: kind,
                supplied: input.kind(),
            });
        }
        let requested = oauth::grant_scopes(input.scopes(), scheme.scopes());

        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;
        let transition = Transition::begin(&slot, AuthState::Negotiating);
        debug!(host = %self.host, scheme = %kind, "negotiating session");

        let session = match input {
            CredentialInput::ApiKey { key, .. } => {
                let key = key
                    .or_else(|| credentials::lookup_api_key(&self.host))
                    .ok_or(AuthError::MissingCredential { scheme: kind })?;
                Session::new(self.host.clone(), kind, key, requested)
            }
            CredentialInput::Bearer { token, .. } => {
                let token = token
                    .or_else(|| credentials::lookup_bearer_token(&self.host))
                    .ok_or(AuthError::MissingCredential { scheme: kind })?;
                Session::new(self.host.clone(), kind, token, requested)
            }
            CredentialInput::ClientCredentials {
                client_id,
                client_secret,
                ..
            } => {
                let token_url = scheme.token_url().unwrap_or_default();
                let request =
                    oauth::client_credentials_request(token_url, &client_id, &client_secret, &requested);
                let token = oauth::exchange(self.transport.as_ref(), request).await?;
                let client = ClientAuth {
                    client_id,
                    client_secret: Some(client_secret),
                };
                self.session_from_token(kind, token, requested, Some(client))
            }
            CredentialInput::AuthorizationCode {
                client_id,
                client_secret,
                redirect_uri,
                ..
            } => {
                let AuthScheme::OAuth2AuthorizationCode {
                    authorization_url, ..
                } = &scheme
                else {
                    return Err(AuthError::UnsupportedScheme { scheme: kind });
                };
                let verifier = oauth::generate_verifier();
                let state = uuid::Uuid::new_v4().to_string();
                let url = oauth::authorization_url(
                    authorization_url,
                    &client_id,
                    &redirect_uri,
                    &requested,
                    &state,
                    &oauth::code_challenge(&verifier),
                )?;
                // Stays Negotiating until the redirect arrives.
                transition.finish(AuthState::Negotiating);
                info!(host = %self.host, "authorization pending user consent");
                return Ok(Negotiation::Pending(PendingAuthorization {
                    host: self.host.clone(),
                    authorization_url: url,
                    state,
                    code_verifier: verifier,
                    redirect_uri,
                    client_id,
                    client_secret,
                    requested,
                }));
            }
            CredentialInput::Delegated {
                subject_token,
                subject_token_type,
                actor_token,
                client_id,
                ..
            } => {
                let token_url = scheme.token_url().unwrap_or_default();
                let request = oauth::token_exchange_request(
                    token_url,
                    &subject_token,
                    &subject_token_type,
                    actor_token.as_ref(),
                    client_id.as_deref(),
                    &requested,
                );
                let token = oauth::exchange(self.transport.as_ref(), request).await?;
                let client = client_id.map(|client_id| ClientAuth {
                    client_id,
                    client_secret: None,
                });
                self.session_from_token(kind, token, requested, client)
            }
        };

        let session = self.finish_session(&mut inner, session);
        transition.finish(AuthState::Authorized);
        info!(host = %self.host, scheme = %kind, scopes = session.scopes().len(), "session authorized");
        Ok(Negotiation::Authorized(session))
    }

    /// Resume an authorization-code negotiation with the redirect result.
    pub async fn complete_authorization(
        &self,
        pending: PendingAuthorization,
        callback: AuthorizationCallback,
    ) -> Result<Session, AuthError> {
        let kind = SchemeKind::OAuth2AuthorizationCode;
        if pending.host != self.host || pending.state != callback.state {
            warn!(host = %self.host, "authorization callback state mismatch");
            return Err(AuthError::StateMismatch);
        }
        let scheme = self.scheme(kind)?.clone();
        let token_url = scheme.token_url().unwrap_or_default();

        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;
        let transition = Transition::begin(&slot, AuthState::Negotiating);

        let request = oauth::authorization_code_request(
            token_url,
            &callback.code,
            &pending.redirect_uri,
            &pending.client_id,
            pending.client_secret.as_ref(),
            &pending.code_verifier,
        );
        let token = match oauth::exchange(self.transport.as_ref(), request).await {
            Ok(t) => t,
            Err(e) => {
                transition.finish(AuthState::Unauthenticated);
                return Err(e);
            }
        };
        let client = ClientAuth {
            client_id: pending.client_id,
            client_secret: pending.client_secret,
        };
        let session = self.session_from_token(kind, token, pending.requested, Some(client));
        let session = self.finish_session(&mut inner, session);
        transition.finish(AuthState::Authorized);
        info!(host = %self.host, "authorization code exchanged");
        Ok(session)
    }

    /// Refresh `session`. Concurrent callers holding the same stale session share one refresh.
    pub async fn refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let kind = session.scheme();
        let scheme = self.scheme(kind)?.clone();
        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;

        // Someone else already refreshed while we waited.
        if let Some(current) = &inner.session {
            if current.generation > session.generation && !current.is_expired() {
                debug!(host = %self.host, scheme = %kind, "reusing concurrent refresh");
                return Ok(current.clone());
            }
        }
        if slot.get_state() == AuthState::RefreshFailed {
            return Err(AuthError::RefreshFailed {
                scheme: kind,
                reason: "previous refresh failed; negotiate a new session".to_string(),
            });
        }

        let (Some(refresh_url), Some(refresh_token)) = (scheme.refresh_url(), session.refresh_token.as_ref()) else {
            inner.session = None;
            slot.set_state(AuthState::Unauthenticated);
            warn!(host = %self.host, scheme = %kind, "session cannot be refreshed");
            return Err(AuthError::Unrefreshable { scheme: kind });
        };

        let transition = Transition::begin(&slot, AuthState::Refreshing);
        debug!(host = %self.host, scheme = %kind, "refreshing session");
        let client = session.client.clone();
        let request = oauth::refresh_request(
            refresh_url,
            refresh_token,
            client.as_ref().map(|c| c.client_id.as_str()),
            client.as_ref().and_then(|c| c.client_secret.as_ref()),
        );
        match oauth::exchange(self.transport.as_ref(), request).await {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    // Refresh token rotation is optional; keep the old one.
                    token.refresh_token = Some(refresh_token.expose().to_string());
                }
                let fallback = session.scopes().clone();
                let refreshed = self.session_from_token(kind, token, fallback, client);
                let refreshed = self.finish_session(&mut inner, refreshed);
                transition.finish(AuthState::Authorized);
                info!(host = %self.host, scheme = %kind, "session refreshed");
                Ok(refreshed)
            }
            Err(e) => {
                inner.session = None;
                transition.finish(AuthState::RefreshFailed);
                warn!(host = %self.host, scheme = %kind, error = %e, "refresh failed");
                Err(AuthError::RefreshFailed {
                    scheme: kind,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Forget the scheme's session. A later call must negotiate again.
    pub async fn revoke(&self, kind: SchemeKind) {
        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;
        inner.session = None;
        slot.set_state(AuthState::Unauthenticated);
        info!(host = %self.host, scheme = %kind, "session revoked");
    }

    /// Put credential and identity material on an outgoing request.
    pub fn attach_identity(&self, request: &mut PreparedRequest, session: &Session) -> Result<(), AuthError> {
        attach_identity(request, session, &self.auth, self.agent_identity.as_deref())
    }
}

/// Put the session credential and, when the host asks for one, the agent identity on `request`.
///
/// A missing identity for a host that requires one fails locally.
pub fn attach_identity(
    request: &mut PreparedRequest,
    session: &Session,
    auth: &AuthSpec,
    default_identity: Option<&str>,
) -> Result<(), AuthError> {
    let identity = session.agent_identity().or(default_identity);
    if auth.identity_required() && identity.is_none() {
        return Err(AuthError::MissingIdentity {
            header: auth.identity_header().to_string(),
        });
    }

    let token = session.access_token().expose();
    match auth.scheme(session.scheme()) {
        Some(AuthScheme::ApiKey { location, name, .. }) => match location {
            ApiKeyLocation::Header => {
                request.set_header(name.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER), token);
            }
            ApiKeyLocation::Query => {
                let name = name.as_deref().unwrap_or("api_key").to_string();
                request.query.retain(|(k, _)| k != &name);
                request.query.push((name, token.to_string()));
            }
        },
        _ => request.set_header("Authorization", format!("Bearer {}", token)),
    }

    if auth.agent_identity.is_some() {
        if let Some(identity) = identity {
            request.set_header(auth.identity_header(), identity);
        }
    }
    Ok(())
}
