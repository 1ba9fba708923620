use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::SchemeKind;
use crate::utils::time::{deadline, MAX_LIFETIME};

/// Treat a session as expired slightly early so in-flight requests don't race the expiry.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(5);

/// Secret material. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret(s.to_string())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret(s)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ClientAuth {
    pub client_id: String,
    pub client_secret: Option<Secret>,
}

/// Live credential state for one host and scheme.
#[derive(Clone)]
pub struct Session {
    host: String,
    scheme: SchemeKind,
    access_token: Secret,
    pub(crate) refresh_token: Option<Secret>,
    pub(crate) client: Option<ClientAuth>,
    expires_at: Option<Instant>,
    scopes: BTreeSet<String>,
    agent_identity: Option<String>,
    pub(crate) generation: u64,
}

impl Session {
    pub fn new<I, S>(host: impl Into<String>, scheme: SchemeKind, token: impl Into<Secret>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host: host.into(),
            scheme,
            access_token: token.into(),
            refresh_token: None,
            client: None,
            expires_at: None,
            scopes: scopes.into_iter().map(Into::into).collect(),
            agent_identity: None,
            generation: 0,
        }
    }

    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(deadline(Instant::now(), ttl, MAX_LIFETIME));
        self
    }

    pub fn with_refresh_token(mut self, token: impl Into<Secret>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_agent_identity(mut self, identity: impl Into<String>) -> Self {
        self.agent_identity = Some(identity.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> SchemeKind {
        self.scheme
    }

    pub fn access_token(&self) -> &Secret {
        &self.access_token
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn agent_identity(&self) -> Option<&str> {
        self.agent_identity.as_deref()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + EXPIRY_SKEW >= at,
            None => false,
        }
    }

    /// Required scopes this session does not hold, in the order given.
    pub fn missing_scopes<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|s| !self.scopes.contains(s.as_str()))
            .map(String::as_str)
            .collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("scheme", &self.scheme)
            .field("access_token", &self.access_token)
            .field("refreshable", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("agent_identity", &self.agent_identity)
            .finish()
    }
}

/// What the caller supplies to start a negotiation.
#[derive(Clone, Debug)]
pub enum CredentialInput {
    /// `None` resolves the key from the OS keyring or `ATP_<HOST>_API_KEY`.
    ApiKey { key: Option<Secret>, scopes: Vec<String> },
    /// `None` resolves the token from the OS keyring or `ATP_<HOST>_TOKEN`.
    Bearer { token: Option<Secret>, scopes: Vec<String> },
    ClientCredentials {
        client_id: String,
        client_secret: Secret,
        scopes: Vec<String>,
    },
    AuthorizationCode {
        client_id: String,
        client_secret: Option<Secret>,
        redirect_uri: String,
        scopes: Vec<String>,
    },
    /// RFC 8693 token exchange on behalf of a user.
    Delegated {
        subject_token: Secret,
        subject_token_type: String,
        actor_token: Option<Secret>,
        client_id: Option<String>,
        scopes: Vec<String>,
    },
}

pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

impl CredentialInput {
    pub fn api_key(key: impl Into<Secret>) -> Self {
        CredentialInput::ApiKey {
            key: Some(key.into()),
            scopes: Vec::new(),
        }
    }

    pub fn api_key_from_store() -> Self {
        CredentialInput::ApiKey {
            key: None,
            scopes: Vec::new(),
        }
    }

    pub fn bearer(token: impl Into<Secret>) -> Self {
        CredentialInput::Bearer {
            token: Some(token.into()),
            scopes: Vec::new(),
        }
    }

    pub fn client_credentials(client_id: impl Into<String>, client_secret: impl Into<Secret>) -> Self {
        CredentialInput::ClientCredentials {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes: Vec::new(),
        }
    }

    pub fn authorization_code(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        CredentialInput::AuthorizationCode {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            scopes: Vec::new(),
        }
    }

    pub fn delegated(subject_token: impl Into<Secret>) -> Self {
        CredentialInput::Delegated {
            subject_token: subject_token.into(),
            subject_token_type: ACCESS_TOKEN_TYPE.to_string(),
            actor_token: None,
            client_id: None,
            scopes: Vec::new(),
        }
    }

    /// Requested scopes; empty means every scope the scheme declares.
    pub fn with_scopes<I, S>(mut self, requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested: Vec<String> = requested.into_iter().map(Into::into).collect();
        match &mut self {
            CredentialInput::ApiKey { scopes, .. }
            | CredentialInput::Bearer { scopes, .. }
            | CredentialInput::ClientCredentials { scopes, .. }
            | CredentialInput::AuthorizationCode { scopes, .. }
            | CredentialInput::Delegated { scopes, .. } => *scopes = requested,
        }
        self
    }

    pub fn scopes(&self) -> &[String] {
        match self {
            CredentialInput::ApiKey { scopes, .. }
            | CredentialInput::Bearer { scopes, .. }
            | CredentialInput::ClientCredentials { scopes, .. }
            | CredentialInput::AuthorizationCode { scopes, .. }
            | CredentialInput::Delegated { scopes, .. } => scopes,
        }
    }

    /// Scheme this input negotiates.
    pub fn kind(&self) -> SchemeKind {
        match self {
            CredentialInput::ApiKey { .. } => SchemeKind::ApiKey,
            CredentialInput::Bearer { .. } => SchemeKind::Bearer,
            CredentialInput::ClientCredentials { .. } => SchemeKind::OAuth2ClientCredentials,
            CredentialInput::AuthorizationCode { .. } => SchemeKind::OAuth2AuthorizationCode,
            CredentialInput::Delegated { .. } => SchemeKind::Delegated,
        }
    }
}
