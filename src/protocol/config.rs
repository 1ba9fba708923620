//! Manifest configuration structures
//!
//! Provider metadata, authentication schemes, declared rate limits and usage policies.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Scope vocabulary: scope name -> human description.
pub type ScopeVocabulary = BTreeMap<String, String>;

/// Publisher of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Provider {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Authentication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    pub schemes: Vec<AuthScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<AgentIdentitySpec>,
}

impl AuthSpec {
    /// Every scope grantable by at least one scheme.
    pub fn declared_scopes(&self) -> BTreeSet<&str> {
        self.schemes
            .iter()
            .flat_map(|s| s.scopes().keys().map(String::as_str))
            .collect()
    }

    /// First scheme of the given kind.
    pub fn scheme(&self, kind: SchemeKind) -> Option<&AuthScheme> {
        self.schemes.iter().find(|s| s.kind() == kind)
    }

    /// Whether requests must carry a verifiable agent identity header.
    pub fn identity_required(&self) -> bool {
        self.agent_identity
            .as_ref()
            .map(|i| i.required)
            .unwrap_or(false)
    }

    /// Header used for the verifiable agent identity.
    pub fn identity_header(&self) -> &str {
        self.agent_identity
            .as_ref()
            .and_then(|i| i.header.as_deref())
            .unwrap_or(DEFAULT_IDENTITY_HEADER)
    }
}

pub const DEFAULT_IDENTITY_HEADER: &str = "X-Agent-Identity";
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Verifiable agent identity requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentIdentitySpec {
    #[serde(default)]
    pub required: bool,
    /// Accepted identity methods, e.g. `did:web`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// Where an API key travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// One authentication scheme declared by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum AuthScheme {
    #[serde(rename = "oauth2-authorizationCode", rename_all = "camelCase")]
    OAuth2AuthorizationCode {
        authorization_url: String,
        token_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_url: Option<String>,
        #[serde(default)]
        scopes: ScopeVocabulary,
    },
    #[serde(rename = "oauth2-clientCredentials", rename_all = "camelCase")]
    OAuth2ClientCredentials {
        token_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_url: Option<String>,
        #[serde(default)]
        scopes: ScopeVocabulary,
    },
    #[serde(rename = "apiKey")]
    ApiKey {
        #[serde(default, rename = "in")]
        location: ApiKeyLocation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        scopes: ScopeVocabulary,
    },
    #[serde(rename = "bearer", rename_all = "camelCase")]
    Bearer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_format: Option<String>,
        #[serde(default)]
        scopes: ScopeVocabulary,
    },
    #[serde(rename = "delegated", rename_all = "camelCase")]
    Delegated {
        token_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_url: Option<String>,
        #[serde(default)]
        scopes: ScopeVocabulary,
    },
}

/// Discriminant of [`AuthScheme`], used as a map key for per-scheme state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemeKind {
    OAuth2AuthorizationCode,
    OAuth2ClientCredentials,
    ApiKey,
    Bearer,
    Delegated,
}

impl SchemeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeKind::OAuth2AuthorizationCode => "oauth2-authorizationCode",
            SchemeKind::OAuth2ClientCredentials => "oauth2-clientCredentials",
            SchemeKind::ApiKey => "apiKey",
            SchemeKind::Bearer => "bearer",
            SchemeKind::Delegated => "delegated",
        }
    }
}

impl std::fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuthScheme {
    pub fn kind(&self) -> SchemeKind {
        match self {
            AuthScheme::OAuth2AuthorizationCode { .. } => SchemeKind::OAuth2AuthorizationCode,
            AuthScheme::OAuth2ClientCredentials { .. } => SchemeKind::OAuth2ClientCredentials,
            AuthScheme::ApiKey { .. } => SchemeKind::ApiKey,
            AuthScheme::Bearer { .. } => SchemeKind::Bearer,
            AuthScheme::Delegated { .. } => SchemeKind::Delegated,
        }
    }

    pub fn scopes(&self) -> &ScopeVocabulary {
        match self {
            AuthScheme::OAuth2AuthorizationCode { scopes, .. }
            | AuthScheme::OAuth2ClientCredentials { scopes, .. }
            | AuthScheme::ApiKey { scopes, .. }
            | AuthScheme::Bearer { scopes, .. }
            | AuthScheme::Delegated { scopes, .. } => scopes,
        }
    }

    pub fn token_url(&self) -> Option<&str> {
        match self {
            AuthScheme::OAuth2AuthorizationCode { token_url, .. }
            | AuthScheme::OAuth2ClientCredentials { token_url, .. }
            | AuthScheme::Delegated { token_url, .. } => Some(token_url),
            _ => None,
        }
    }

    /// Refresh endpoint; `None` means sessions from this scheme cannot be refreshed.
    pub fn refresh_url(&self) -> Option<&str> {
        match self {
            AuthScheme::OAuth2AuthorizationCode { refresh_url, .. }
            | AuthScheme::OAuth2ClientCredentials { refresh_url, .. }
            | AuthScheme::Delegated { refresh_url, .. } => refresh_url.as_deref(),
            _ => None,
        }
    }

    /// All endpoint URLs the scheme declares, labelled by field name.
    pub fn endpoints(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let AuthScheme::OAuth2AuthorizationCode {
            authorization_url, ..
        } = self
        {
            out.push(("authorizationUrl", authorization_url.as_str()));
        }
        if let Some(t) = self.token_url() {
            out.push(("tokenUrl", t));
        }
        if let Some(r) = self.refresh_url() {
            out.push(("refreshUrl", r));
        }
        out
    }
}

/// Self-declared request budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub requests: u32,
    /// Window length such as `"30s"`, `"1m"`, `"1h"` or `"1d"`.
    pub window: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<u32>,
}

impl RateLimitSpec {
    pub fn window_duration(&self) -> Option<Duration> {
        parse_window(&self.window)
    }
}

/// Parse `"<n><unit>"` window strings; a bare integer is seconds.
pub fn parse_window(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    let secs = match unit.trim() {
        "" | "s" | "sec" | "second" | "seconds" => n,
        "m" | "min" | "minute" | "minutes" => n.checked_mul(60)?,
        "h" | "hour" | "hours" => n.checked_mul(3_600)?,
        "d" | "day" | "days" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Training / inference / attribution / caching stance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<UsagePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<UsagePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<AttributionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UsagePolicy {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AttributionPolicy {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CachingPolicy {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
}
