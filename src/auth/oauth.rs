//! OAuth token endpoint exchanges and PKCE.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;
use url::Url;

use super::session::Secret;
use super::AuthError;
use crate::protocol::{HttpMethod, ScopeVocabulary};
use crate::transport::{PreparedRequest, Transport};

pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space-separated granted scopes; overrides what was requested.
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Scopes granted for a request: `requested ∩ declared`, or everything declared when nothing
/// was requested.
pub fn grant_scopes(requested: &[String], declared: &ScopeVocabulary) -> BTreeSet<String> {
    if requested.is_empty() {
        declared.keys().cloned().collect()
    } else {
        requested
            .iter()
            .filter(|s| declared.contains_key(s.as_str()))
            .cloned()
            .collect()
    }
}

/// Scopes actually granted by a token response.
pub fn granted_from_response(response: &TokenResponse, fallback: BTreeSet<String>) -> BTreeSet<String> {
    match &response.scope {
        Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
        None => fallback,
    }
}

fn form_request(url: &str, fields: Vec<(&str, String)>) -> PreparedRequest {
    PreparedRequest::new(HttpMethod::Post, url)
        .with_header("Accept", "application/json")
        .with_form(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn scope_field(scopes: &BTreeSet<String>) -> Option<(&'static str, String)> {
    if scopes.is_empty() {
        None
    } else {
        Some(("scope", scopes.iter().cloned().collect::<Vec<_>>().join(" ")))
    }
}

pub fn client_credentials_request(
    token_url: &str,
    client_id: &str,
    client_secret: &Secret,
    scopes: &BTreeSet<String>,
) -> PreparedRequest {
    let mut fields = vec![
        ("grant_type", GRANT_CLIENT_CREDENTIALS.to_string()),
        ("client_id", client_id.to_string()),
        ("client_secret", client_secret.expose().to_string()),
    ];
    fields.extend(scope_field(scopes));
    form_request(token_url, fields)
}

pub fn authorization_code_request(
    token_url: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: Option<&Secret>,
    code_verifier: &Secret,
) -> PreparedRequest {
    let mut fields = vec![
        ("grant_type", GRANT_AUTHORIZATION_CODE.to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("client_id", client_id.to_string()),
        ("code_verifier", code_verifier.expose().to_string()),
    ];
    if let Some(secret) = client_secret {
        fields.push(("client_secret", secret.expose().to_string()));
    }
    form_request(token_url, fields)
}

pub fn refresh_request(
    refresh_url: &str,
    refresh_token: &Secret,
    client_id: Option<&str>,
    client_secret: Option<&Secret>,
) -> PreparedRequest {
    let mut fields = vec![
        ("grant_type", GRANT_REFRESH_TOKEN.to_string()),
        ("refresh_token", refresh_token.expose().to_string()),
    ];
    if let Some(id) = client_id {
        fields.push(("client_id", id.to_string()));
    }
    if let Some(secret) = client_secret {
        fields.push(("client_secret", secret.expose().to_string()));
    }
    form_request(refresh_url, fields)
}

pub fn token_exchange_request(
    token_url: &str,
    subject_token: &Secret,
    subject_token_type: &str,
    actor_token: Option<&Secret>,
    client_id: Option<&str>,
    scopes: &BTreeSet<String>,
) -> PreparedRequest {
    let mut fields = vec![
        ("grant_type", GRANT_TOKEN_EXCHANGE.to_string()),
        ("subject_token", subject_token.expose().to_string()),
        ("subject_token_type", subject_token_type.to_string()),
        ("requested_token_type", super::session::ACCESS_TOKEN_TYPE.to_string()),
    ];
    if let Some(actor) = actor_token {
        fields.push(("actor_token", actor.expose().to_string()));
        fields.push(("actor_token_type", super::session::ACCESS_TOKEN_TYPE.to_string()));
    }
    if let Some(id) = client_id {
        fields.push(("client_id", id.to_string()));
    }
    fields.extend(scope_field(scopes));
    form_request(token_url, fields)
}

/// POST to a token endpoint and decode the response.
pub async fn exchange(transport: &dyn Transport, request: PreparedRequest) -> Result<TokenResponse, AuthError> {
    let url = request.url.clone();
    let response = transport.send(request).await.map_err(|e| AuthError::Exchange {
        url: url.clone(),
        status: None,
        reason: e.to_string(),
    })?;

    if !response.is_success() {
        let reason = serde_json::from_slice::<TokenErrorBody>(&response.body)
            .map(|b| match b.error_description {
                Some(d) => format!("{}: {}", b.error, d),
                None => b.error,
            })
            .unwrap_or_else(|_| String::from_utf8_lossy(&response.body).chars().take(200).collect());
        debug!(url = %url, status = response.status, "token endpoint rejected request");
        return Err(AuthError::Exchange {
            url,
            status: Some(response.status),
            reason,
        });
    }

    serde_json::from_slice::<TokenResponse>(&response.body).map_err(|e| AuthError::Exchange {
        url,
        status: Some(response.status),
        reason: format!("malformed token response: {}", e),
    })
}

/// High-entropy PKCE verifier (64 unreserved characters).
pub fn generate_verifier() -> Secret {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    Secret::new(format!("{}{}", a, b))
}

/// S256 challenge for a verifier.
pub fn code_challenge(verifier: &Secret) -> String {
    let digest = Sha256::digest(verifier.expose().as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub fn authorization_url(
    base: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &BTreeSet<String>,
    state: &str,
    challenge: &str,
) -> Result<Url, AuthError> {
    let mut url = Url::parse(base).map_err(|e| AuthError::Exchange {
        url: base.to_string(),
        status: None,
        reason: format!("invalid authorization URL: {}", e),
    })?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        if !scopes.is_empty() {
            q.append_pair("scope", &scopes.iter().cloned().collect::<Vec<_>>().join(" "));
        }
    }
    Ok(url)
}
