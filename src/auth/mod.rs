//! # Authentication
//!
//! [`AuthManager`] owns the credential state of one host: one slot per declared scheme, each
//! moving through
//! `Unauthenticated → Negotiating → Authorized → Expired → Refreshing → Authorized | RefreshFailed`.
//!
//! Static credentials (`apiKey`, `bearer`) authorize immediately. Client credentials and
//! delegated (RFC 8693) schemes perform one token exchange. The authorization-code flow
//! returns a [`PendingAuthorization`] (PKCE S256 + `state`) that the application resumes with
//! [`AuthManager::complete_authorization`] once the redirect arrives.

pub mod credentials;
mod manager;
pub mod oauth;
mod session;

pub use manager::{
    attach_identity, AuthManager, AuthState, AuthorizationCallback, Negotiation,
    PendingAuthorization,
};
pub use session::{CredentialInput, Secret, Session, EXPIRY_SKEW};

use crate::client::ErrorBody;
use crate::protocol::SchemeKind;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized (HTTP {status})")]
    Unauthorized {
        status: u16,
        body: Option<ErrorBody>,
    },

    #[error("{scheme} session cannot be refreshed; negotiate a new session")]
    Unrefreshable { scheme: SchemeKind },

    #[error("host does not offer the {scheme} scheme")]
    UnsupportedScheme { scheme: SchemeKind },

    #[error("unknown auth scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    #[error("{supplied} credentials supplied for the {scheme} scheme")]
    CredentialMismatch {
        scheme: SchemeKind,
        supplied: SchemeKind,
    },

    #[error("no stored credential for the {scheme} scheme")]
    MissingCredential { scheme: SchemeKind },

    #[error("no authorized {scheme} session")]
    NotAuthenticated { scheme: SchemeKind },

    #[error("{scheme} refresh failed: {reason}")]
    RefreshFailed { scheme: SchemeKind, reason: String },

    #[error("token exchange with {url} failed{}: {reason}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Exchange {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("authorization callback state does not match the pending request")]
    StateMismatch,

    #[error("host requires a verifiable agent identity ({header}) but none is configured")]
    MissingIdentity { header: String },
}

impl AuthError {
    /// Terminal for the session: the caller has to negotiate again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::Unrefreshable { .. } | AuthError::RefreshFailed { .. }
        )
    }
}

impl std::str::FromStr for SchemeKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth2-authorizationCode" => Ok(SchemeKind::OAuth2AuthorizationCode),
            "oauth2-clientCredentials" => Ok(SchemeKind::OAuth2ClientCredentials),
            "apiKey" => Ok(SchemeKind::ApiKey),
            "bearer" => Ok(SchemeKind::Bearer),
            "delegated" => Ok(SchemeKind::Delegated),
            other => Err(AuthError::UnknownScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_names_round_trip() {
        for kind in [
            SchemeKind::OAuth2AuthorizationCode,
            SchemeKind::OAuth2ClientCredentials,
            SchemeKind::ApiKey,
            SchemeKind::Bearer,
            SchemeKind::Delegated,
        ] {
            assert_eq!(kind.as_str().parse::<SchemeKind>().unwrap(), kind);
        }
        assert!(matches!(
            "saml".parse::<SchemeKind>(),
            Err(AuthError::UnknownScheme { .. })
        ));
    }

    #[test]
    fn unrefreshable_is_terminal() {
        assert!(AuthError::Unrefreshable { scheme: SchemeKind::Bearer }.is_terminal());
        assert!(!AuthError::StateMismatch.is_terminal());
    }
}
