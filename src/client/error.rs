//! Invocation error types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::protocol::ParamType;
use crate::utils::time::{secs_f64, MAX_SERVER_HINT};

/// Structured error body a host returns as `{"error": {code, message, details, retryAfter}}`.
///
/// Surfaced verbatim inside invocation errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

#[derive(Deserialize)]
struct Envelope {
    error: ErrorBody,
}

impl ErrorBody {
    /// Parse the wrapped form, falling back to a bare `{code, message}` object.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if let Ok(env) = serde_json::from_slice::<Envelope>(body) {
            return Some(env.error);
        }
        serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .filter(|b| b.code.is_some() || b.message.is_some())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.and_then(|s| secs_f64(s, MAX_SERVER_HINT))
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{}: {}", code, message),
            (Some(code), None) => f.write_str(code),
            (None, Some(message)) => f.write_str(message),
            (None, None) => f.write_str("no details"),
        }
    }
}

fn describe(body: &Option<ErrorBody>) -> String {
    body.as_ref().map(|b| format!(" ({})", b)).unwrap_or_default()
}

/// The session lacks scopes the capability requires. Raised before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capability '{capability}' requires scopes not granted to this session: {}", .missing.join(", "))]
pub struct ScopeError {
    pub capability: String,
    pub missing: Vec<String>,
}

/// A gated capability was invoked without a matching acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capability '{capability}' requires explicit confirmation: {message}")]
pub struct ConfirmationRequiredError {
    pub capability: String,
    /// The message that has to be presented to a human.
    pub message: String,
}

/// Caller-supplied arguments do not satisfy the capability's declared parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("arguments for '{capability}' must be a JSON object, found {found}")]
    NotAnObject { capability: String, found: String },

    #[error("'{capability}' has no parameter '{name}'")]
    Unknown { capability: String, name: String },

    #[error("'{capability}' requires parameter '{name}'")]
    Missing { capability: String, name: String },

    #[error("parameter '{name}' of '{capability}' must be {expected}, found {found}")]
    Type {
        capability: String,
        name: String,
        expected: ParamType,
        found: String,
    },

    #[error("parameter '{name}' of '{capability}': {value} is not one of the allowed values")]
    Enum {
        capability: String,
        name: String,
        value: Value,
    },

    #[error("parameter '{name}' of '{capability}': {reason}")]
    Bounds {
        capability: String,
        name: String,
        reason: String,
    },

    #[error("parameter '{name}' of '{capability}' does not match pattern '{pattern}'")]
    Pattern {
        capability: String,
        name: String,
        pattern: String,
    },

    #[error("parameter '{name}' of '{capability}' is not a valid {format}")]
    Format {
        capability: String,
        name: String,
        format: String,
    },

    /// Path values that are empty or only dots would resolve to another route.
    #[error("parameter '{name}' of '{capability}' cannot be used as a path segment: {value:?}")]
    PathSegment {
        capability: String,
        name: String,
        value: String,
    },
}

/// Failure on the way to, or back from, the host.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("unknown capability '{id}'")]
    UnknownCapability { id: String },

    #[error("host rejected the request with HTTP {status}{}", describe(.body))]
    ClientFault {
        status: u16,
        body: Option<ErrorBody>,
    },

    #[error("host failed with HTTP {status} after {attempts} attempt(s){}", describe(.body))]
    Server {
        status: u16,
        attempts: u32,
        body: Option<ErrorBody>,
    },

    #[error("invocation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("network failure after {attempts} attempt(s): {reason}")]
    Network { attempts: u32, reason: String },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("refusing non-https endpoint {url}")]
    InsecureEndpoint { url: String },

    #[error("response of '{capability}' does not match its schema: {}", .problems.join("; "))]
    ResponseSchema {
        capability: String,
        problems: Vec<String>,
    },

    #[error("malformed response from '{capability}': {reason}")]
    Malformed { capability: String, reason: String },
}

impl InvocationError {
    /// Structured body the host sent, if any.
    pub fn body(&self) -> Option<&ErrorBody> {
        match self {
            InvocationError::ClientFault { body, .. } | InvocationError::Server { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            InvocationError::ClientFault { status, .. } | InvocationError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_parses_wrapped_and_bare_forms() {
        let wrapped = br#"{"error":{"code":"out_of_stock","message":"Item unavailable","details":{"sku":"A1"},"retryAfter":5}}"#;
        let body = ErrorBody::parse(wrapped).unwrap();
        assert_eq!(body.code.as_deref(), Some("out_of_stock"));
        assert_eq!(body.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(body.details.unwrap()["sku"], "A1");

        let bare = br#"{"code":"bad_request","message":"q is empty"}"#;
        assert_eq!(ErrorBody::parse(bare).unwrap().to_string(), "bad_request: q is empty");

        let huge = ErrorBody::parse(br#"{"error":{"code":"slow","retryAfter":1e300}}"#).unwrap();
        assert_eq!(huge.retry_after(), Some(Duration::from_secs(86_400)));

        assert!(ErrorBody::parse(b"<html>oops</html>").is_none());
        assert!(ErrorBody::parse(br#"{"items":[]}"#).is_none());
    }

    #[test]
    fn errors_surface_host_body() {
        let err = InvocationError::Server {
            status: 503,
            attempts: 3,
            body: Some(ErrorBody {
                code: Some("maintenance".into()),
                ..Default::default()
            }),
        };
        assert!(err.to_string().contains("maintenance"));
        assert_eq!(err.status(), Some(503));

        let scope = ScopeError {
            capability: "create-order".into(),
            missing: vec!["write:orders".into(), "read:cart".into()],
        };
        assert!(scope.to_string().ends_with("write:orders, read:cart"));
    }
}
