use crate::auth::AuthError;
use crate::client::{ConfirmationRequiredError, InvocationError, ParameterError, ScopeError};
use crate::protocol::{DiscoveryError, ValidationErrors};
use crate::resilience::RateLimitedError;
use crate::transport::TransportError;
use crate::workflow::WorkflowError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g. "capabilities[2].endpoint")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g. expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g. "manifest_fetcher", "runtime_config")
    pub source: Option<String>,
    /// HTTP status observed, when the error came off the wire
    pub status_code: Option<u16>,
    /// Client-generated request id, for correlating with audit records
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Unified error type for the Agent Transfer Protocol runtime.
///
/// Each component keeps its own error enum; this type aggregates them so callers can
/// propagate with `?` and still match on the precise failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Manifest validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    ConfirmationRequired(#[from] ConfirmationRequiredError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether the caller must intervene before the affected host/session is usable again.
    ///
    /// Transport-security violations and unrefreshable sessions are never retried silently.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Discovery(e) => e.is_terminal(),
            Error::Auth(e) => e.is_terminal(),
            Error::Invocation(InvocationError::InsecureEndpoint { .. }) => true,
            _ => false,
        }
    }
}
