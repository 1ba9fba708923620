//! Protocol error types

use std::fmt;

/// One problem found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("schema violation at {path}: {message}")]
    SchemaViolation { path: String, message: String },

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("dangling reference at {path}: '{reference}' does not resolve")]
    DanglingReference { path: String, reference: String },

    #[error("capability '{capability}' requires scope '{scope}' which no auth scheme grants")]
    UngrantableScope { capability: String, scope: String },

    #[error("workflow '{workflow}' references step '{step}' which is not one of its steps")]
    UnknownStep { workflow: String, step: String },

    #[error("workflow '{workflow}' can revisit step '{step}' (path: {})", .path.join(" -> "))]
    CyclicWorkflow {
        workflow: String,
        step: String,
        path: Vec<String>,
    },
}

impl ValidationError {
    pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::SchemaViolation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn dangling(path: impl Into<String>, reference: impl Into<String>) -> Self {
        ValidationError::DanglingReference {
            path: path.into(),
            reference: reference.into(),
        }
    }
}

/// Every problem found in one validation pass. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValidationError> {
        self.0.iter()
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationError) -> bool) -> bool {
        self.0.iter().any(predicate)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s)", self.0.len())?;
        for e in &self.0 {
            write!(f, "\n  - {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl IntoIterator for ValidationErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Manifest discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no manifest published by {host}")]
    NotFound { host: String },

    #[error("network failure fetching {url} after {attempts} attempt(s): {reason}")]
    Network {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("refusing non-https manifest location {url}")]
    InsecureTransport { url: String },

    #[error("unexpected HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("invalid host '{host}'")]
    InvalidHost { host: String },

    #[error("manifest from {url} is invalid: {errors}")]
    Invalid {
        url: String,
        errors: ValidationErrors,
    },

    #[error("discovery of {host} cancelled")]
    Cancelled { host: String },
}

impl DiscoveryError {
    /// Terminal outcomes are never retried and need caller intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryError::InsecureTransport { .. })
    }
}
