//! # Audit log
//!
//! Every `invoke` call produces exactly one [`InvocationRecord`], whichever gate ended it.
//! Records go to an [`AuditSink`]; sinks are append-only.
//!
//! | Sink | Description |
//! |------|-------------|
//! | [`InMemoryAuditSink`] | Bounded in-memory buffer for tests; counts evictions |
//! | [`TracingAuditSink`] | Emits one `tracing` event per record |
//! | [`JsonLinesAuditSink`] | Appends one JSON object per line to a file |
//! | [`CompositeAuditSink`] | Fans out to several sinks |
//! | [`NoopAuditSink`] | Discards records |

mod sinks;

pub use sinks::{
    CompositeAuditSink, InMemoryAuditSink, JsonLinesAuditSink, NoopAuditSink, TracingAuditSink,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::InvocationError;
use crate::{Error, Result};

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Outcome classification of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    ParameterRejected,
    ScopeDenied,
    ConfirmationRequired,
    RateLimited,
    AuthFailed,
    ClientFault,
    ServerError,
    Timeout,
    NetworkError,
    Cancelled,
    Failed,
}

impl Outcome {
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Parameter(_) => Outcome::ParameterRejected,
            Error::Scope(_) => Outcome::ScopeDenied,
            Error::ConfirmationRequired(_) => Outcome::ConfirmationRequired,
            Error::RateLimited(_) => Outcome::RateLimited,
            Error::Auth(_) => Outcome::AuthFailed,
            Error::Invocation(e) => match e {
                InvocationError::ClientFault { .. } => Outcome::ClientFault,
                InvocationError::Server { .. } => Outcome::ServerError,
                InvocationError::Timeout { .. } => Outcome::Timeout,
                InvocationError::Network { .. } => Outcome::NetworkError,
                InvocationError::Cancelled => Outcome::Cancelled,
                _ => Outcome::Failed,
            },
            Error::Transport(_) => Outcome::NetworkError,
            _ => Outcome::Failed,
        }
    }

    /// Whether the call reached the host at least once.
    pub fn reached_host(&self) -> bool {
        matches!(
            self,
            Outcome::Success
                | Outcome::ClientFault
                | Outcome::ServerError
                | Outcome::AuthFailed
                | Outcome::RateLimited
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Audit entry for one `invoke` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub request_id: String,
    pub agent_identity: Option<String>,
    pub host: String,
    pub capability_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub outcome: Outcome,
    pub http_status: Option<u16>,
    /// Network attempts made (0 when a local gate stopped the call).
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl InvocationRecord {
    pub fn new(
        request_id: impl Into<String>,
        host: impl Into<String>,
        capability_id: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            agent_identity: None,
            host: host.into(),
            capability_id: capability_id.into(),
            timestamp: timestamp(),
            outcome,
            http_status: None,
            attempts: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_agent_identity(mut self, identity: Option<String>) -> Self {
        self.agent_identity = identity;
        self
    }

    pub fn with_http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: InvocationRecord) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
