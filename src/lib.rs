//! # atp-runtime
//!
//! Reference runtime for the Agent Transfer Protocol: given a host name it discovers the
//! host's capability manifest, validates it, negotiates authentication and executes single or
//! composed capability invocations correctly, safely and observably.
//!
//! ## Overview
//!
//! A host publishes `/.well-known/agent.json`: what it can do (capabilities), how to
//! authenticate, how much traffic it accepts and how capabilities compose into workflows.
//! The runtime turns that document into an immutable [`Manifest`] and enforces it on
//! every call:
//!
//! - arguments are validated against declared parameters before any network activity
//! - sessions must hold every scope a capability requires (fail-closed, zero requests)
//! - side-effecting capabilities with a confirmation gate need a per-call [`Acknowledgment`]
//! - per-host budgets are enforced locally and refined from the host's rate-limit headers
//! - every invocation produces exactly one audit record
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use atp_runtime::{AgentClient, CredentialInput, InvokeOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> atp_runtime::Result<()> {
//!     atp_runtime::logging::init_tracing();
//!
//!     let client = AgentClient::discover("shop.example").await?;
//!     let session = client
//!         .authenticate(CredentialInput::client_credentials("agent-id", "agent-secret"))
//!         .await?
//!         .into_session()
//!         .expect("client credentials authorize immediately");
//!
//!     let result = client
//!         .invoke(
//!             "search-products",
//!             json!({ "q": "wireless headphones", "price_max": 100 }),
//!             &session,
//!             InvokeOptions::default(),
//!         )
//!         .await?;
//!     println!("{}", result.body);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | Manifest data model, JSON Schema, validation and discovery |
//! | [`auth`] | Per-host credential state machine, OAuth flows, PKCE |
//! | [`resilience`] | Per-host rate limiting and retry/backoff |
//! | [`client`] | `AgentClient`: the invocation pipeline |
//! | [`workflow`] | Condition language and workflow executor |
//! | [`audit`] | Invocation records and sinks |
//! | [`transport`] | `Transport` seam and the reqwest implementation |
//! | [`config`] | Runtime configuration and environment overrides |
//! | [`logging`] | `tracing-subscriber` initialisation |

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod resilience;
pub mod transport;
pub mod utils;
pub mod workflow;

pub use audit::{AuditSink, InvocationRecord, Outcome};
pub use auth::{AuthManager, AuthState, CredentialInput, Negotiation, Session};
pub use client::{
    Acknowledgment, AdmissionPolicy, AgentClient, AgentClientBuilder, InvocationResult,
    InvokeOptions,
};
pub use config::RuntimeConfig;
pub use protocol::{Manifest, ManifestFetcher, ManifestValidator};
pub use workflow::{ConfirmationProvider, RunState, WorkflowExecutor, WorkflowRun};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
