//! Capability invocation.
//!
//! [`AgentClient`] is the invocation context for one host; the pipeline itself is split into
//! submodules under `src/client/`.

pub mod builder;
pub mod confirmation;
pub mod core;
pub mod error;
pub mod request;
pub mod validation;

pub use builder::AgentClientBuilder;
pub use confirmation::Acknowledgment;
pub use core::{AdmissionPolicy, AgentClient, BatchCall, InvocationResult, InvokeOptions};
pub use error::{ConfirmationRequiredError, ErrorBody, InvocationError, ParameterError, ScopeError};
