//! # Protocol layer
//!
//! Everything about the manifest a host publishes: the typed data model, the published JSON
//! Schema, validation and discovery.
//!
//! ## Module Structure
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`discovery`] | `ManifestFetcher`: well-known fetch, HTTP caching, forward pointers, retries |
//! | [`validator`] | `ManifestValidator`: batched structural and referential checks |
//! | [`schema`] | JSON Schema of the wire format and `$ref` resolution |
//! | [`manifest`] | Manifest, capability, parameter and workflow structures |
//! | [`config`] | Provider, auth schemes, rate limits, usage policies |
//! | [`error`] | `ValidationError` and `DiscoveryError` |
//!
//! ## Example
//!
//! ```rust
//! use atp_runtime::protocol::ManifestValidator;
//!
//! let raw = r#"{
//!   "name": "Shop", "description": "Demo shop", "version": "1.0.0",
//!   "provider": { "name": "Shop Inc", "url": "https://shop.example" },
//!   "auth": { "schemes": [{ "type": "bearer", "scopes": { "read:products": "Browse" } }] },
//!   "capabilities": [{
//!     "id": "search-products", "name": "Search", "description": "Search the catalogue",
//!     "endpoint": "/api/v1/products/search", "method": "GET",
//!     "requiredScopes": ["read:products"]
//!   }]
//! }"#;
//!
//! let manifest = ManifestValidator::new().validate_str(raw).unwrap();
//! assert_eq!(manifest.capabilities[0].id, "search-products");
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod schema;
pub mod validator;

pub use config::*;
pub use discovery::{DiscoveredManifest, ManifestFetcher};
pub use error::{DiscoveryError, ValidationError, ValidationErrors};
pub use manifest::{
    BranchTarget, Capability, Conditional, Confirmation, Deprecation, HttpMethod, Manifest,
    ParamLocation, ParamType, Parameter, Workflow,
};
pub use validator::ManifestValidator;
