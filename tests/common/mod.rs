//! Shared fixtures: a scripted transport double and a small shop manifest.

#![allow(dead_code)]

use async_trait::async_trait;
use atp_runtime::audit::InMemoryAuditSink;
use atp_runtime::protocol::{HttpMethod, Manifest, ManifestValidator, SchemeKind};
use atp_runtime::transport::{PreparedRequest, Transport, TransportError, TransportResponse};
use atp_runtime::{AgentClient, RuntimeConfig, Session};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const HOST: &str = "shop.example";

/// One scripted outcome.
#[derive(Clone)]
pub enum Reply {
    Respond(TransportResponse),
    Timeout,
    Refused,
}

struct Route {
    method: HttpMethod,
    path: String,
    replies: VecDeque<Reply>,
}

/// In-memory [`Transport`] that replays scripted replies per `(method, path)` and records
/// every request it sees. The last reply of a route repeats; unknown routes answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<PreparedRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: HttpMethod, path: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|r| r.method == method && r.path == path) {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    pub fn respond(&self, method: HttpMethod, path: &str, response: TransportResponse) -> &Self {
        self.on(method, path, Reply::Respond(response))
    }

    /// Delay every reply (lets concurrent callers overlap).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<PreparedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| path_of(&r.url) == path)
            .collect()
    }

    fn next_reply(&self, request: &PreparedRequest) -> Reply {
        let path = path_of(&request.url);
        let mut routes = self.routes.lock().unwrap();
        let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == request.method && r.path == path)
        else {
            return Reply::Respond(TransportResponse::new(404, ""));
        };
        if route.replies.len() > 1 {
            route.replies.pop_front().unwrap()
        } else {
            route.replies.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: PreparedRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.next_reply(&request);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Reply::Respond(r) => Ok(r),
            Reply::Timeout => Err(TransportError::Timeout),
            Reply::Refused => Err(TransportError::Connect("connection refused".to_string())),
        }
    }
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

pub fn json_response(status: u16, body: Value) -> TransportResponse {
    with_header(
        TransportResponse::new(status, serde_json::to_vec(&body).unwrap()),
        "content-type",
        "application/json",
    )
}

pub fn with_header(mut response: TransportResponse, name: &str, value: &str) -> TransportResponse {
    response.headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_str(value).unwrap(),
    );
    response
}

pub fn token_response(access: &str, refresh: Option<&str>, expires_in: u64) -> TransportResponse {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    json_response(200, body)
}

/// Shop manifest: search, order placement (confirmation-gated), appointment workflow.
pub fn manifest_json() -> Value {
    json!({
        "name": "Example Shop",
        "description": "Products, orders and fitting appointments",
        "version": "1.2.0",
        "provider": { "name": "Example Retail", "url": "https://shop.example" },
        "auth": {
            "schemes": [
                {
                    "type": "oauth2-clientCredentials",
                    "tokenUrl": "https://shop.example/oauth/token",
                    "refreshUrl": "https://shop.example/oauth/token",
                    "scopes": {
                        "read:products": "Browse the catalogue",
                        "write:orders": "Place orders",
                        "read:appointments": "See free slots",
                        "write:appointments": "Book slots"
                    }
                },
                {
                    "type": "oauth2-authorizationCode",
                    "authorizationUrl": "https://shop.example/oauth/authorize",
                    "tokenUrl": "https://shop.example/oauth/token",
                    "scopes": { "read:products": "Browse the catalogue" }
                }
            ]
        },
        "rateLimit": { "requests": 100, "window": "1m" },
        "capabilities": [
            {
                "id": "search-products",
                "name": "Search products",
                "description": "Full-text product search",
                "semanticType": "commerce:search",
                "endpoint": "/api/v1/products/search",
                "method": "GET",
                "parameters": [
                    { "name": "q", "type": "string", "required": true },
                    { "name": "price_max", "type": "number", "minimum": 0 }
                ],
                "responseSchema": { "$ref": "#/schemas/ProductList" },
                "requiredScopes": ["read:products"]
            },
            {
                "id": "place-order",
                "name": "Place order",
                "description": "Buy a product",
                "endpoint": "/api/v1/orders",
                "method": "POST",
                "parameters": [
                    { "name": "product_id", "type": "string", "required": true },
                    { "name": "quantity", "type": "integer", "default": 1, "minimum": 1 }
                ],
                "requiredScopes": ["write:orders"],
                "sideEffects": true,
                "confirmation": { "required": true, "message": "Place this order and charge the card on file?" }
            },
            {
                "id": "check-availability",
                "name": "Check availability",
                "description": "Is a fitting slot free on a date",
                "endpoint": "/api/v1/appointments/availability",
                "method": "GET",
                "parameters": [
                    { "name": "date", "type": "string", "format": "date", "required": true }
                ],
                "requiredScopes": ["read:appointments"]
            },
            {
                "id": "create-appointment",
                "name": "Create appointment",
                "description": "Book a fitting slot",
                "endpoint": "/api/v1/appointments",
                "method": "POST",
                "parameters": [
                    { "name": "slot_id", "type": "string", "required": true },
                    { "name": "date", "type": "string", "format": "date" }
                ],
                "requiredScopes": ["write:appointments"],
                "sideEffects": true
            }
        ],
        "workflows": [
            {
                "id": "book-fitting",
                "name": "Book a fitting",
                "steps": ["check-availability", "create-appointment"],
                "conditional": {
                    "check-availability": {
                        "condition": "available == true",
                        "onTrue": "create-appointment",
                        "onFalse": "$abort"
                    }
                }
            }
        ],
        "schemas": {
            "ProductList": {
                "type": "object",
                "required": ["items"],
                "properties": {
                    "items": { "type": "array" }
                }
            }
        }
    })
}

pub fn manifest() -> Manifest {
    ManifestValidator::new()
        .validate(&manifest_json())
        .expect("fixture manifest is valid")
}

/// Fast retries so failure paths finish quickly.
pub fn config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_max_retries(2)
        .with_retry_delays(Duration::from_millis(5), Duration::from_millis(20))
}

pub fn client(transport: Arc<MockTransport>) -> AgentClient {
    client_with_audit(transport, Arc::new(InMemoryAuditSink::new(100)))
}

pub fn client_with_audit(transport: Arc<MockTransport>, audit: Arc<InMemoryAuditSink>) -> AgentClient {
    AgentClient::builder(HOST)
        .config(config())
        .transport(transport)
        .audit_sink(audit)
        .from_manifest(manifest())
        .expect("client builds")
}

pub fn session<const N: usize>(scopes: [&str; N]) -> Session {
    Session::new(HOST, SchemeKind::OAuth2ClientCredentials, "access-1", scopes)
}
