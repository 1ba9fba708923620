mod common;

use atp_runtime::audit::InMemoryAuditSink;
use atp_runtime::auth::AuthError;
use atp_runtime::client::{BatchCall, InvocationError, ParameterError};
use atp_runtime::protocol::{Deprecation, HttpMethod};
use atp_runtime::transport::TransportResponse;
use atp_runtime::{Acknowledgment, AgentClient, Error, InvokeOptions, Outcome};
use common::{json_response, token_response, with_header, MockTransport, Reply};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SEARCH: &str = "/api/v1/products/search";
const ORDERS: &str = "/api/v1/orders";

fn products() -> TransportResponse {
    json_response(200, json!({"items": [{"sku": "WH-1000", "price": 89.0}]}))
}

#[tokio::test]
async fn search_products_end_to_end() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]);

    let result = client
        .invoke(
            "search-products",
            json!({"q": "wireless headphones", "price_max": 100}),
            &session,
            InvokeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.body, json!({"items": [{"sku": "WH-1000", "price": 89.0}]}));
    assert_eq!(result.attempts, 1);
    assert!(result.diagnostics.is_empty());

    assert_eq!(transport.calls(), 1);
    let request = &transport.requests()[0];
    assert_eq!(request.method, HttpMethod::Get);
    assert_eq!(request.url, "https://shop.example/api/v1/products/search");
    assert_eq!(request.query_param("q"), Some("wireless headphones"));
    assert_eq!(request.query_param("price_max"), Some("100"));
    assert_eq!(request.header("Authorization"), Some("Bearer access-1"));
    assert_eq!(request.header("X-ATP-Version"), Some("1.0"));
    assert_eq!(request.header("X-Request-Id"), Some(result.request_id.as_str()));
    assert!(request.header("User-Agent").unwrap().starts_with("atp-runtime/"));
}

#[derive(Clone, Default)]
struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn default_client_audits_through_tracing() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    let client = AgentClient::builder(common::HOST)
        .config(common::config())
        .transport(transport)
        .from_manifest(common::manifest())
        .unwrap();
    client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap();

    let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    let line = output
        .lines()
        .find(|l| l.contains("atp::audit"))
        .unwrap_or_else(|| panic!("no audit event in:\n{}", output));
    assert!(line.contains("search-products"));
    assert!(line.contains("success"));
}

#[tokio::test]
async fn missing_scope_never_reaches_the_host() {
    let transport = MockTransport::new();
    let audit = Arc::new(InMemoryAuditSink::new(10));
    let client = common::client_with_audit(transport.clone(), audit.clone());

    let err = client
        .invoke(
            "search-products",
            json!({"q": "headphones"}),
            &common::session(["write:orders"]),
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        Error::Scope(e) => assert_eq!(e.missing, vec!["read:products"]),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(transport.calls(), 0);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::ScopeDenied);
    assert_eq!(records[0].attempts, 0);
}

#[tokio::test]
async fn bad_arguments_are_rejected_locally() {
    let transport = MockTransport::new();
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]);

    let missing = client
        .invoke("search-products", json!({"price_max": 10}), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::Parameter(ParameterError::Missing { .. })));

    let negative = client
        .invoke(
            "search-products",
            json!({"q": "x", "price_max": -1}),
            &session,
            InvokeOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(negative, Error::Parameter(ParameterError::Bounds { .. })));

    let unknown = client
        .invoke("search-products", json!({"q": "x", "colour": "red"}), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(unknown, Error::Parameter(ParameterError::Unknown { .. })));

    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn path_arguments_cannot_leave_the_endpoint() {
    let transport = MockTransport::new();
    let client = common::client(transport.clone());
    let mut manifest = common::manifest();
    manifest.capabilities.push(
        serde_json::from_value(json!({
            "id": "product-reviews",
            "name": "Product reviews",
            "description": "Reviews for one product",
            "endpoint": "/api/v1/products/{id}/reviews",
            "method": "GET",
            "parameters": [{ "name": "id", "type": "string", "required": true }],
            "requiredScopes": ["read:products"]
        }))
        .unwrap(),
    );
    client.reload_manifest(manifest).unwrap();
    let session = common::session(["read:products"]);

    let err = client
        .invoke("product-reviews", json!({"id": ".."}), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parameter(ParameterError::PathSegment { .. })));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn unknown_capability_is_reported() {
    let client = common::client(MockTransport::new());
    let err = client
        .invoke("refund-order", json!({}), &common::session([]), InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invocation(InvocationError::UnknownCapability { ref id }) if id == "refund-order"));
}

#[tokio::test]
async fn gated_capability_needs_a_fresh_acknowledgment() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Post, ORDERS, json_response(201, json!({"order_id": "o-1"})));
    let client = common::client(transport.clone());
    let session = common::session(["write:orders"]);
    let args = json!({"product_id": "WH-1000"});

    let err = client
        .invoke("place-order", args.clone(), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::ConfirmationRequired(e) => {
            assert_eq!(e.message, "Place this order and charge the card on file?")
        }
        other => panic!("unexpected error: {}", other),
    }

    let wrong = InvokeOptions::new().acknowledge(Acknowledgment::new("place-order", "ok?"));
    let err = client.invoke("place-order", args.clone(), &session, wrong).await.unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired(_)));
    assert_eq!(transport.calls(), 0);

    let manifest = client.manifest();
    let cap = manifest.capability("place-order").unwrap();
    let result = client
        .invoke(
            "place-order",
            args,
            &session,
            InvokeOptions::new().acknowledge(Acknowledgment::presented(cap)),
        )
        .await
        .unwrap();
    assert_eq!(result.status, 201);

    let request = &transport.requests_to(ORDERS)[0];
    assert_eq!(request.json_body(), Some(&json!({"product_id": "WH-1000", "quantity": 1})));
}

#[tokio::test(start_paused = true)]
async fn throttled_host_is_respected_for_retry_after() {
    let transport = MockTransport::new();
    transport
        .respond(
            HttpMethod::Get,
            SEARCH,
            json_response(
                429,
                json!({"error": {"code": "rate_limited", "message": "slow down", "retryAfter": 5}}),
            ),
        )
        .respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]);
    let args = json!({"q": "headphones"});

    let err = client
        .invoke("search-products", args.clone(), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::RateLimited(e) => assert_eq!(e.retry_after, Duration::from_secs(5)),
        other => panic!("unexpected error: {}", other),
    }

    tokio::time::advance(Duration::from_millis(4_900)).await;
    let err = client
        .invoke("search-products", args.clone(), &session, InvokeOptions::new().fail_fast())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)));
    assert_eq!(transport.calls(), 1);

    // A waiting caller is held until the window reopens.
    let started = Instant::now();
    client
        .invoke("search-products", args, &session, InvokeOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_blocks_the_next_call() {
    let transport = MockTransport::new();
    transport
        .respond(HttpMethod::Get, SEARCH, with_header(TransportResponse::new(429, ""), "retry-after", "5"))
        .respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]);

    let first = Instant::now();
    let _ = client
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await;
    client
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await
        .unwrap();
    assert!(first.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn oversized_retry_after_is_capped_at_one_day() {
    let transport = MockTransport::new();
    transport.respond(
        HttpMethod::Get,
        SEARCH,
        with_header(TransportResponse::new(429, ""), "retry-after", "1e300"),
    );
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]);

    let err = client
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::new().fail_fast())
        .await
        .unwrap_err();
    match err {
        Error::RateLimited(e) => assert_eq!(e.retry_after, Duration::from_secs(86_400)),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn rejected_credential_is_refreshed_once() {
    let transport = MockTransport::new();
    transport
        .respond(HttpMethod::Get, SEARCH, TransportResponse::new(401, ""))
        .respond(HttpMethod::Get, SEARCH, products())
        .respond(HttpMethod::Post, "/oauth/token", token_response("fresh", None, 3600));
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]).with_refresh_token("rt-1");

    let result = client
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(result.attempts, 2);

    let calls = transport.requests_to(SEARCH);
    assert_eq!(calls[0].header("Authorization"), Some("Bearer access-1"));
    assert_eq!(calls[1].header("Authorization"), Some("Bearer fresh"));
    assert_eq!(transport.calls_to("/oauth/token"), 1);

    // The stale session now picks up the refreshed credential without another exchange.
    client
        .invoke("search-products", json!({"q": "b"}), &session, InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.requests_to(SEARCH)[2].header("Authorization"), Some("Bearer fresh"));
    assert_eq!(transport.calls_to("/oauth/token"), 1);
}

#[tokio::test]
async fn repeated_rejection_is_unauthorized() {
    let transport = MockTransport::new();
    transport
        .respond(
            HttpMethod::Get,
            SEARCH,
            json_response(403, json!({"error": {"code": "forbidden", "message": "no"}})),
        )
        .respond(HttpMethod::Post, "/oauth/token", token_response("fresh", None, 3600));
    let client = common::client(transport.clone());
    let session = common::session(["read:products"]).with_refresh_token("rt-1");

    let err = client
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Auth(AuthError::Unauthorized { status, body }) => {
            assert_eq!(status, 403);
            assert_eq!(body.unwrap().code.as_deref(), Some("forbidden"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(transport.calls_to(SEARCH), 2);
}

#[tokio::test]
async fn rejection_without_refresh_token_is_unrefreshable() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, TransportResponse::new(401, ""));
    let client = common::client(transport.clone());

    let err = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::Unrefreshable { .. })));
    assert!(err.is_terminal());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let transport = MockTransport::new();
    transport
        .respond(HttpMethod::Get, SEARCH, TransportResponse::new(503, ""))
        .on(HttpMethod::Get, SEARCH, Reply::Refused)
        .respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());

    let result = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(result.attempts, 3);
}

#[tokio::test]
async fn persistent_server_error_gives_up() {
    let transport = MockTransport::new();
    transport.respond(
        HttpMethod::Get,
        SEARCH,
        json_response(500, json!({"error": {"code": "internal", "message": "boom"}})),
    );
    let audit = Arc::new(InMemoryAuditSink::new(10));
    let client = common::client_with_audit(transport.clone(), audit.clone());

    let err = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Invocation(InvocationError::Server { status, attempts, body }) => {
            assert_eq!(status, 500);
            assert_eq!(attempts, 3);
            assert_eq!(body.unwrap().message.as_deref(), Some("boom"));
        }
        other => panic!("unexpected error: {}", other),
    }
    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::ServerError);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].http_status, Some(500));
}

#[tokio::test]
async fn client_fault_is_not_retried() {
    let transport = MockTransport::new();
    transport.respond(
        HttpMethod::Get,
        SEARCH,
        json_response(422, json!({"error": {"code": "bad_query", "message": "q too short", "details": {"min": 2}}})),
    );
    let client = common::client(transport.clone());

    let err = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Invocation(InvocationError::ClientFault { status, body }) => {
            assert_eq!(status, 422);
            let body = body.unwrap();
            assert_eq!(body.code.as_deref(), Some("bad_query"));
            assert_eq!(body.details, Some(json!({"min": 2})));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn call_deadline_is_enforced() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    transport.set_latency(Duration::from_millis(500));
    let client = common::client(transport.clone());

    let err = client
        .invoke(
            "search-products",
            json!({"q": "a"}),
            &common::session(["read:products"]),
            InvokeOptions::new().with_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invocation(InvocationError::Timeout { .. })));
}

#[tokio::test]
async fn cancelled_call_is_audited_once() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    let audit = Arc::new(InMemoryAuditSink::new(10));
    let client = common::client_with_audit(transport.clone(), audit.clone());

    let token = CancellationToken::new();
    token.cancel();
    let err = client
        .invoke(
            "search-products",
            json!({"q": "a"}),
            &common::session(["read:products"]),
            InvokeOptions::new().with_cancel(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invocation(InvocationError::Cancelled)));
    assert_eq!(audit.len(), 1);
    assert_eq!(audit.records()[0].outcome, Outcome::Cancelled);
}

#[tokio::test]
async fn dropped_invocation_still_leaves_one_record() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    transport.set_latency(Duration::from_millis(500));
    let audit = Arc::new(InMemoryAuditSink::new(10));
    let client = common::client_with_audit(transport.clone(), audit.clone());
    let session = common::session(["read:products"]);

    let call = client.invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default());
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Cancelled);
    assert_eq!(records[0].attempts, 1);
}

#[tokio::test]
async fn response_schema_mismatch_is_a_diagnostic_unless_strict() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, json_response(200, json!({"products": []})));
    let session = common::session(["read:products"]);

    let lenient = common::client(transport.clone());
    let result = lenient
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await
        .unwrap();
    assert!(result.diagnostics.iter().any(|d| d.starts_with("response schema")));

    let strict = AgentClient::builder(common::HOST)
        .config(common::config())
        .transport(transport.clone())
        .strict_response_schema(true)
        .from_manifest(common::manifest())
        .unwrap();
    let err = strict
        .invoke("search-products", json!({"q": "a"}), &session, InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invocation(InvocationError::ResponseSchema { .. })));
}

#[tokio::test]
async fn non_json_bodies_are_returned_as_text() {
    let transport = MockTransport::new();
    transport
        .respond(HttpMethod::Post, ORDERS, TransportResponse::new(202, "accepted"))
        .respond(HttpMethod::Get, SEARCH, with_header(TransportResponse::new(200, "{oops"), "content-type", "application/json"));
    let client = common::client(transport.clone());
    let manifest = client.manifest();

    let result = client
        .invoke(
            "place-order",
            json!({"product_id": "p"}),
            &common::session(["write:orders"]),
            InvokeOptions::new().acknowledge(Acknowledgment::presented(manifest.capability("place-order").unwrap())),
        )
        .await
        .unwrap();
    assert_eq!(result.body, json!("accepted"));

    let err = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invocation(InvocationError::Malformed { .. })));
}

#[tokio::test]
async fn deprecated_capability_runs_with_a_diagnostic() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());

    let mut manifest = common::manifest();
    manifest.version = "1.3.0".to_string();
    manifest.capabilities[0].deprecated = Some(Deprecation {
        since: Some("1.3.0".to_string()),
        replaced_by: Some("search-catalogue".to_string()),
        message: None,
    });
    client.reload_manifest(manifest).unwrap();
    assert_eq!(client.manifest().version, "1.3.0");

    let result = client
        .invoke("search-products", json!({"q": "a"}), &common::session(["read:products"]), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(
        result.diagnostics,
        vec!["capability 'search-products' is deprecated since 1.3.0; use 'search-catalogue'"]
    );
}

#[tokio::test]
async fn invalid_reload_keeps_the_current_manifest() {
    let client = common::client(MockTransport::new());
    let mut broken = common::manifest();
    broken.capabilities.push(broken.capabilities[0].clone());

    assert!(matches!(client.reload_manifest(broken), Err(Error::Validation(_))));
    assert_eq!(client.manifest().capabilities.len(), 4);
}

#[tokio::test]
async fn required_identity_is_checked_before_dispatch() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, SEARCH, products());
    let client = common::client(transport.clone());

    let mut raw = common::manifest_json();
    raw["auth"]["agentIdentity"] = json!({"required": true, "methods": ["did:web"]});
    let manifest = atp_runtime::ManifestValidator::new().validate(&raw).unwrap();
    client.reload_manifest(manifest).unwrap();

    let anonymous = common::session(["read:products"]);
    let err = client
        .invoke("search-products", json!({"q": "a"}), &anonymous, InvokeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::MissingIdentity { .. })));
    assert_eq!(transport.calls(), 0);

    let identified = anonymous.with_agent_identity("did:web:agent.example");
    client
        .invoke("search-products", json!({"q": "a"}), &identified, InvokeOptions::default())
        .await
        .unwrap();
    let request = &transport.requests()[0];
    assert_eq!(request.header("X-Agent-Identity"), Some("did:web:agent.example"));
}

#[tokio::test]
async fn batch_results_keep_input_order() {
    let transport = MockTransport::new();
    transport
        .respond(HttpMethod::Get, SEARCH, products())
        .respond(HttpMethod::Get, "/api/v1/appointments/availability", json_response(200, json!({"available": true})));
    let client = common::client(transport.clone());
    let session = common::session(["read:products", "read:appointments"]);

    let results = client
        .invoke_batch(
            vec![
                BatchCall::new("check-availability", json!({"date": "2025-03-01"})),
                BatchCall::new("search-products", json!({})),
                BatchCall::new("search-products", json!({"q": "a"})),
            ],
            &session,
        )
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().body, json!({"available": true}));
    assert!(matches!(results[1], Err(Error::Parameter(_))));
    assert_eq!(results[2].as_ref().unwrap().capability_id, "search-products");
    assert_eq!(transport.calls(), 2);
}
