use atp_runtime::protocol::HttpMethod;
use atp_runtime::transport::{HttpTransport, PreparedRequest, RequestBody, Transport};
use atp_runtime::RuntimeConfig;
use mockito::{Matcher, Server};
use serde_json::json;

fn transport() -> HttpTransport {
    HttpTransport::new(&RuntimeConfig::new()).unwrap()
}

#[tokio::test]
async fn get_carries_query_and_headers() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/products/search")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("q".into(), "wireless headphones".into()),
            Matcher::UrlEncoded("price_max".into(), "100".into()),
        ]))
        .match_header("authorization", "Bearer t-1")
        .match_header("x-atp-version", "1.0")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-ratelimit-remaining", "41")
        .with_body(r#"{"items":[]}"#)
        .create_async()
        .await;

    let mut request = PreparedRequest::get(format!("{}/api/v1/products/search", server.url()))
        .with_header("Authorization", "Bearer t-1")
        .with_header("X-ATP-Version", "1.0");
    request.query = vec![
        ("q".to_string(), "wireless headphones".to_string()),
        ("price_max".to_string(), "100".to_string()),
    ];

    let response = transport().send(request).await.unwrap();
    mock.assert_async().await;
    assert!(response.is_success());
    assert_eq!(response.header("x-ratelimit-remaining"), Some("41"));
    assert_eq!(response.json(), Some(json!({"items": []})));
}

#[tokio::test]
async fn json_body_is_sent_for_post() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/orders")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"product_id": "p-1", "quantity": 2})))
        .with_status(201)
        .with_body(r#"{"order_id":"o-1"}"#)
        .create_async()
        .await;

    let mut request = PreparedRequest::new(HttpMethod::Post, format!("{}/api/v1/orders", server.url()));
    request.body = Some(RequestBody::Json(json!({"product_id": "p-1", "quantity": 2})));

    let response = transport().send(request).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.status, 201);
}

#[tokio::test]
async fn form_body_is_url_encoded() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
            Matcher::UrlEncoded("scope".into(), "read:products write:orders".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"t"}"#)
        .create_async()
        .await;

    let request = PreparedRequest::new(HttpMethod::Post, format!("{}/oauth/token", server.url())).with_form(vec![
        ("grant_type".to_string(), "client_credentials".to_string()),
        ("scope".to_string(), "read:products write:orders".to_string()),
    ]);

    let response = transport().send(request).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn error_statuses_are_responses_not_errors() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/missing")
        .with_status(404)
        .create_async()
        .await;

    let response = transport()
        .send(PreparedRequest::get(format!("{}/missing", server.url())))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert!(response.json().is_none());
}

#[tokio::test]
async fn unreachable_host_is_transient() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("http://{}/gone", addr);

    let err = transport().send(PreparedRequest::get(url)).await.unwrap_err();
    assert!(err.is_transient(), "{}", err);
}
