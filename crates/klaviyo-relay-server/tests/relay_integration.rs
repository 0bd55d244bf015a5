//! End-to-end tests of the relay against a stubbed upstream.

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{
    body_json, body_string, body_string_contains, header, header_regex, method, path,
};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::{MARKER_HEADER, TestServer};

/// Echoes the session-derived headers back as JSON.
struct EchoSession;

impl Respond for EchoSession {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let get = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "cookie": get("cookie"),
            "csrf": get("x-csrftoken"),
            "marker": get(MARKER_HEADER),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NOT_LOADED gating
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_not_loaded_gates_forward_and_health() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), None).await.unwrap();

    let status: Value = server.get("/status").send().await.unwrap().json().await.unwrap();
    assert_eq!(status["status"], "NOT_LOADED");

    let resp = server.forward(json!({"url": "/anything"})).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_LOADED");

    let resp = server.get("/health").send().await.unwrap();
    assert_eq!(resp.status(), 503);
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forward_passes_upstream_reply_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teapot"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"x":1}"#),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({"method": "GET", "url": "/teapot"}))
        .await
        .unwrap();
    assert_eq!(resp.status(), 418);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(resp.text().await.unwrap(), r#"{"x":1}"#);
}

#[tokio::test]
async fn test_forward_sends_session_cookie_and_csrf() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ajax/flows"))
        .and(header("cookie", "kl_csrftoken=abc"))
        .and(header("x-csrftoken", "abc"))
        .and(header("x-custom", "1"))
        .and(body_json(json!({"name": "Welcome"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "F1"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({
            "method": "post",
            "url": "/ajax/flows",
            "headers": {"X-Custom": "1"},
            "data": {"name": "Welcome"}
        }))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "F1");
}

#[tokio::test]
async fn test_forward_caller_header_overrides_session_default() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/who"))
        .and(header(MARKER_HEADER, "override"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({"url": "/who", "headers": {"x-relay-test": "override"}}))
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_forward_urlencoded_form() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/form"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("a=1&b=x+y"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({
            "method": "POST",
            "url": "/form",
            "headers": {"Content-Type": "application/x-www-form-urlencoded"},
            "data": {"a": 1, "b": "x y"}
        }))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_forward_urlencoded_array_is_bad_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({
            "method": "POST",
            "url": "/form",
            "headers": {"Content-Type": "application/x-www-form-urlencoded"},
            "data": [1, 2, 3]
        }))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_forward_multipart_upload() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ajax/images"))
        .and(header_regex("content-type", "^multipart/form-data; boundary="))
        .and(body_string_contains(r#"name="image"; filename="logo.txt""#))
        .and(body_string_contains("hello world"))
        .and(body_string_contains(r#"name="alt""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({
            "method": "POST",
            "url": "/ajax/images",
            "headers": {"Content-Type": "application/json"},
            "isFormData": true,
            "data": {"alt": "Logo"},
            "fileData": {
                "content": "aGVsbG8gd29ybGQ=",
                "filename": "logo.txt",
                "contentType": "text/plain",
                "fieldName": "image"
            }
        }))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_forward_missing_url_is_bad_request() {
    let upstream = MockServer::start().await;
    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server.forward(json!({"method": "GET"})).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_forward_transport_failure() {
    let upstream = MockServer::start().await;
    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let unreachable = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let resp = server
        .forward(json!({"url": format!("http://{}/x", unreachable), "timeout": 2000}))
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn test_forward_honors_caller_timeout() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server
        .forward(json!({"url": "/slow", "timeout": 100}))
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_account() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ajax/authorization"))
        .and(header("cookie", "kl_csrftoken=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authentication_status": "fully-authenticated",
            "email": "ops@example.com"
        })))
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server.get("/health").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["account"]["email"], "ops@example.com");
}

#[tokio::test]
async fn test_health_unauthorized() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ajax/authorization"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server.get("/health").send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["httpStatus"], 403);
}

#[tokio::test]
async fn test_health_partial_authentication_is_unauthorized() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ajax/authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authentication_status": "mfa-required"
        })))
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server.get("/health").send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "unauthorized");
    assert_eq!(body["authenticationStatus"], "mfa-required");
}

#[tokio::test]
async fn test_health_upstream_outage_is_server_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ajax/authorization"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();

    let resp = server.get("/health").send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "upstream_error");
    assert_eq!(body["httpStatus"], 503);
}

// ─────────────────────────────────────────────────────────────────────────────
// Reload and save
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reload_picks_up_new_store() {
    let upstream = MockServer::start().await;
    let server = TestServer::start(&upstream.uri(), Some("one")).await.unwrap();

    let before: Value = server.get("/status").send().await.unwrap().json().await.unwrap();
    assert_eq!(before["status"], "READY");

    server.write_store("two").unwrap();
    let resp = server.post("/reload").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "READY");
    assert!(body["lastLoaded"].is_string());

    let after: Value = server.get("/status").send().await.unwrap().json().await.unwrap();
    assert!(after["generation"].as_u64() > before["generation"].as_u64());
    assert_eq!(
        server.slot.current().unwrap().csrf_token().as_deref(),
        Some("two")
    );
}

#[tokio::test]
async fn test_reload_of_corrupt_store_clears_session() {
    let upstream = MockServer::start().await;
    let server = TestServer::start(&upstream.uri(), Some("one")).await.unwrap();

    std::fs::write(server.store.path(), "not json").unwrap();
    let resp = server.post("/reload").send().await.unwrap();
    assert_eq!(resp.status(), 500);

    let status: Value = server.get("/status").send().await.unwrap().json().await.unwrap();
    assert_eq!(status["status"], "NOT_LOADED");
    assert!(status["lastError"].is_string());

    let resp = server.forward(json!({"url": "/x"})).await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_save_writes_store() {
    let upstream = MockServer::start().await;
    let server = TestServer::start(&upstream.uri(), Some("abc")).await.unwrap();
    std::fs::remove_file(server.store.path()).unwrap();

    let resp = server.post("/save").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cookies"], 1);
    assert!(body["savedAt"].is_string());

    let saved = server.store.load().unwrap();
    assert_eq!(saved.cookies[0].value, "abc");
    assert!(!server.slot.changed());
}

// ─────────────────────────────────────────────────────────────────────────────
// Swap consistency
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards racing reloads each see one whole session: the cookie, the
/// derived csrf header and the stored marker header always agree.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_forwards_see_whole_sessions() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/echo"))
        .respond_with(EchoSession)
        .mount(&upstream)
        .await;

    let server = TestServer::start(&upstream.uri(), Some("v0")).await.unwrap();
    let base = server.base_url();

    let mut callers = Vec::new();
    for _ in 0..8 {
        let client = server.client.clone();
        let url = format!("{}/request", base);
        callers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..10 {
                let echo: Value = client
                    .post(&url)
                    .json(&json!({"url": "/echo"}))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                seen.push(echo);
            }
            seen
        }));
    }

    for generation in 1..=10 {
        server.write_store(&format!("v{}", generation)).unwrap();
        let resp = server.post("/reload").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for caller in callers {
        for echo in caller.await.unwrap() {
            let marker = echo["marker"].as_str().unwrap();
            assert_eq!(echo["csrf"].as_str(), Some(marker));
            assert_eq!(
                echo["cookie"].as_str(),
                Some(format!("kl_csrftoken={}", marker).as_str())
            );
        }
    }
}
