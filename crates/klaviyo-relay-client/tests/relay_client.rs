//! Client behaviour against a stubbed relay.

use serde_json::{Value, json};
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use klaviyo_relay_client::{
    Error, ForwardRequest, InvitationEvent, RelayClient, accept_invitation,
};

fn client(server: &MockServer) -> RelayClient {
    RelayClient::builder().base_url(server.uri()).build().unwrap()
}

#[tokio::test]
async fn test_forward_returns_upstream_error_as_data() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .and(body_json(json!({"method": "GET", "url": "/teapot"})))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"x":1}"#),
        )
        .expect(1)
        .mount(&relay)
        .await;

    let response = client(&relay)
        .forward(&ForwardRequest::get("/teapot"))
        .await
        .unwrap();

    assert_eq!(response.status, 418);
    assert!(!response.is_success());
    assert_eq!(response.content_type(), Some("application/json"));
    assert_eq!(response.json::<Value>().unwrap(), json!({"x": 1}));
    assert!(response.transport_error().is_none());
}

#[tokio::test]
async fn test_forward_not_loaded_is_error() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "code": "NOT_LOADED",
            "message": "No session loaded"
        })))
        .mount(&relay)
        .await;

    let err = client(&relay)
        .forward(&ForwardRequest::get("/x"))
        .await
        .unwrap_err();
    assert!(err.is_not_loaded());
}

#[tokio::test]
async fn test_forward_upstream_503_is_data() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&relay)
        .await;

    let response = client(&relay)
        .forward(&ForwardRequest::get("/x"))
        .await
        .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.text(), "maintenance");
}

#[tokio::test]
async fn test_status_and_admin_calls() {
    let relay = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "READY",
            "lastLoaded": "2026-01-01T00:00:00Z",
            "lastFileModified": "2026-01-01T00:00:00Z",
            "generation": 3,
            "lastError": null
        })))
        .mount(&relay)
        .await;
    Mock::given(method("POST"))
        .and(path("/reload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "READY",
            "lastLoaded": "2026-01-01T00:00:01Z"
        })))
        .mount(&relay)
        .await;
    Mock::given(method("POST"))
        .and(path("/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "savedAt": "2026-01-01T00:00:02Z",
            "cookies": 7
        })))
        .mount(&relay)
        .await;

    let client = client(&relay);
    let status = client.status().await.unwrap();
    assert!(status.is_ready());
    assert_eq!(status.generation, Some(3));

    assert_eq!(client.reload().await.unwrap().status, "READY");
    assert_eq!(client.save().await.unwrap().cookies, 7);
}

#[tokio::test]
async fn test_reload_failure_is_api_error() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/reload"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "code": "reload_failed",
            "message": "Reload failed: bad json"
        })))
        .mount(&relay)
        .await;

    let err = client(&relay).reload().await.unwrap_err();
    assert!(err.is_server_error());
    assert!(matches!(err, Error::Api { ref code, .. } if code == "reload_failed"));
}

#[tokio::test]
async fn test_health_unauthorized_is_report() {
    let relay = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "status": "unauthorized",
            "httpStatus": 403
        })))
        .mount(&relay)
        .await;

    let report = client(&relay).health().await.unwrap();
    assert!(!report.is_authorized());
    assert_eq!(report.http_status, Some(403));
}

#[tokio::test]
async fn test_accept_invitation_follows_link() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .and(body_partial_json(json!({
            "method": "GET",
            "url": "https://www.klaviyo.com/account/invitation/accept?token=t1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(&relay)
        .await;

    let event = InvitationEvent::from_message(
        "noreply@klaviyo.com",
        "You've been invited to join Acme on Klaviyo",
        "Accept: https://www.klaviyo.com/account/invitation/accept?token=t1",
        "ops@example.com",
    )
    .unwrap();

    let outcome = accept_invitation(&client(&relay), &event).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.brand.as_deref(), Some("Acme"));
    assert_eq!(outcome.status, 200);
}
