//! Status and health endpoints.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::Value;

use klaviyo_relay_auth::check_authorization;

use crate::error::{Result, ServerError};
use crate::state::{AppState, SlotStatus};

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_status: Option<String>,
}

/// Load state of the session slot. Never touches the network.
pub async fn status_handler(State(state): State<AppState>) -> Json<SlotStatus> {
    Json(state.slot.status())
}

/// Live authorization check with the current session.
pub async fn health_handler(State(state): State<AppState>) -> Result<Response> {
    let live = state.slot.current()?;

    let auth = check_authorization(
        &live,
        &state.config.authorization_url,
        state.config.health_timeout,
    )
    .await
    .map_err(ServerError::from)?;

    if auth.is_fully_authenticated() {
        let body = HealthResponse {
            status: "ok",
            account: Some(auth.account),
            http_status: None,
            authentication_status: None,
        };
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    // Only an explicit refusal or a well-formed "not authenticated" reply
    // says anything about the session; other statuses are upstream trouble.
    let answered = (200..300).contains(&auth.http_status);
    if !auth.is_rejected() && !answered {
        tracing::error!(
            http_status = auth.http_status,
            "Authorization check failed upstream"
        );
        let body = HealthResponse {
            status: "upstream_error",
            account: None,
            http_status: Some(auth.http_status),
            authentication_status: auth.authentication_status,
        };
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response());
    }

    tracing::warn!(
        http_status = auth.http_status,
        authentication_status = ?auth.authentication_status,
        "Session not authorized upstream"
    );

    let body = HealthResponse {
        status: "unauthorized",
        account: None,
        http_status: Some(auth.http_status),
        authentication_status: auth.authentication_status,
    };
    Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response())
}

/// Create status and health routes.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
}
