//! Generic forwarding endpoint.
//!
//! `POST /request` replays a caller-described HTTP call through the live
//! session, so callers get the session's cookies and headers without ever
//! holding credentials. Upstream replies are returned as-is.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use klaviyo_relay_auth::LiveSession;

use crate::error::{Result, ServerError};
use crate::state::AppState;

/// Field name used for the file part when none is given.
pub const DEFAULT_FILE_FIELD: &str = "file";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Caller headers never forwarded upstream.
const STRIPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

// ─────────────────────────────────────────────────────────────────────────────
// Request types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `POST /request`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    /// HTTP method, GET when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Absolute URL, or a path resolved against the session's base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Headers layered over the session defaults.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// Query parameters appended to the URL.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Request body, or extra multipart fields when `is_form_data` is set.
    #[serde(default)]
    pub data: Option<Value>,
    /// Timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub is_form_data: bool,
    #[serde(default)]
    pub file_data: Option<FileData>,
}

/// File payload for multipart uploads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    /// Base64-encoded file bytes.
    pub content: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
}

/// Body returned when the upstream could not be reached.
#[derive(Debug, Serialize)]
pub struct TransportFailure {
    pub error: String,
    pub data: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Forward a request through the current session.
pub async fn forward_handler(
    State(state): State<AppState>,
    Json(request): Json<ForwardRequest>,
) -> Result<Response> {
    // One read of the slot per request; a concurrent reload cannot split it.
    let live = state.slot.current()?;

    let url = resolve_url(&live, &request)?;
    let method = parse_method(request.method.as_deref())?;
    let headers = caller_headers(&request.headers)?;

    tracing::debug!(
        method = %method,
        url = %url,
        generation = live.generation(),
        form = request.is_form_data,
        "Forwarding request"
    );

    let mut builder = live.client().request(method.clone(), url.clone());
    if let Some(ms) = request.timeout.filter(|ms| *ms > 0) {
        builder = builder.timeout(Duration::from_millis(ms));
    }

    builder = if request.is_form_data {
        let mut headers = headers;
        headers.remove(reqwest::header::CONTENT_TYPE);
        builder
            .headers(headers)
            .multipart(multipart_form(&request)?)
    } else {
        let urlencoded = is_urlencoded(&headers, live.headers());
        let builder = builder.headers(headers);
        match request.data {
            None | Some(Value::Null) => builder,
            Some(Value::String(raw)) => builder.body(raw),
            Some(ref value) if urlencoded => builder.body(urlencode(value)?),
            Some(ref value) => builder.json(value),
        }
    };

    match builder.send().await {
        Ok(upstream) => Ok(pass_through(upstream).await),
        Err(e) => {
            tracing::error!(
                method = %method,
                url = %url,
                error = %e,
                "Forwarded request failed"
            );
            let status = e
                .status()
                .and_then(|s| StatusCode::from_u16(s.as_u16()).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = TransportFailure {
                error: e.to_string(),
                data: None,
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

/// Copy upstream status, content type and body into an axum response.
async fn pass_through(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok());

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            let body = TransportFailure {
                error: format!("Failed to read upstream body: {}", e),
                data: None,
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_url(live: &LiveSession, request: &ForwardRequest) -> Result<Url> {
    let raw = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ServerError::BadRequest("url is required".to_string()))?;

    let absolute = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!(
            "{}/{}",
            live.base_url().trim_end_matches('/'),
            raw.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&absolute)
        .map_err(|e| ServerError::BadRequest(format!("Invalid url '{}': {}", raw, e)))?;

    if !request.params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.params {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        pairs.append_pair(key, &scalar_string(item));
                    }
                }
                other => {
                    pairs.append_pair(key, &scalar_string(other));
                }
            }
        }
    }

    Ok(url)
}

fn parse_method(method: Option<&str>) -> Result<reqwest::Method> {
    let method = method.unwrap_or("GET").trim().to_ascii_uppercase();
    reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ServerError::BadRequest(format!("Invalid method '{}'", method)))
}

fn caller_headers(raw: &BTreeMap<String, Value>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        if value.is_null() || STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ServerError::BadRequest(format!("Invalid header name '{}'", name)))?;
        let value = reqwest::header::HeaderValue::from_str(&scalar_string(value))
            .map_err(|_| ServerError::BadRequest(format!("Invalid value for header '{}'", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Whether the effective content type (caller over session) is urlencoded.
fn is_urlencoded(caller: &HeaderMap, session: &HeaderMap) -> bool {
    caller
        .get(reqwest::header::CONTENT_TYPE)
        .or_else(|| session.get(reqwest::header::CONTENT_TYPE))
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(FORM_URLENCODED))
}

fn urlencode(value: &Value) -> Result<String> {
    let Value::Object(map) = value else {
        return Err(ServerError::BadRequest(
            "urlencoded data must be an object".to_string(),
        ));
    };

    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in map {
        if !value.is_null() {
            form.append_pair(key, &scalar_string(value));
        }
    }
    Ok(form.finish())
}

fn multipart_form(request: &ForwardRequest) -> Result<Form> {
    let mut form = Form::new();

    match &request.data {
        None | Some(Value::Null) => {}
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                if !value.is_null() {
                    form = form.text(key.clone(), scalar_string(value));
                }
            }
        }
        Some(_) => {
            return Err(ServerError::BadRequest(
                "multipart data must be an object".to_string(),
            ));
        }
    }

    if let Some(file) = &request.file_data {
        let bytes = BASE64
            .decode(file.content.trim())
            .map_err(|e| ServerError::BadRequest(format!("fileData.content is not base64: {}", e)))?;
        let mut part = Part::bytes(bytes).file_name(file.filename.clone());
        if let Some(content_type) = &file.content_type {
            part = part.mime_str(content_type).map_err(|_| {
                ServerError::BadRequest(format!("Invalid content type '{}'", content_type))
            })?;
        }
        let field = file
            .field_name
            .clone()
            .unwrap_or_else(|| DEFAULT_FILE_FIELD.to_string());
        form = form.part(field, part);
    }

    Ok(form)
}

/// Strings pass through unquoted; everything else is rendered as JSON.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
