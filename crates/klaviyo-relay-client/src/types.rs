//! Request and response types for the relay API.
//!
//! These types mirror the relay's wire contract.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

/// A call to make through the relay's session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub method: String,
    /// Absolute URL, or a path resolved against the session's base URL.
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_form_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
}

/// File attached to a multipart forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    /// Base64-encoded contents.
    pub content: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
}

impl ForwardRequest {
    /// A request with an arbitrary method.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// POST with a JSON body.
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        let mut request = Self::new("POST", url);
        request.data = Some(body);
        request
    }

    /// POST with an urlencoded form built from `fields`.
    pub fn post_form<K, V>(url: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let form: serde_json::Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();

        let mut request = Self::new("POST", url).header(
            "Content-Type",
            "application/x-www-form-urlencoded",
        );
        request.data = Some(Value::Object(form));
        request
    }

    /// Turn this into a multipart upload carrying `bytes`.
    ///
    /// Any object in `data` becomes extra form fields.
    pub fn with_file(
        mut self,
        field_name: impl Into<String>,
        filename: impl Into<String>,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Self {
        self.is_form_data = true;
        self.file_data = Some(FileData {
            content: BASE64.encode(bytes),
            filename: filename.into(),
            content_type: content_type.map(str::to_string),
            field_name: Some(field_name.into()),
        });
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }
}

/// Upstream reply as relayed. Non-2xx statuses are data, not errors.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ForwardResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Body as UTF-8, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The relay's message when the upstream could not be reached at all.
    pub fn transport_error(&self) -> Option<String> {
        if self.status != 500 {
            return None;
        }
        let value: Value = serde_json::from_slice(&self.body).ok()?;
        let object = value.as_object()?;
        if object.len() != 2 || !object.get("data")?.is_null() {
            return None;
        }
        object.get("error")?.as_str().map(str::to_string)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay management
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /status` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub status: String,
    #[serde(default)]
    pub last_loaded: Option<String>,
    #[serde(default)]
    pub last_file_modified: Option<String>,
    #[serde(default)]
    pub generation: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RelayStatus {
    pub fn is_ready(&self) -> bool {
        self.status == "READY"
    }
}

/// Outcome of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub account: Option<Value>,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub authentication_status: Option<String>,
}

impl HealthReport {
    pub fn is_authorized(&self) -> bool {
        self.status == "ok"
    }
}

/// `POST /reload` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub status: String,
    pub last_loaded: String,
}

/// `POST /save` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub saved_at: String,
    pub cookies: usize,
}
