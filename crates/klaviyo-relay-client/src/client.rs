//! Main client implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{Error, ErrorResponse, Result};
use crate::types::{
    ForwardRequest, ForwardResponse, HealthReport, RelayStatus, ReloadResponse, SaveResponse,
};

/// Default timeout for relay management calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for forwarded calls, which include the upstream round trip.
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(120);

/// Relay error code for a missing session.
const NOT_LOADED: &str = "NOT_LOADED";

/// Client for a running relay.
///
/// # Example
///
/// ```no_run
/// use klaviyo_relay_client::{ForwardRequest, RelayClient};
///
/// # async fn example() -> klaviyo_relay_client::Result<()> {
/// let client = RelayClient::builder()
///     .base_url("http://127.0.0.1:3001")
///     .build()?;
///
/// let response = client.forward(&ForwardRequest::get("/ajax/flows")).await?;
/// println!("{} {}", response.status, response.text());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    forward_timeout: Duration,
}

impl RelayClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client for a relay on `127.0.0.1:<port>`.
    pub fn localhost(port: u16) -> Result<Self> {
        Self::builder()
            .base_url(format!("http://127.0.0.1:{}", port))
            .build()
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Endpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Make `request` through the relay's session.
    ///
    /// Upstream non-2xx replies come back as `Ok`; only relay-side failures
    /// are errors.
    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        let url = self.url("request")?;
        let response = self
            .inner
            .http
            .post(url)
            .json(request)
            .timeout(self.inner.forward_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        if status == 503
            && serde_json::from_slice::<ErrorResponse>(&body).is_ok_and(|e| e.code == NOT_LOADED)
        {
            return Err(Error::NotLoaded);
        }

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status,
            bytes = body.len(),
            "Forwarded"
        );

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }

    /// Load state of the relay.
    pub async fn status(&self) -> Result<RelayStatus> {
        let response = self
            .inner
            .http
            .get(self.url("status")?)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Live authorization check. A 401 is reported, not raised.
    pub async fn health(&self) -> Result<HealthReport> {
        let response = self
            .inner
            .http
            .get(self.url("health")?)
            .timeout(self.inner.timeout)
            .send()
            .await?;

        if response.status().as_u16() == 401 {
            return Ok(response.json().await?);
        }
        self.handle_response(response).await
    }

    /// Ask the relay to re-read the Credential Store.
    pub async fn reload(&self) -> Result<ReloadResponse> {
        let response = self
            .inner
            .http
            .post(self.url("reload")?)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Ask the relay to write its live session to disk.
    pub async fn save(&self) -> Result<SaveResponse> {
        let response = self
            .inner
            .http
            .post(self.url("save")?)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        self.handle_response(response).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url> {
        self.inner
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(Error::from)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    async fn extract_error(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();

        match response.json::<ErrorResponse>().await {
            Ok(err) if err.code == NOT_LOADED => Error::NotLoaded,
            Ok(err) => Error::Api {
                status,
                code: err.code,
                message: err.message,
            },
            Err(_) => Error::Api {
                status,
                code: "unknown".to_string(),
                message: format!("HTTP {}", status),
            },
        }
    }
}

/// Builder for [`RelayClient`].
#[derive(Debug)]
pub struct ClientBuilder {
    base_url: Option<String>,
    timeout: Duration,
    forward_timeout: Duration,
    user_agent: Option<String>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            user_agent: None,
        }
    }

    /// Set the relay's base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Timeout for status, health, reload and save.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Timeout for forwarded calls.
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn build(self) -> Result<RelayClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::Config("base_url is required".to_string()))?;

        let mut base_url = Url::parse(&base_url)?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("klaviyo-relay-client/{}", env!("CARGO_PKG_VERSION")));

        let http = reqwest::Client::builder().user_agent(user_agent).build()?;

        Ok(RelayClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                timeout: self.timeout,
                forward_timeout: self.forward_timeout,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
