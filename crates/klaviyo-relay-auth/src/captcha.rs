//! reCAPTCHA solving through third-party provider APIs.
//!
//! Both providers follow the same submit-then-poll protocol: create a job,
//! then poll its result at a fixed interval until a token is ready, the
//! provider reports an error, or the wait budget runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use klaviyo_relay_config::{CaptchaConfig, CaptchaProvider};

use crate::error::{AuthError, Result};

/// The challenge to solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaRequest {
    /// URL of the page showing the challenge.
    pub page_url: String,
    /// reCAPTCHA site key embedded in that page.
    pub site_key: String,
}

/// A service that turns a challenge into a response token.
#[async_trait]
pub trait CaptchaSolver: Send + Sync + std::fmt::Debug {
    /// Solve the challenge and return the `g-recaptcha-response` token.
    async fn solve(&self, request: &CaptchaRequest) -> Result<String>;

    /// Provider name for logs.
    fn name(&self) -> &'static str;
}

/// Shared solver for use across async contexts.
pub type SharedCaptchaSolver = Arc<dyn CaptchaSolver>;

/// Polling cadence and overall wait budget.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollSettings {
    pub fn from_config(config: &CaptchaConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
        }
    }
}

/// Build the solver selected in `config`.
pub fn build_solver(config: &CaptchaConfig, api_key: String) -> Result<SharedCaptchaSolver> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {}", e)))?;
    let base_url = config.effective_base_url();
    let poll = PollSettings::from_config(config);

    let solver: SharedCaptchaSolver = match config.provider {
        CaptchaProvider::TwoCaptcha => {
            Arc::new(TwoCaptchaSolver::new(http, base_url, api_key, poll))
        }
        CaptchaProvider::Capsolver => {
            Arc::new(CapSolverSolver::new(http, base_url, api_key, poll))
        }
    };
    tracing::debug!(provider = solver.name(), "CAPTCHA solver configured");
    Ok(solver)
}

fn failed(provider: &str, message: impl std::fmt::Display) -> AuthError {
    AuthError::CaptchaSolveFailed(format!("{}: {}", provider, message))
}

// ============================================================================
// 2Captcha
// ============================================================================

const TWOCAPTCHA_NOT_READY: &str = "CAPCHA_NOT_READY";

/// 2Captcha `in.php` / `res.php` client.
#[derive(Debug, Clone)]
pub struct TwoCaptchaSolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll: PollSettings,
}

#[derive(Debug, Deserialize)]
struct TwoCaptchaReply {
    status: i64,
    request: String,
}

impl TwoCaptchaSolver {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        poll: PollSettings,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            poll,
        }
    }

    async fn submit(&self, request: &CaptchaRequest) -> Result<String> {
        let reply: TwoCaptchaReply = self
            .http
            .post(format!("{}/in.php", self.base_url))
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "userrecaptcha"),
                ("googlekey", request.site_key.as_str()),
                ("pageurl", request.page_url.as_str()),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| failed(self.name(), e))?
            .json()
            .await
            .map_err(|e| failed(self.name(), e))?;

        if reply.status != 1 {
            return Err(failed(self.name(), reply.request));
        }
        Ok(reply.request)
    }

    async fn poll_once(&self, job_id: &str) -> Result<Option<String>> {
        let reply: TwoCaptchaReply = self
            .http
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", job_id),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| failed(self.name(), e))?
            .json()
            .await
            .map_err(|e| failed(self.name(), e))?;

        if reply.status == 1 {
            return Ok(Some(reply.request));
        }
        if reply.request == TWOCAPTCHA_NOT_READY {
            return Ok(None);
        }
        Err(failed(self.name(), reply.request))
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    async fn solve(&self, request: &CaptchaRequest) -> Result<String> {
        let job_id = self.submit(request).await?;
        tracing::debug!(provider = self.name(), job_id = %job_id, "CAPTCHA job submitted");

        let deadline = Instant::now() + self.poll.max_wait;
        loop {
            tokio::time::sleep(self.poll.interval).await;
            if let Some(token) = self.poll_once(&job_id).await? {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(failed(
                    self.name(),
                    format!("no solution within {}s", self.poll.max_wait.as_secs()),
                ));
            }
        }
    }

    fn name(&self) -> &'static str {
        "2captcha"
    }
}

// ============================================================================
// CapSolver
// ============================================================================

/// CapSolver `createTask` / `getTaskResult` client.
#[derive(Debug, Clone)]
pub struct CapSolverSolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll: PollSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapSolverReply {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<CapSolverSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapSolverSolution {
    g_recaptcha_response: String,
}

impl CapSolverReply {
    fn error_message(&self) -> String {
        match (&self.error_code, &self.error_description) {
            (Some(code), Some(desc)) => format!("{} ({})", code, desc),
            (Some(code), None) => code.clone(),
            (None, Some(desc)) => desc.clone(),
            (None, None) => format!("errorId {}", self.error_id),
        }
    }
}

impl CapSolverSolver {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        poll: PollSettings,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            poll,
        }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<CapSolverReply> {
        let reply: CapSolverReply = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(self.name(), e))?
            .json()
            .await
            .map_err(|e| failed(self.name(), e))?;

        if reply.error_id != 0 {
            return Err(failed(self.name(), reply.error_message()));
        }
        Ok(reply)
    }
}

#[async_trait]
impl CaptchaSolver for CapSolverSolver {
    async fn solve(&self, request: &CaptchaRequest) -> Result<String> {
        let created = self
            .call(
                "createTask",
                json!({
                    "clientKey": self.api_key,
                    "task": {
                        "type": "ReCaptchaV2TaskProxyLess",
                        "websiteURL": request.page_url,
                        "websiteKey": request.site_key,
                    }
                }),
            )
            .await?;
        let task_id = created
            .task_id
            .ok_or_else(|| failed(self.name(), "createTask returned no taskId"))?;
        tracing::debug!(provider = self.name(), task_id = %task_id, "CAPTCHA task created");

        let deadline = Instant::now() + self.poll.max_wait;
        loop {
            tokio::time::sleep(self.poll.interval).await;
            let reply = self
                .call(
                    "getTaskResult",
                    json!({ "clientKey": self.api_key, "taskId": task_id }),
                )
                .await?;

            if reply.status.as_deref() == Some("ready") {
                return reply
                    .solution
                    .map(|s| s.g_recaptcha_response)
                    .ok_or_else(|| failed(self.name(), "ready without a solution"));
            }
            if Instant::now() >= deadline {
                return Err(failed(
                    self.name(),
                    format!("no solution within {}s", self.poll.max_wait.as_secs()),
                ));
            }
        }
    }

    fn name(&self) -> &'static str {
        "capsolver"
    }
}
