//! The login handshake.
//!
//! One run walks five steps in order: fetch the login page, solve the
//! CAPTCHA, submit credentials, submit a TOTP code when MFA is required, and
//! verify the authorization status. Any failure aborts the run; the
//! supervisor owns whole-run retries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use klaviyo_relay_config::{KlaviyoConfig, RelayConfig, SecretKind, require_secret};

use crate::captcha::{CaptchaRequest, SharedCaptchaSolver, build_solver};
use crate::cookies::CSRF_COOKIE;
use crate::error::{AuthError, Result};
use crate::retry::{RetryPolicy, retry_fixed};
use crate::session::{CSRF_HEADER, LiveSession, SessionMaterializer};
use crate::totp::{Totp, unix_now};

/// Marker in the post-login redirect target meaning MFA is required.
pub const MFA_MARKER: &str = "login-mfa";

/// Authorization status meaning the login is complete.
pub const FULLY_AUTHENTICATED: &str = "fully-authenticated";

/// `next` sent with the MFA code when the redirect target names none.
const DEFAULT_NEXT: &str = "/dashboard";

/// Upstream bodies are cut to this many characters in errors and logs.
const BODY_SNIPPET_CHARS: usize = 300;

/// Wall clock in Unix seconds, injectable for tests.
pub type UnixClock = Arc<dyn Fn() -> u64 + Send + Sync>;

// ============================================================================
// Settings
// ============================================================================

/// Account credentials.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Absolute URLs of the upstream login endpoints.
#[derive(Debug, Clone)]
pub struct LoginEndpoints {
    pub login_page: String,
    pub login_submit: String,
    pub mfa_submit: String,
    pub authorization: String,
}

impl LoginEndpoints {
    pub fn from_config(config: &KlaviyoConfig) -> Self {
        Self {
            login_page: config.url(&config.login_page_path),
            login_submit: config.url(&config.login_submit_path),
            mfa_submit: config.url(&config.mfa_submit_path),
            authorization: config.url(&config.authorization_path),
        }
    }
}

/// Everything a login run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub endpoints: LoginEndpoints,
    /// reCAPTCHA site key; scraped from the login page when unset.
    pub site_key: Option<String>,
    pub mfa: RetryPolicy,
    pub request_timeout: Duration,
}

impl LoginSettings {
    pub fn from_config(config: &KlaviyoConfig) -> Self {
        Self {
            endpoints: LoginEndpoints::from_config(config),
            site_key: config.site_key.clone().filter(|k| !k.is_empty()),
            mfa: RetryPolicy::new(config.mfa_retries, config.mfa_retry_delay()),
            request_timeout: config.request_timeout(),
        }
    }
}

// ============================================================================
// Per-run records
// ============================================================================

/// Transient data for one login run. Never persisted.
#[derive(Clone)]
pub struct LoginAttempt {
    pub csrf_token: String,
    pub fingerprint: String,
    pub captcha_token: String,
    pub attempt_number: u32,
}

impl fmt::Debug for LoginAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginAttempt")
            .field("fingerprint", &self.fingerprint)
            .field("attempt_number", &self.attempt_number)
            .finish_non_exhaustive()
    }
}

/// Parsed credential-submission response.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub status: u16,
    pub body: Value,
}

impl LoginResponse {
    /// Redirect target named by the response, if any.
    pub fn redirect_target(&self) -> Option<&str> {
        ["redirect_url", "redirectUrl", "redirect"]
            .iter()
            .find_map(|key| self.body.get(key).and_then(Value::as_str))
    }

    /// Whether the redirect target points at the MFA step.
    pub fn requires_mfa(&self) -> bool {
        self.redirect_target()
            .is_some_and(|target| target.contains(MFA_MARKER))
    }

    /// `next` value for the MFA form: the redirect's own `next` parameter,
    /// or the dashboard.
    pub fn mfa_next(&self, base: &str) -> String {
        self.redirect_target()
            .and_then(|target| Url::parse(base).ok()?.join(target).ok())
            .and_then(|url| {
                url.query_pairs()
                    .find(|(k, _)| k == "next")
                    .map(|(_, v)| v.into_owned())
            })
            .unwrap_or_else(|| DEFAULT_NEXT.to_string())
    }
}

/// Result of an authorization-status check.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStatus {
    /// Upstream HTTP status.
    pub http_status: u16,
    /// `authentication_status` field, when present.
    pub authentication_status: Option<String>,
    /// Full response body, kept as the account identity.
    pub account: Value,
}

impl AuthorizationStatus {
    pub fn is_fully_authenticated(&self) -> bool {
        (200..300).contains(&self.http_status)
            && self.authentication_status.as_deref() == Some(FULLY_AUTHENTICATED)
    }

    /// Whether upstream refused the session outright.
    pub fn is_rejected(&self) -> bool {
        matches!(self.http_status, 401 | 403)
    }
}

/// GET the authorization endpoint with `session`.
///
/// Transport failures are `Network` errors; any HTTP reply is returned as a
/// status for the caller to judge.
pub async fn check_authorization(
    session: &LiveSession,
    url: &str,
    timeout: Duration,
) -> Result<AuthorizationStatus> {
    let response = session
        .client()
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| AuthError::Network(format!("authorization check: {}", e)))?;

    let http_status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| AuthError::Network(format!("authorization check body: {}", e)))?;
    let account: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    let authentication_status = account
        .get("authentication_status")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(AuthorizationStatus {
        http_status,
        authentication_status,
        account,
    })
}

/// Opaque per-run fingerprint: hex SHA-256 of a random id and the time.
pub fn generate_fingerprint() -> String {
    let seed = format!(
        "{}{}",
        uuid::Uuid::new_v4(),
        Utc::now().timestamp_millis()
    );
    format!("{:x}", Sha256::digest(seed.as_bytes()))
}

/// Pull a `data-sitekey` attribute out of the login page.
pub fn extract_site_key(html: &str) -> Option<String> {
    const ATTR: &str = "data-sitekey=";
    let start = html.find(ATTR)? + ATTR.len();
    let rest = &html[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string()).filter(|k| !k.is_empty())
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}

// ============================================================================
// Authenticator
// ============================================================================

/// Drives the login handshake and returns a live authenticated session.
pub struct Authenticator {
    settings: LoginSettings,
    credentials: Credentials,
    materializer: SessionMaterializer,
    solver: SharedCaptchaSolver,
    totp: Totp,
    clock: UnixClock,
}

impl Authenticator {
    pub fn new(
        settings: LoginSettings,
        credentials: Credentials,
        materializer: SessionMaterializer,
        solver: SharedCaptchaSolver,
        totp: Totp,
    ) -> Self {
        Self {
            settings,
            credentials,
            materializer,
            solver,
            totp,
            clock: Arc::new(unix_now),
        }
    }

    /// Build from configuration, resolving every secret.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let klaviyo = config.klaviyo();
        let credentials = Credentials {
            email: require_secret(SecretKind::Email, config)?.value,
            password: require_secret(SecretKind::Password, config)?.value,
        };
        let totp = Totp::from_base32(&require_secret(SecretKind::TotpSecret, config)?.value)?;
        let solver = build_solver(
            &config.captcha(),
            require_secret(SecretKind::CaptchaApiKey, config)?.value,
        )?;

        Ok(Self::new(
            LoginSettings::from_config(&klaviyo),
            credentials,
            SessionMaterializer::from_config(&klaviyo),
            solver,
            totp,
        ))
    }

    /// Replace the clock used for TOTP codes.
    pub fn with_clock(mut self, clock: UnixClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn materializer(&self) -> &SessionMaterializer {
        &self.materializer
    }

    pub fn settings(&self) -> &LoginSettings {
        &self.settings
    }

    /// Single login run.
    pub async fn login(&self) -> Result<LiveSession> {
        self.login_attempt(1).await
    }

    /// Login run numbered `attempt_number` by the caller.
    pub async fn login_attempt(&self, attempt_number: u32) -> Result<LiveSession> {
        let started = Instant::now();
        tracing::info!(attempt = attempt_number, email = %self.credentials.email, "Starting login");

        let result = self.run(attempt_number).await;
        match &result {
            Ok(session) => tracing::info!(
                attempt = attempt_number,
                generation = session.generation(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Login succeeded"
            ),
            Err(e) => tracing::error!(
                attempt = attempt_number,
                step = e.step(),
                error = %e,
                "Login failed"
            ),
        }
        result
    }

    async fn run(&self, attempt_number: u32) -> Result<LiveSession> {
        let session = self.materializer.fresh()?;

        let scraped_key = self.fetch_login_page(&session).await?;
        let captcha_token = self.solve_captcha(scraped_key).await?;

        let csrf_token = session
            .csrf_token()
            .ok_or_else(|| AuthError::MissingCsrfToken(CSRF_COOKIE.to_string()))?;
        let attempt = LoginAttempt {
            csrf_token,
            fingerprint: generate_fingerprint(),
            captcha_token,
            attempt_number,
        };

        let response = self.submit_credentials(&session, &attempt).await?;
        if response.requires_mfa() {
            let next = response.mfa_next(session.base_url());
            self.submit_mfa(&session, &next).await?;
        } else {
            tracing::debug!("MFA not requested");
        }

        self.verify(&session).await?;
        self.materializer.with_current_csrf(&session)
    }

    async fn fetch_login_page(&self, session: &LiveSession) -> Result<Option<String>> {
        let url = &self.settings.endpoints.login_page;
        tracing::debug!(step = "fetch_login_page", url = %url, "Step started");

        let response = session
            .client()
            .get(url)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
            .timeout(self.settings.request_timeout)
            .send()
            .await
            .map_err(|e| AuthError::LoginPageFetchFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::LoginPageFetchFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::LoginPageFetchFailed(format!(
                "status {}: {}",
                status.as_u16(),
                snippet(&body)
            )));
        }

        tracing::debug!(step = "fetch_login_page", cookies = session.jar().len(), "Step finished");
        Ok(extract_site_key(&body))
    }

    async fn solve_captcha(&self, scraped_key: Option<String>) -> Result<String> {
        let site_key = self
            .settings
            .site_key
            .clone()
            .or(scraped_key)
            .ok_or_else(|| {
                AuthError::CaptchaSolveFailed(
                    "no reCAPTCHA site key configured or found on the login page".to_string(),
                )
            })?;

        tracing::debug!(step = "solve_captcha", provider = self.solver.name(), "Step started");
        let started = Instant::now();
        let token = self
            .solver
            .solve(&CaptchaRequest {
                page_url: self.settings.endpoints.login_page.clone(),
                site_key,
            })
            .await?;
        if token.is_empty() {
            return Err(AuthError::CaptchaSolveFailed(format!(
                "{} returned an empty token",
                self.solver.name()
            )));
        }

        tracing::debug!(
            step = "solve_captcha",
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Step finished"
        );
        Ok(token)
    }

    async fn submit_credentials(
        &self,
        session: &LiveSession,
        attempt: &LoginAttempt,
    ) -> Result<LoginResponse> {
        let url = &self.settings.endpoints.login_submit;
        tracing::debug!(step = "submit_credentials", url = %url, "Step started");

        let response = session
            .client()
            .post(url)
            .header(CSRF_HEADER, &attempt.csrf_token)
            .header(reqwest::header::REFERER, &self.settings.endpoints.login_page)
            .form(&[
                ("email", self.credentials.email.as_str()),
                ("password", self.credentials.password.as_str()),
                ("g-recaptcha-response", attempt.captcha_token.as_str()),
                ("fingerprint", attempt.fingerprint.as_str()),
            ])
            .timeout(self.settings.request_timeout)
            .send()
            .await
            .map_err(|e| AuthError::CredentialSubmissionFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::CredentialSubmissionFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::CredentialSubmissionFailed(format!(
                "status {}: {}",
                status.as_u16(),
                snippet(&text)
            )));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|_| {
                AuthError::CredentialSubmissionFailed(format!(
                    "unexpected response: {}",
                    snippet(&text)
                ))
            })?
        };
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(AuthError::CredentialSubmissionFailed(format!(
                "rejected: {}",
                snippet(&text)
            )));
        }

        let response = LoginResponse {
            status: status.as_u16(),
            body,
        };
        tracing::debug!(
            step = "submit_credentials",
            mfa = response.requires_mfa(),
            "Step finished"
        );
        Ok(response)
    }

    async fn submit_mfa(&self, session: &LiveSession, next: &str) -> Result<()> {
        let url = &self.settings.endpoints.mfa_submit;
        let policy = self.settings.mfa;
        tracing::debug!(step = "submit_mfa", url = %url, next = %next, "Step started");

        retry_fixed(policy, "submit_mfa", |attempt| async move {
            let code = self.totp.code_at((self.clock)());
            let csrf = session.csrf_token().unwrap_or_default();
            tracing::info!(step = "submit_mfa", attempt, "Submitting MFA code");

            let response = session
                .client()
                .post(url)
                .header(CSRF_HEADER, csrf)
                .form(&[("code", code.as_str()), ("type", "totp"), ("next", next)])
                .timeout(self.settings.request_timeout)
                .send()
                .await
                .map_err(|e| format!("transport: {}", e))?;

            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(format!("status {}: {}", status.as_u16(), snippet(&text)));
            }
            let rejected = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("success").and_then(Value::as_bool))
                == Some(false);
            if rejected {
                return Err(format!("code rejected: {}", snippet(&text)));
            }
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| AuthError::MfaExhausted {
            attempts: e.attempts,
            last_error: e.last_error,
        })?;

        tracing::debug!(step = "submit_mfa", "Step finished");
        Ok(())
    }

    async fn verify(&self, session: &LiveSession) -> Result<AuthorizationStatus> {
        tracing::debug!(step = "verify", "Step started");
        let status = check_authorization(
            session,
            &self.settings.endpoints.authorization,
            self.settings.request_timeout,
        )
        .await
        .map_err(|e| AuthError::VerificationFailed(e.to_string()))?;

        if !status.is_fully_authenticated() {
            return Err(AuthError::VerificationFailed(format!(
                "status {}, authentication_status {:?}",
                status.http_status, status.authentication_status
            )));
        }

        tracing::debug!(step = "verify", "Step finished");
        Ok(status)
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("settings", &self.settings)
            .field("credentials", &self.credentials)
            .field("solver", &self.solver.name())
            .finish_non_exhaustive()
    }
}
