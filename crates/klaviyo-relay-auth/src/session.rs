//! Live sessions and the materializer that converts them to and from the
//! Credential Store snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

use klaviyo_relay_config::KlaviyoConfig;

use crate::cookies::{CSRF_COOKIE, SessionJar, StoredCookie, dedup_latest};
use crate::error::{AuthError, Result};
use crate::store::{CredentialStore, STORE_VERSION, SessionState};

/// Header carrying the anti-forgery token.
pub const CSRF_HEADER: &str = "x-csrftoken";

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// LiveSession
// ============================================================================

/// An HTTP client bound to a cookie jar and a header set.
///
/// Cloning is cheap; clones share the same jar.
#[derive(Clone)]
pub struct LiveSession {
    client: reqwest::Client,
    jar: Arc<SessionJar>,
    headers: HeaderMap,
    base_url: String,
    timeout: Duration,
    max_redirects: usize,
    generation: u64,
}

impl LiveSession {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn jar(&self) -> &Arc<SessionJar> {
        &self.jar
    }

    /// Default headers attached to every request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Process-unique id, increasing with each session built.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current anti-forgery token from the jar.
    pub fn csrf_token(&self) -> Option<String> {
        self.jar.value(CSRF_COOKIE)
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("base_url", &self.base_url)
            .field("generation", &self.generation)
            .field("cookies", &self.jar.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// SessionSettings
// ============================================================================

/// Settings shared by every session the materializer builds.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub base_url: String,
    pub user_agent: String,
    /// Cookies outside these domains are not persisted. Empty keeps all.
    pub cookie_domains: Vec<String>,
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl SessionSettings {
    pub fn from_config(config: &KlaviyoConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            cookie_domains: config.cookie_domains.clone(),
            timeout: config.request_timeout(),
            max_redirects: config.max_redirects,
        }
    }
}

// ============================================================================
// SessionMaterializer
// ============================================================================

/// Builds live sessions and converts them to and from [`SessionState`].
#[derive(Debug, Clone)]
pub struct SessionMaterializer {
    settings: SessionSettings,
}

impl SessionMaterializer {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &KlaviyoConfig) -> Self {
        Self::new(SessionSettings::from_config(config))
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Empty jar with baseline headers, ready for a login run.
    pub fn fresh(&self) -> Result<LiveSession> {
        self.build(
            Arc::new(SessionJar::new()),
            self.baseline_headers()?,
            self.settings.base_url.clone(),
            self.settings.timeout,
            self.settings.max_redirects,
        )
    }

    /// Capture a live session as a snapshot.
    pub fn snapshot(&self, live: &LiveSession) -> SessionState {
        let cookies = dedup_latest(
            live.jar()
                .all()
                .into_iter()
                .filter(|c| self.keeps_domain(c)),
        );

        let headers: BTreeMap<String, String> = live
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        SessionState {
            base_url: live.base_url().to_string(),
            timeout: live.timeout().as_millis() as u64,
            headers,
            with_credentials: true,
            max_redirects: live.max_redirects(),
            cookies,
            saved_at: Utc::now(),
            version: STORE_VERSION.to_string(),
        }
    }

    /// Snapshot `live` and write it to `store`.
    pub fn persist(&self, live: &LiveSession, store: &CredentialStore) -> Result<SessionState> {
        let state = self.snapshot(live);
        store.save(&state)?;
        Ok(state)
    }

    /// Rebuild a live session from a snapshot.
    ///
    /// Expired cookies are dropped. Stored headers overlay the baseline and
    /// the jar's CSRF token wins over both.
    pub fn materialize(&self, state: &SessionState) -> Result<LiveSession> {
        let now = Utc::now();
        let jar = Arc::new(SessionJar::from_cookies(
            state.cookies.iter().filter(|c| !c.is_expired(now)).cloned(),
        ));

        let mut headers = self.baseline_headers()?;
        for (name, value) in &state.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping invalid stored header"),
            }
        }
        if let Some(token) = jar.value(CSRF_COOKIE)
            && let Ok(value) = HeaderValue::from_str(&token)
        {
            headers.insert(HeaderName::from_static(CSRF_HEADER), value);
        }

        let base_url = if state.base_url.is_empty() {
            self.settings.base_url.clone()
        } else {
            state.base_url.trim_end_matches('/').to_string()
        };
        let timeout = if state.timeout == 0 {
            self.settings.timeout
        } else {
            Duration::from_millis(state.timeout)
        };

        self.build(jar, headers, base_url, timeout, state.max_redirects)
    }

    /// Load the snapshot from `store` and materialize it.
    pub fn load(&self, store: &CredentialStore) -> Result<LiveSession> {
        let state = store.load()?;
        self.materialize(&state)
    }

    /// Copy of `live` whose default headers carry the jar's current CSRF token.
    ///
    /// Login runs end with a token that did not exist when the session was
    /// built; the persisted header set must include it.
    pub fn with_current_csrf(&self, live: &LiveSession) -> Result<LiveSession> {
        let mut headers = live.headers().clone();
        match live.csrf_token() {
            Some(token) => {
                let value = HeaderValue::from_str(&token)
                    .map_err(|e| AuthError::Config(format!("Invalid CSRF token: {}", e)))?;
                headers.insert(HeaderName::from_static(CSRF_HEADER), value);
            }
            None => return Ok(live.clone()),
        }
        self.build(
            live.jar().clone(),
            headers,
            live.base_url().to_string(),
            live.timeout(),
            live.max_redirects(),
        )
    }

    fn keeps_domain(&self, cookie: &StoredCookie) -> bool {
        self.settings.cookie_domains.is_empty()
            || self
                .settings
                .cookie_domains
                .iter()
                .any(|d| cookie.belongs_to(d))
    }

    fn baseline_headers(&self) -> Result<HeaderMap> {
        let base = &self.settings.base_url;
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, header_value(&self.settings.user_agent)?);
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::ORIGIN, header_value(base)?);
        headers.insert(header::REFERER, header_value(&format!("{}/", base))?);
        headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
        Ok(headers)
    }

    fn build(
        &self,
        jar: Arc<SessionJar>,
        headers: HeaderMap,
        base_url: String,
        timeout: Duration,
        max_redirects: usize,
    ) -> Result<LiveSession> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(headers.clone())
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(LiveSession {
            client,
            jar,
            headers,
            base_url,
            timeout,
            max_redirects,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AuthError::Config(format!("Invalid header value {:?}: {}", value, e)))
}
