//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [klaviyo]      # upstream endpoints, account, MFA policy
//! [captcha]      # CAPTCHA provider selection
//! [store]        # Credential Store location
//! [server]       # proxy server settings
//! [scheduler]    # re-authentication schedule
//! [logging]      # log filters and file output
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default Klaviyo web origin.
pub const DEFAULT_BASE_URL: &str = "https://www.klaviyo.com";

/// Default proxy port.
pub const DEFAULT_PORT: u16 = 3001;

/// Default bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Stable desktop browser User-Agent sent on every upstream request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream site and account settings.
    pub klaviyo: Option<KlaviyoConfig>,

    /// CAPTCHA provider settings.
    pub captcha: Option<CaptchaConfig>,

    /// Credential Store settings.
    pub store: Option<StoreConfig>,

    /// Proxy server settings.
    pub server: Option<ServerConfig>,

    /// Re-authentication scheduler settings.
    pub scheduler: Option<SchedulerConfig>,

    /// Logging settings.
    pub logging: Option<LoggingConfig>,
}

impl RelayConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string and reject out-of-range values.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the durations that drive timers and polling loops.
    ///
    /// Zero intervals would spin or panic in `tokio::time::interval`.
    pub fn validate(&self) -> crate::Result<()> {
        let mut checks: Vec<(&'static str, u64)> = Vec::new();
        if let Some(ref k) = self.klaviyo {
            checks.push(("klaviyo.request_timeout_secs", k.request_timeout_secs));
        }
        if let Some(ref c) = self.captcha {
            checks.push(("captcha.poll_interval_secs", c.poll_interval_secs));
            checks.push(("captcha.max_wait_secs", c.max_wait_secs));
        }
        if let Some(ref s) = self.server {
            checks.push(("server.watch_interval_secs", s.watch_interval_secs));
        }
        if let Some(ref s) = self.scheduler {
            checks.push(("scheduler.interval_secs", s.interval_secs));
        }

        match checks.into_iter().find(|(_, secs)| *secs == 0) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: "must be at least 1 second".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: RelayConfig) {
        if other.klaviyo.is_some() {
            self.klaviyo = other.klaviyo;
        }

        if other.captcha.is_some() {
            self.captcha = other.captcha;
        }

        if other.store.is_some() {
            self.store = other.store;
        }

        if other.server.is_some() {
            self.server = other.server;
        }

        if other.scheduler.is_some() {
            self.scheduler = other.scheduler;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Apply non-secret environment overrides.
    ///
    /// `lookup` is normally `|k| std::env::var(k).ok()`; tests pass a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("KLAVIYO_RELAY_PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.get_or_insert_with(ServerConfig::default).port = port;
        }

        if let Some(path) = lookup("KLAVIYO_RELAY_STORE_PATH").filter(|v| !v.is_empty()) {
            self.store.get_or_insert_with(StoreConfig::default).path = Some(PathBuf::from(path));
        }

        if let Some(provider) =
            lookup("KLAVIYO_RELAY_CAPTCHA_PROVIDER").and_then(|v| CaptchaProvider::parse(&v))
        {
            self.captcha
                .get_or_insert_with(CaptchaConfig::default)
                .provider = provider;
        }
    }

    /// Klaviyo section or defaults.
    pub fn klaviyo(&self) -> KlaviyoConfig {
        self.klaviyo.clone().unwrap_or_default()
    }

    /// Captcha section or defaults.
    pub fn captcha(&self) -> CaptchaConfig {
        self.captcha.clone().unwrap_or_default()
    }

    /// Store section or defaults.
    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    /// Server section or defaults.
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// Scheduler section or defaults.
    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_default()
    }

    /// Logging section or defaults.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Whether any secret is stored in plaintext in this config.
    pub fn plaintext_secrets(&self) -> Vec<&'static str> {
        let mut found = Vec::new();
        if let Some(ref k) = self.klaviyo {
            if k.password.is_some() {
                found.push("klaviyo.password");
            }
            if k.totp_secret.is_some() {
                found.push("klaviyo.totp_secret");
            }
        }
        if let Some(ref c) = self.captcha
            && c.api_key.is_some()
        {
            found.push("captcha.api_key");
        }
        found
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Klaviyo Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream site, account and login-flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KlaviyoConfig {
    /// Web origin of the upstream site.
    pub base_url: String,
    /// Login page path (GET).
    pub login_page_path: String,
    /// Credential submission path (POST form).
    pub login_submit_path: String,
    /// MFA submission path (POST form).
    pub mfa_submit_path: String,
    /// Authorization status path (GET).
    pub authorization_path: String,
    /// CAPTCHA site key embedded in the login page.
    pub site_key: Option<String>,
    /// Account email. `KLAVIYO_EMAIL` takes precedence.
    pub email: Option<String>,
    /// Account password. Prefer `KLAVIYO_PASSWORD`.
    pub password: Option<String>,
    /// Base32 TOTP secret. Prefer `KLAVIYO_TOTP_SECRET`.
    pub totp_secret: Option<String>,
    /// User-Agent sent on every request.
    pub user_agent: String,
    /// Cookie domains captured when persisting a session.
    /// Empty means every cookie in the jar.
    pub cookie_domains: Vec<String>,
    /// Timeout for internal login/verification requests, in seconds.
    pub request_timeout_secs: u64,
    /// Redirects followed per request.
    pub max_redirects: usize,
    /// MFA retries after the first attempt.
    pub mfa_retries: u32,
    /// Delay between MFA attempts, in seconds.
    pub mfa_retry_delay_secs: u64,
}

impl Default for KlaviyoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_page_path: "/login".to_string(),
            login_submit_path: "/ajax/login".to_string(),
            mfa_submit_path: "/ajax/login/mfa".to_string(),
            authorization_path: "/ajax/authorization".to_string(),
            site_key: None,
            email: None,
            password: None,
            totp_secret: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie_domains: vec!["klaviyo.com".to_string()],
            request_timeout_secs: 30,
            max_redirects: 5,
            mfa_retries: 3,
            mfa_retry_delay_secs: 5,
        }
    }
}

impl KlaviyoConfig {
    /// Join a configured path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Internal request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay between MFA attempts.
    pub fn mfa_retry_delay(&self) -> Duration {
        Duration::from_secs(self.mfa_retry_delay_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Captcha Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Supported CAPTCHA-solving providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptchaProvider {
    #[default]
    TwoCaptcha,
    Capsolver,
}

impl CaptchaProvider {
    /// Parse a provider name as written in config or env.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "two-captcha" | "2captcha" | "twocaptcha" => Some(Self::TwoCaptcha),
            "capsolver" => Some(Self::Capsolver),
            _ => None,
        }
    }

    /// Default API endpoint.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            CaptchaProvider::TwoCaptcha => "https://2captcha.com",
            CaptchaProvider::Capsolver => "https://api.capsolver.com",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            CaptchaProvider::TwoCaptcha => "2Captcha",
            CaptchaProvider::Capsolver => "CapSolver",
        }
    }
}

impl std::fmt::Display for CaptchaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// CAPTCHA provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// Which provider to call.
    pub provider: CaptchaProvider,
    /// Provider API key. Prefer `CAPTCHA_API_KEY`.
    pub api_key: Option<String>,
    /// Override for the provider endpoint.
    pub base_url: Option<String>,
    /// Seconds between result polls.
    pub poll_interval_secs: u64,
    /// Give up after this many seconds.
    pub max_wait_secs: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            provider: CaptchaProvider::default(),
            api_key: None,
            base_url: None,
            poll_interval_secs: 5,
            max_wait_secs: 180,
        }
    }
}

impl CaptchaConfig {
    /// Effective provider endpoint.
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Credential Store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the session JSON file.
    /// Default: `<data dir>/klaviyo-relay/session.json`.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Effective store path.
    pub fn effective_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| crate::discovery::data_dir().join(crate::SESSION_FILE))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Proxy server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub bind: String,
    /// Enable rate limiting.
    pub rate_limiting: bool,
    /// Requests per minute across all callers.
    pub requests_per_minute: u32,
    /// Enable request logging.
    pub request_logging: bool,
    /// Seconds between Credential Store mtime checks.
    pub watch_interval_secs: u64,
    /// Seconds to wait after an external change before reloading.
    pub settle_delay_secs: u64,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            rate_limiting: true,
            requests_per_minute: 1000,
            request_logging: true,
            watch_interval_secs: 60,
            settle_delay_secs: 30,
            max_body_size: 50 * 1024 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Re-authentication schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduled logins.
    pub interval_secs: u64,
    /// Whole-login retries after a failed attempt.
    pub max_retries: u32,
    /// Seconds between retries.
    pub retry_delay_secs: u64,
    /// Proxy `/reload` endpoint notified after a successful login when the
    /// scheduler runs out of process.
    pub reload_url: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 23 * 60 * 60,
            max_retries: 30,
            retry_delay_secs: 60,
            reload_url: None,
        }
    }
}

impl SchedulerConfig {
    /// Scheduled interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive (e.g. `klaviyo_relay=debug,info`).
    pub filter: Option<String>,
    /// Directory for JSON log files. Default: `<data dir>/logs`.
    pub directory: Option<PathBuf>,
    /// Write rotating JSON logs.
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            directory: None,
            json_file: true,
        }
    }
}

impl LoggingConfig {
    /// Effective log directory.
    pub fn effective_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| crate::discovery::data_dir().join("logs"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config() {
        let config = RelayConfig::new();
        assert!(config.klaviyo.is_none());
        assert!(config.server.is_none());
        assert_eq!(config.server().port, DEFAULT_PORT);
        assert_eq!(config.scheduler().max_retries, 30);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
[klaviyo]
email = "ops@example.com"
site_key = "6Lc-test"
mfa_retries = 2

[captcha]
provider = "capsolver"

[server]
port = 4100
settle_delay_secs = 5

[scheduler]
interval_secs = 3600
reload_url = "http://127.0.0.1:4100/reload"
"#;
        let config = RelayConfig::from_toml(toml).unwrap();
        let klaviyo = config.klaviyo();
        assert_eq!(klaviyo.email.as_deref(), Some("ops@example.com"));
        assert_eq!(klaviyo.mfa_retries, 2);
        // Unset fields keep their defaults.
        assert_eq!(klaviyo.login_submit_path, "/ajax/login");
        assert_eq!(config.captcha().provider, CaptchaProvider::Capsolver);
        assert_eq!(config.server().port, 4100);
        assert_eq!(config.server().watch_interval_secs, 60);
        assert_eq!(config.scheduler().interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = RelayConfig::from_toml("[server]\nport = 1\n[scheduler]\nmax_retries = 4").unwrap();
        let overlay = RelayConfig::from_toml("[server]\nport = 2").unwrap();
        base.merge(overlay);
        assert_eq!(base.server().port, 2);
        assert_eq!(base.scheduler().max_retries, 4);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KLAVIYO_RELAY_PORT", "9999"),
            ("KLAVIYO_RELAY_STORE_PATH", "/tmp/s.json"),
            ("KLAVIYO_RELAY_CAPTCHA_PROVIDER", "capsolver"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::new();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server().port, 9999);
        assert_eq!(config.store().effective_path(), PathBuf::from("/tmp/s.json"));
        assert_eq!(config.captcha().provider, CaptchaProvider::Capsolver);
    }

    #[test]
    fn test_invalid_port_override_ignored() {
        let mut config = RelayConfig::new();
        config.apply_env_overrides(|k| (k == "KLAVIYO_RELAY_PORT").then(|| "abc".to_string()));
        assert!(config.server.is_none());
    }

    #[test]
    fn test_captcha_provider_parse() {
        assert_eq!(CaptchaProvider::parse("2captcha"), Some(CaptchaProvider::TwoCaptcha));
        assert_eq!(CaptchaProvider::parse(" CapSolver "), Some(CaptchaProvider::Capsolver));
        assert_eq!(CaptchaProvider::parse("anticaptcha"), None);
    }

    #[test]
    fn test_url_join() {
        let k = KlaviyoConfig {
            base_url: "http://127.0.0.1:9000/".to_string(),
            ..Default::default()
        };
        assert_eq!(k.url("/ajax/login"), "http://127.0.0.1:9000/ajax/login");
        assert_eq!(k.url("login"), "http://127.0.0.1:9000/login");
    }

    #[test]
    fn test_plaintext_secrets_detected() {
        let config = RelayConfig::from_toml(
            "[klaviyo]\npassword = \"hunter2\"\n[captcha]\napi_key = \"k\"",
        )
        .unwrap();
        assert_eq!(
            config.plaintext_secrets(),
            vec!["klaviyo.password", "captcha.api_key"]
        );
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for (toml, field) in [
            ("[scheduler]\ninterval_secs = 0\nmax_retries = 0", "scheduler.interval_secs"),
            ("[server]\nwatch_interval_secs = 0", "server.watch_interval_secs"),
            ("[captcha]\npoll_interval_secs = 0", "captcha.poll_interval_secs"),
            ("[captcha]\nmax_wait_secs = 0", "captcha.max_wait_secs"),
            ("[klaviyo]\nrequest_timeout_secs = 0", "klaviyo.request_timeout_secs"),
        ] {
            match RelayConfig::from_toml(toml) {
                Err(ConfigError::Invalid { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected Invalid for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_zero_delays_allowed() {
        // Delays may be zero; only timer periods may not.
        let config = RelayConfig::from_toml(
            "[scheduler]\nretry_delay_secs = 0\n[server]\nsettle_delay_secs = 0",
        )
        .unwrap();
        assert!(config.scheduler().retry_delay().is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_validate() {
        let mut config = RelayConfig::new();
        config.scheduler = Some(SchedulerConfig::default());
        config.server = Some(ServerConfig::default());
        config.captcha = Some(CaptchaConfig::default());
        config.klaviyo = Some(KlaviyoConfig::default());
        assert!(config.validate().is_ok());
    }
}
