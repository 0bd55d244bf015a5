//! Server configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use klaviyo_relay_config::{DEFAULT_PORT, RelayConfig};

use crate::error::{Result, ServerError};

/// Default max body size for forwarded requests (50 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Enable rate limiting.
    pub rate_limiting: bool,

    /// Global request ceiling per minute.
    pub requests_per_minute: u32,

    /// Enable request logging.
    pub request_logging: bool,

    /// Allow cross-origin callers.
    pub enable_cors: bool,

    /// Maximum inbound request body size in bytes.
    pub max_body_size: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Credential Store watching
    // ─────────────────────────────────────────────────────────────────────────
    /// How often the Credential Store's mtime is checked.
    pub watch_interval: Duration,

    /// Wait after an external change before reloading.
    pub settle_delay: Duration,

    // ─────────────────────────────────────────────────────────────────────────
    // Health checks
    // ─────────────────────────────────────────────────────────────────────────
    /// Upstream authorization-status URL used by `/health`.
    pub authorization_url: String,

    /// Timeout for the `/health` upstream call.
    pub health_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            rate_limiting: true,
            requests_per_minute: 1000,
            request_logging: true,
            enable_cors: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            watch_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(30),
            authorization_url: "https://www.klaviyo.com/ajax/authorization".to_string(),
            health_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[server]` and `[klaviyo]` sections.
    pub fn from_relay_config(config: &RelayConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let server = config.server();
        let klaviyo = config.klaviyo();

        let ip: IpAddr = server.bind.parse().map_err(|e| {
            ServerError::Config(format!("Invalid bind address '{}': {}", server.bind, e))
        })?;

        Ok(Self {
            bind_address: SocketAddr::new(ip, server.port),
            rate_limiting: server.rate_limiting,
            requests_per_minute: server.requests_per_minute,
            request_logging: server.request_logging,
            enable_cors: false,
            max_body_size: server.max_body_size,
            watch_interval: Duration::from_secs(server.watch_interval_secs),
            settle_delay: Duration::from_secs(server.settle_delay_secs),
            authorization_url: klaviyo.url(&klaviyo.authorization_path),
            health_timeout: klaviyo.request_timeout(),
        })
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Enable or disable rate limiting.
    pub fn with_rate_limiting(mut self, enabled: bool) -> Self {
        self.rate_limiting = enabled;
        self
    }

    /// Set the global request ceiling.
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Enable or disable request logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    /// Enable or disable permissive CORS.
    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.enable_cors = enabled;
        self
    }

    /// Set the maximum request body size.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the watcher poll interval.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Set the settle delay before reloading an externally changed store.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the upstream authorization URL used by `/health`.
    pub fn with_authorization_url(mut self, url: impl Into<String>) -> Self {
        self.authorization_url = url.into();
        self
    }
}
