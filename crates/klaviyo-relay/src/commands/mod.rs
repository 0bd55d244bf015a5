//! CLI command handlers.

pub mod admin;
pub mod login;
pub mod serve;
pub mod status;
pub mod supervise;
pub mod totp;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use klaviyo_relay_auth::CredentialStore;
use klaviyo_relay_client::RelayClient;
use klaviyo_relay_config::{LoadedConfig, RelayConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration with env overrides applied.
    pub config: RelayConfig,
    /// Base URL of the running proxy.
    pub relay_url: String,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn new(config: RelayConfig, relay: Option<String>, json_output: bool, verbose: bool) -> Self {
        let relay_url =
            relay.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.server().port));
        Self {
            config,
            relay_url,
            json_output,
            verbose,
        }
    }

    /// Client for the running proxy.
    pub fn client(&self) -> Result<RelayClient> {
        RelayClient::builder()
            .base_url(&self.relay_url)
            .build()
            .with_context(|| format!("invalid relay URL '{}'", self.relay_url))
    }

    /// Credential Store at `path`, or the configured location.
    pub fn store(&self, path: Option<PathBuf>) -> CredentialStore {
        CredentialStore::new(path.unwrap_or_else(|| self.config.store().effective_path()))
    }
}

/// Discover (or read) the config file, then apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let mut loaded = match path {
        Some(path) => LoadedConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => klaviyo_relay_config::load_config(None)?,
    };
    loaded
        .config
        .apply_env_overrides(|key| std::env::var(key).ok());
    Ok(loaded)
}
