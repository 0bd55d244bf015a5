//! Configuration system for the Klaviyo session relay.
//!
//! Provides TOML-based configuration with:
//! - Upstream endpoint, account and MFA settings (`[klaviyo]`)
//! - CAPTCHA provider selection (`[captcha]`)
//! - Credential Store location, proxy server, scheduler and logging sections
//! - Config file layering (XDG user config + project-local overrides)
//! - Secret resolution (env var → config file)

pub mod discovery;
pub mod error;
pub mod secrets;
pub mod types;

pub use discovery::{
    LoadedConfig, data_dir, load_config, load_config_file, load_config_with_options,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use secrets::{ResolvedSecret, SecretKind, SecretSource, require_secret, resolve_secret};
pub use types::*;

/// File name of the Credential Store inside the data directory.
pub const SESSION_FILE: &str = "session.json";
