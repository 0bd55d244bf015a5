//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/klaviyo-relay/config.toml` (XDG user config)
//! 2. `./klaviyo-relay.toml` (project-local)
//! 3. Environment overrides and CLI arguments (applied by the caller)

use std::path::{Path, PathBuf};

use crate::{ConfigError, RelayConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "klaviyo-relay.toml";

/// Default config filename within XDG config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "klaviyo-relay";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "KLAVIYO_RELAY_CONFIG_DIR";

/// Environment variable to override the data directory.
const DATA_DIR_ENV: &str = "KLAVIYO_RELAY_DATA_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: RelayConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (e.g., plaintext secrets).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Wrap a config loaded from one explicit file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = load_config_file(path)?;
        let mut warnings = Vec::new();
        check_plaintext_secrets(&config, &mut warnings);
        Ok(Self {
            config,
            sources: vec![ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }],
            warnings,
        })
    }

    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `KLAVIYO_RELAY_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = RelayConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => xdg_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut config, &path, &mut warnings)?);
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings)?);

    check_plaintext_secrets(&config, &mut warnings);

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    RelayConfig::from_toml(&contents)
}

/// Get the XDG config file path.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// Get the XDG config directory.
///
/// Checks `KLAVIYO_RELAY_CONFIG_DIR` first, then falls back to the platform default.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Directory for the Credential Store and log files.
///
/// Checks `KLAVIYO_RELAY_DATA_DIR` first, then the platform data dir,
/// then `./.klaviyo-relay`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".klaviyo-relay"))
}

/// Try to load a config file and merge it into the existing config.
fn load_layer(
    config: &mut RelayConfig,
    path: &Path,
    warnings: &mut Vec<String>,
) -> Result<ConfigSource> {
    if !path.is_file() {
        return Ok(ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        });
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            Ok(ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            })
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            Ok(ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            })
        }
    }
}

fn check_plaintext_secrets(config: &RelayConfig, warnings: &mut Vec<String>) {
    for field in config.plaintext_secrets() {
        warnings.push(format!(
            "{} is stored in plaintext config. Consider an environment variable instead.",
            field
        ));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
