//! Secret resolution for account credentials and provider keys.
//!
//! Resolution order:
//! 1. Environment variable
//! 2. Config file (with warning at load time)

use crate::{ConfigError, RelayConfig, Result};

/// Secrets the relay needs to log in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Email,
    Password,
    TotpSecret,
    CaptchaApiKey,
}

impl SecretKind {
    /// Environment variable name for this secret.
    pub fn env_var(&self) -> &'static str {
        match self {
            SecretKind::Email => "KLAVIYO_EMAIL",
            SecretKind::Password => "KLAVIYO_PASSWORD",
            SecretKind::TotpSecret => "KLAVIYO_TOTP_SECRET",
            SecretKind::CaptchaApiKey => "CAPTCHA_API_KEY",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            SecretKind::Email => "account email",
            SecretKind::Password => "account password",
            SecretKind::TotpSecret => "TOTP secret",
            SecretKind::CaptchaApiKey => "CAPTCHA API key",
        }
    }

    fn config_value<'a>(&self, config: &'a RelayConfig) -> Option<&'a str> {
        match self {
            SecretKind::Email => config.klaviyo.as_ref()?.email.as_deref(),
            SecretKind::Password => config.klaviyo.as_ref()?.password.as_deref(),
            SecretKind::TotpSecret => config.klaviyo.as_ref()?.totp_secret.as_deref(),
            SecretKind::CaptchaApiKey => config.captcha.as_ref()?.api_key.as_deref(),
        }
    }
}

/// Result of secret resolution with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The secret value.
    pub value: String,
    /// Where the secret was found.
    pub source: SecretSource,
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Environment variable.
    EnvVar(String),
    /// Config file (plaintext, not recommended).
    ConfigFile,
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
        }
    }
}

/// Resolve a secret from the process environment, then the config.
pub fn resolve_secret(kind: SecretKind, config: &RelayConfig) -> Option<ResolvedSecret> {
    resolve_secret_with(kind, config, |k| std::env::var(k).ok())
}

/// Resolve a secret using an explicit environment lookup.
pub fn resolve_secret_with<F>(
    kind: SecretKind,
    config: &RelayConfig,
    lookup: F,
) -> Option<ResolvedSecret>
where
    F: Fn(&str) -> Option<String>,
{
    let env_var = kind.env_var();
    if let Some(value) = lookup(env_var).filter(|v| !v.is_empty()) {
        return Some(ResolvedSecret {
            value,
            source: SecretSource::EnvVar(env_var.to_string()),
        });
    }

    kind.config_value(config)
        .filter(|v| !v.is_empty())
        .map(|v| ResolvedSecret {
            value: v.to_string(),
            source: SecretSource::ConfigFile,
        })
}

/// Resolve a secret or fail with a message naming the env var.
pub fn require_secret(kind: SecretKind, config: &RelayConfig) -> Result<ResolvedSecret> {
    resolve_secret(kind, config).ok_or_else(|| ConfigError::SecretNotFound {
        name: kind.display_name().to_string(),
        env_var: kind.env_var().to_string(),
    })
}
