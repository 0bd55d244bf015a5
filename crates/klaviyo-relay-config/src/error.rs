//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// Missing required field.
    #[error("missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    /// Secret not found through any resolution method.
    #[error("{name} not found. Set the {env_var} environment variable or add it to the config file")]
    SecretNotFound { name: String, env_var: String },
}
