//! Error types for login automation and session persistence.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors raised while logging in, persisting or restoring a session.
///
/// The first six variants form the login failure taxonomy; each names the
/// step that failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The login page could not be loaded.
    #[error("Login page fetch failed: {0}")]
    LoginPageFetchFailed(String),

    /// The CAPTCHA provider rejected the job or never produced a token.
    #[error("CAPTCHA solve failed: {0}")]
    CaptchaSolveFailed(String),

    /// No anti-forgery cookie after loading the login page.
    #[error("Missing CSRF token: no {0} cookie after loading the login page")]
    MissingCsrfToken(String),

    /// Credential submission returned a failure or an unexpected response.
    #[error("Credential submission failed: {0}")]
    CredentialSubmissionFailed(String),

    /// Every MFA attempt was rejected.
    #[error("MFA failed after {attempts} attempts: {last_error}")]
    MfaExhausted { attempts: u32, last_error: String },

    /// The authorization check did not report a fully authenticated session.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Credential Store I/O failure.
    #[error("Credential store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network/HTTP error outside the login steps.
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// The TOTP secret is not valid base32.
    #[error("Invalid TOTP secret: {0}")]
    Totp(String),
}

impl AuthError {
    /// Name of the step that produced this error, for logs.
    pub fn step(&self) -> &'static str {
        match self {
            AuthError::LoginPageFetchFailed(_) => "fetch_login_page",
            AuthError::CaptchaSolveFailed(_) => "solve_captcha",
            AuthError::MissingCsrfToken(_) => "extract_csrf",
            AuthError::CredentialSubmissionFailed(_) => "submit_credentials",
            AuthError::MfaExhausted { .. } => "submit_mfa",
            AuthError::VerificationFailed(_) => "verify",
            AuthError::Store(_) => "store",
            AuthError::Serialization(_) => "serialize",
            AuthError::Network(_) => "network",
            AuthError::Config(_) => "config",
            AuthError::Totp(_) => "totp",
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Serialization(e.to_string())
    }
}

impl From<klaviyo_relay_config::ConfigError> for AuthError {
    fn from(e: klaviyo_relay_config::ConfigError) -> Self {
        AuthError::Config(e.to_string())
    }
}
