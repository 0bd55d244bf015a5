//! Browser-less Klaviyo login and session persistence.
//!
//! # Components
//!
//! - [`cookies`]: cookie jar with persisted attributes, plugged into reqwest
//! - [`store`]: Credential Store: atomic JSON snapshot of a session
//! - [`session`]: live sessions and the materializer (snapshot / restore)
//! - [`captcha`]: 2Captcha and CapSolver behind one trait
//! - [`totp`]: RFC 6238 codes for the MFA step
//! - [`login`]: the Authenticator state machine
//! - [`scheduler`]: periodic refresh with bounded retries
//! - [`retry`]: fixed-delay retry helper shared by MFA and the scheduler

pub mod captcha;
pub mod cookies;
pub mod error;
pub mod login;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod totp;

pub use captcha::{
    CaptchaRequest, CaptchaSolver, CapSolverSolver, PollSettings, SharedCaptchaSolver,
    TwoCaptchaSolver, build_solver,
};
pub use cookies::{CSRF_COOKIE, SessionJar, StoredCookie, dedup_latest};
pub use error::{AuthError, Result};
pub use login::{
    AuthorizationStatus, Authenticator, Credentials, LoginAttempt, LoginEndpoints, LoginSettings,
    UnixClock, check_authorization, generate_fingerprint,
};
pub use retry::{RetryPolicy, retry_fixed};
pub use scheduler::{
    CycleOutcome, HttpReloadNotifier, LoginFlow, ReloadNotifier, SharedReloadNotifier,
    Supervisor, SupervisorSettings,
};
pub use session::{CSRF_HEADER, LiveSession, SessionMaterializer, SessionSettings};
pub use store::{CredentialStore, STORE_VERSION, SessionState, StoreInfo};
pub use totp::Totp;
