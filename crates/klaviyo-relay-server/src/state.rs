//! Application state shared across handlers.
//!
//! The live session sits in a [`SessionSlot`]. Handlers clone the inner
//! `Arc<LiveSession>` once per request and never touch the slot again, so a
//! concurrent reload replaces the session wholesale without affecting calls
//! already in flight.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use klaviyo_relay_auth::{
    AuthError, CredentialStore, LiveSession, ReloadNotifier, SessionMaterializer, SessionState,
};

use crate::config::ServerConfig;
use crate::error::{NOT_LOADED, Result, ServerError};
use crate::ratelimit::{SharedRateLimiter, create_rate_limiter};

/// Status value reported once a session is installed.
pub const READY: &str = "READY";

// ─────────────────────────────────────────────────────────────────────────────
// Session Slot
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SlotInner {
    session: Option<Arc<LiveSession>>,
    last_loaded: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Store mtime the slot last acted on. External changes differ from it.
    baseline: Option<SystemTime>,
}

/// Snapshot of the slot for `/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub status: &'static str,
    pub last_loaded: Option<DateTime<Utc>>,
    pub last_file_modified: Option<DateTime<Utc>>,
    pub generation: Option<u64>,
    pub last_error: Option<String>,
}

impl SlotStatus {
    pub fn is_ready(&self) -> bool {
        self.status == READY
    }
}

/// Replaceable holder for the live session, bound to one Credential Store.
pub struct SessionSlot {
    store: CredentialStore,
    materializer: SessionMaterializer,
    inner: RwLock<SlotInner>,
}

impl SessionSlot {
    /// Create an empty slot. Nothing is loaded until [`reload`](Self::reload).
    pub fn new(store: CredentialStore, materializer: SessionMaterializer) -> Self {
        Self {
            store,
            materializer,
            inner: RwLock::new(SlotInner::default()),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn materializer(&self) -> &SessionMaterializer {
        &self.materializer
    }

    /// The installed session, or `NotLoaded`.
    pub fn current(&self) -> Result<Arc<LiveSession>> {
        self.inner
            .read()
            .session
            .clone()
            .ok_or(ServerError::NotLoaded)
    }

    /// Materialize the on-disk store and swap it in.
    ///
    /// On failure the slot is cleared so status and forwarding report
    /// `NOT_LOADED` instead of serving a stale session.
    pub fn reload(&self) -> std::result::Result<DateTime<Utc>, AuthError> {
        let baseline = self.store.modified();

        match self.materializer.load(&self.store) {
            Ok(live) => {
                let generation = live.generation();
                let cookies = live.jar().len();
                let loaded_at = Utc::now();

                let mut inner = self.inner.write();
                inner.session = Some(Arc::new(live));
                inner.last_loaded = Some(loaded_at);
                inner.last_error = None;
                inner.baseline = baseline;
                drop(inner);

                info!(
                    path = %self.store.path().display(),
                    generation,
                    cookies,
                    "Session loaded"
                );
                Ok(loaded_at)
            }
            Err(e) => {
                let mut inner = self.inner.write();
                inner.session = None;
                inner.last_error = Some(e.to_string());
                inner.baseline = baseline;
                drop(inner);

                warn!(
                    path = %self.store.path().display(),
                    error = %e,
                    "Session load failed"
                );
                Err(e)
            }
        }
    }

    /// Persist the live session and move the watcher baseline past the write.
    pub fn save(&self) -> Result<SessionState> {
        let live = self.current()?;
        let state = self.materializer.persist(&live, &self.store)?;
        self.inner.write().baseline = self.store.modified();
        Ok(state)
    }

    /// Whether the store changed since the slot last read or wrote it.
    pub fn changed(&self) -> bool {
        match self.store.modified() {
            Some(modified) => self.inner.read().baseline != Some(modified),
            None => false,
        }
    }

    pub fn status(&self) -> SlotStatus {
        let last_file_modified = self.store.modified().map(DateTime::<Utc>::from);
        let inner = self.inner.read();

        SlotStatus {
            status: if inner.session.is_some() {
                READY
            } else {
                NOT_LOADED
            },
            last_loaded: inner.last_loaded,
            last_file_modified,
            generation: inner.session.as_ref().map(|s| s.generation()),
            last_error: inner.last_error.clone(),
        }
    }
}

#[async_trait]
impl ReloadNotifier for SessionSlot {
    async fn notify_reload(&self) -> klaviyo_relay_auth::Result<()> {
        self.reload().map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AppState
// ─────────────────────────────────────────────────────────────────────────────

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// The live session holder.
    pub slot: Arc<SessionSlot>,

    /// Global request limiter.
    pub limiter: SharedRateLimiter,
}

impl AppState {
    /// Create a new application state.
    pub fn new(config: ServerConfig, slot: Arc<SessionSlot>) -> Self {
        let limiter = create_rate_limiter(config.requests_per_minute);
        Self {
            config: Arc::new(config),
            slot,
            limiter,
        }
    }
}
