//! Authenticated-session forwarding proxy.
//!
//! Holds one live Klaviyo session, materialized from the Credential Store,
//! and lets local processes make upstream calls through it.
//!
//! # Endpoints
//!
//! - `GET /status` - load state, never touches the network
//! - `GET /health` - live authorization check with the current session
//! - `POST /request` - forward an arbitrary call through the session
//! - `POST /reload` - re-materialize from disk
//! - `POST /save` - persist the live session to disk
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use klaviyo_relay_server::{RelayServer, ServerConfig, SessionSlot};
//!
//! let slot = Arc::new(SessionSlot::new(store, materializer));
//! let server = RelayServer::new(ServerConfig::default(), slot);
//! server.run().await?;
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod watcher;

pub use config::ServerConfig;
pub use error::{ErrorResponse, NOT_LOADED, Result, ServerError};
pub use ratelimit::{rate_limit_middleware, request_logging_middleware};
pub use routes::{FileData, ForwardRequest};
pub use state::{AppState, READY, SessionSlot, SlotStatus};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, middleware, routing::post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// The forwarding proxy server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Create a server around `slot`.
    pub fn new(config: ServerConfig, slot: Arc<SessionSlot>) -> Self {
        Self {
            state: AppState::new(config, slot),
        }
    }

    /// Create a server from a pre-built application state.
    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn slot(&self) -> &Arc<SessionSlot> {
        &self.state.slot
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .merge(routes::health_routes())
            .route("/request", post(routes::forward_handler))
            .route("/reload", post(routes::reload_handler))
            .route("/save", post(routes::save_handler))
            .layer(DefaultBodyLimit::max(self.state.config.max_body_size))
            // Request logging (inner layer, runs first)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                ratelimit::request_logging_middleware,
            ))
            // Rate limiting (outer layer, runs before request logging)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                ratelimit::rate_limit_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        if self.state.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        router
    }

    /// Materialize the store once. A failure leaves the slot `NOT_LOADED`.
    pub fn load_initial(&self) {
        let path = self.state.slot.store().path().display().to_string();
        match self.state.slot.reload() {
            Ok(_) => info!(path = %path, "Initial session loaded"),
            Err(e) => warn!(path = %path, error = %e, "Starting without a session"),
        }
    }

    /// Run on the configured address until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.bind_address;
        self.run_on(addr).await
    }

    /// Run on a specific address until Ctrl-C.
    pub async fn run_on(self, addr: SocketAddr) -> Result<()> {
        self.run_until(addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
    }

    /// Run on `addr` until `shutdown` resolves.
    pub async fn run_until<S>(self, addr: SocketAddr, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        self.load_initial();
        let listener = bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Bind, spawn the server in the background and return the bound address.
    ///
    /// Binding port 0 picks an ephemeral port.
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<SocketAddr>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        self.load_initial();
        let listener = bind(self.state.config.bind_address).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("Failed to read local address: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = self.serve(listener, shutdown).await {
                tracing::error!(error = %e, "Server stopped with error");
            }
        });

        Ok(local_addr)
    }

    /// Serve with the store watcher alongside; both stop on `shutdown`.
    async fn serve<S>(self, listener: TcpListener, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let watcher = tokio::spawn(watcher::watch_store(
            self.state.slot.clone(),
            self.state.config.watch_interval,
            self.state.config.settle_delay,
            async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            },
        ));

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Relay listening");
        }

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(format!("Server error: {}", e)));

        let _ = stop_tx.send(true);
        if let Err(e) = watcher.await {
            tracing::error!(error = %e, "Credential store watcher task failed");
        }
        result
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Internal(format!("Failed to bind {}: {}", addr, e)))
}
