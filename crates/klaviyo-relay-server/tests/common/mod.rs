//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::timeout;

use klaviyo_relay_auth::{CredentialStore, SessionMaterializer, StoredCookie};
use klaviyo_relay_config::KlaviyoConfig;
use klaviyo_relay_server::{RelayServer, ServerConfig, SessionSlot};

/// Header written into every test store so echoes can be matched to a generation.
pub const MARKER_HEADER: &str = "x-relay-test";

/// A relay running in the background against a stubbed upstream.
pub struct TestServer {
    /// The relay's address.
    pub addr: SocketAddr,
    /// Plain HTTP client for talking to the relay.
    pub client: Client,
    /// The session slot the relay serves from.
    pub slot: Arc<SessionSlot>,
    /// Credential Store the relay loads.
    pub store: CredentialStore,
    /// Materializer matching the relay's upstream.
    pub materializer: SessionMaterializer,
    shutdown: Option<oneshot::Sender<()>>,
    /// Temporary directory holding the store.
    pub temp_dir: TempDir,
}

impl TestServer {
    /// Start a relay for `upstream`, with a store holding `token` when given.
    pub async fn start(upstream: &str, token: Option<&str>) -> Result<Self> {
        Self::start_with(upstream, token, |c| c).await
    }

    /// Start with extra config adjustments.
    pub async fn start_with(
        upstream: &str,
        token: Option<&str>,
        configure: impl FnOnce(ServerConfig) -> ServerConfig,
    ) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let store = CredentialStore::new(temp_dir.path().join("session.json"));

        let klaviyo = KlaviyoConfig {
            base_url: upstream.to_string(),
            cookie_domains: Vec::new(),
            ..Default::default()
        };
        let materializer = SessionMaterializer::from_config(&klaviyo);

        if let Some(token) = token {
            write_store(&materializer, &store, token)?;
        }

        let config = configure(
            ServerConfig::new()
                .with_bind_address("127.0.0.1:0".parse()?)
                .with_rate_limiting(false)
                .with_request_logging(false)
                .with_authorization_url(format!("{}/ajax/authorization", upstream)),
        );

        let slot = Arc::new(SessionSlot::new(store.clone(), materializer.clone()));
        let server = RelayServer::new(config, slot.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let addr = server
            .run_with_shutdown(async {
                let _ = rx.await;
            })
            .await?;

        let client = Client::new();
        wait_for_server(&client, addr).await?;

        Ok(Self {
            addr,
            client,
            slot,
            store,
            materializer,
            shutdown: Some(tx),
            temp_dir,
        })
    }

    /// Get the base URL for the relay.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{}", self.base_url(), path))
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{}", self.base_url(), path))
    }

    /// POST a forwarding request body to `/request`.
    pub async fn forward(&self, body: Value) -> Result<reqwest::Response> {
        Ok(self.post("/request").json(&body).send().await?)
    }

    /// Replace the on-disk store with a session for `token`.
    pub fn write_store(&self, token: &str) -> Result<()> {
        write_store(&self.materializer, &self.store, token)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Persist a session whose csrf cookie and marker header both carry `token`.
pub fn write_store(
    materializer: &SessionMaterializer,
    store: &CredentialStore,
    token: &str,
) -> Result<()> {
    let live = materializer.fresh()?;
    live.jar()
        .insert(StoredCookie::new("kl_csrftoken", token, "127.0.0.1"));

    let mut state = materializer.snapshot(&live);
    state
        .headers
        .insert(MARKER_HEADER.to_string(), token.to_string());
    store.save(&state)?;
    Ok(())
}

/// Wait for the relay to answer `/status`.
async fn wait_for_server(client: &Client, addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/status", addr);

    let result = timeout(Duration::from_secs(5), async {
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => anyhow::bail!("Timeout waiting for relay to start"),
    }
}
