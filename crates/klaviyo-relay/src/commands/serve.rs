//! Serve command - runs the forwarding proxy.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tokio::sync::watch;

use klaviyo_relay_auth::{Authenticator, SessionMaterializer, Supervisor, SupervisorSettings};
use klaviyo_relay_server::{RelayServer, ServerConfig, SessionSlot};

use super::Context;

/// Arguments for the serve command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Credential Store path (overrides config)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Also run the login scheduler in this process
    #[arg(long)]
    pub supervise: bool,

    /// Allow cross-origin callers
    #[arg(long)]
    pub cors: bool,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let mut server_config = ServerConfig::from_relay_config(&ctx.config)?.with_cors(args.cors);

    if args.port.is_some() || args.bind.is_some() {
        let ip: IpAddr = match &args.bind {
            Some(bind) => bind
                .parse()
                .with_context(|| format!("invalid bind address '{}'", bind))?,
            None => server_config.bind_address.ip(),
        };
        let port = args.port.unwrap_or(server_config.bind_address.port());
        server_config = server_config.with_bind_address(SocketAddr::new(ip, port));
    }

    let klaviyo = ctx.config.klaviyo();
    let store = ctx.store(args.store);
    let materializer = SessionMaterializer::from_config(&klaviyo);
    let slot = Arc::new(SessionSlot::new(store.clone(), materializer.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let supervisor = if args.supervise {
        let authenticator = Authenticator::from_config(&ctx.config)
            .context("--supervise needs credentials, TOTP secret and captcha key")?;
        let supervisor = Arc::new(
            Supervisor::new(
                Arc::new(authenticator),
                materializer,
                store.clone(),
                SupervisorSettings::from_config(&ctx.config.scheduler()),
            )
            .with_notifier(slot.clone()),
        );

        let task = supervisor.clone();
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            task.run(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            })
            .await;
        }))
    } else {
        None
    };

    if !ctx.json_output {
        println!("Credential Store: {}", store.path().display());
        println!("Listening on http://{}", server_config.bind_address);
    }

    let addr = server_config.bind_address;
    let mut rx = shutdown_rx;
    RelayServer::new(server_config, slot)
        .run_until(addr, async move {
            let _ = rx.wait_for(|stop| *stop).await;
        })
        .await?;

    if let Some(handle) = supervisor {
        let _ = handle.await;
    }
    Ok(())
}
