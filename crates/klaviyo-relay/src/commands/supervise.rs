//! Supervise command - scheduled logins that feed a running proxy.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use console::Style;
use serde_json::json;

use klaviyo_relay_auth::{
    Authenticator, CycleOutcome, HttpReloadNotifier, Supervisor, SupervisorSettings,
};

use super::Context;

#[derive(Args, Debug)]
pub struct SuperviseArgs {
    /// Reload endpoint to notify (default: scheduler.reload_url, then <relay>/reload)
    #[arg(long)]
    pub reload_url: Option<String>,

    /// Credential Store path (overrides config)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Do not notify the proxy after a refresh
    #[arg(long)]
    pub no_notify: bool,
}

pub async fn run(args: SuperviseArgs, ctx: &Context) -> Result<()> {
    let authenticator = Authenticator::from_config(&ctx.config)?;
    let materializer = authenticator.materializer().clone();
    let store = ctx.store(args.store);
    let scheduler = ctx.config.scheduler();

    let mut supervisor = Supervisor::new(
        Arc::new(authenticator),
        materializer,
        store,
        SupervisorSettings::from_config(&scheduler),
    );

    if !args.no_notify {
        let url = args
            .reload_url
            .or(scheduler.reload_url.clone())
            .unwrap_or_else(|| format!("{}/reload", ctx.relay_url.trim_end_matches('/')));
        tracing::info!(url = %url, "Reload notifications enabled");
        supervisor = supervisor.with_notifier(Arc::new(HttpReloadNotifier::new(url)?));
    }

    if !args.once {
        supervisor
            .run(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                }
            })
            .await;
        return Ok(());
    }

    match supervisor.run_cycle().await {
        CycleOutcome::Refreshed { attempts, elapsed } => {
            if ctx.json_output {
                let output = json!({
                    "outcome": "refreshed",
                    "attempts": attempts,
                    "elapsedMs": elapsed.as_millis() as u64,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!(
                    "{} session refreshed after {} attempt(s) in {:.1}s",
                    Style::new().green().apply_to("✓"),
                    attempts,
                    elapsed.as_secs_f64()
                );
            }
            Ok(())
        }
        CycleOutcome::GaveUp {
            attempts,
            last_error,
        } => bail!("login failed after {} attempt(s): {}", attempts, last_error),
        CycleOutcome::Skipped => bail!("a login cycle is already running"),
    }
}
