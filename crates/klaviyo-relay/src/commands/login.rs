//! Login command - one Authenticator run, persisted to the Credential Store.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Args;
use console::Style;
use serde::Serialize;

use klaviyo_relay_auth::Authenticator;

use super::Context;

#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Credential Store path (overrides config)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Ask the running proxy to reload afterwards
    #[arg(long)]
    pub notify: bool,
}

#[derive(Debug, Serialize)]
struct LoginOutput {
    store: String,
    cookies: usize,
    saved_at: String,
    elapsed_ms: u64,
    reloaded: Option<bool>,
}

pub async fn run(args: LoginArgs, ctx: &Context) -> Result<()> {
    let authenticator = Authenticator::from_config(&ctx.config)?;
    let store = ctx.store(args.store);

    let started = Instant::now();
    let live = match authenticator.login().await {
        Ok(live) => live,
        Err(e) => {
            tracing::error!(step = e.step(), error = %e, "Login failed");
            return Err(e.into());
        }
    };
    let state = authenticator.materializer().persist(&live, &store)?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let reloaded = if args.notify {
        match ctx.client()?.reload().await {
            Ok(_) => Some(true),
            Err(e) => {
                tracing::warn!(relay = %ctx.relay_url, error = %e, "Reload request failed");
                Some(false)
            }
        }
    } else {
        None
    };

    let output = LoginOutput {
        store: store.path().display().to_string(),
        cookies: state.cookies.len(),
        saved_at: state.saved_at.to_rfc3339(),
        elapsed_ms,
        reloaded,
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let green = Style::new().green();
        let dim = Style::new().dim();
        println!(
            "{} logged in ({} cookies, {:.1}s)",
            green.apply_to("✓"),
            output.cookies,
            elapsed_ms as f64 / 1000.0
        );
        println!("  {} {}", dim.apply_to("Store:"), output.store);
        match reloaded {
            Some(true) => println!("  {} reloaded", dim.apply_to("Relay:")),
            Some(false) => println!("  {} reload failed", dim.apply_to("Relay:")),
            None => {}
        }
    }
    Ok(())
}
