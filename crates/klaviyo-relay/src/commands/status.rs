//! Status command - proxy state plus the local Credential Store.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::Style;
use serde::Serialize;

use klaviyo_relay_client::{HealthReport, RelayStatus};

use super::Context;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Also run a live authorization check through the proxy
    #[arg(long)]
    pub health: bool,

    /// Credential Store path (overrides config)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    relay_url: String,
    relay: Option<RelayStatus>,
    relay_error: Option<String>,
    health: Option<HealthReport>,
    store: StoreOutput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreOutput {
    path: String,
    exists: bool,
    saved_at: Option<String>,
    age_secs: Option<u64>,
    cookies: Option<usize>,
    error: Option<String>,
}

pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let client = ctx.client()?;

    let (relay, relay_error) = match client.status().await {
        Ok(status) => (Some(status), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let health = if args.health && relay.as_ref().is_some_and(RelayStatus::is_ready) {
        match client.health().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                None
            }
        }
    } else {
        None
    };

    let store = ctx.store(args.store);
    let mut store_output = StoreOutput {
        path: store.path().display().to_string(),
        exists: store.exists(),
        saved_at: None,
        age_secs: None,
        cookies: None,
        error: None,
    };
    let mut age_display = None;
    if store_output.exists {
        match store.load() {
            Ok(state) => {
                let info = state.info();
                store_output.saved_at = Some(info.saved_at.to_rfc3339());
                store_output.age_secs = Some(info.age_secs);
                store_output.cookies = Some(info.cookie_count);
                age_display = Some(info.age_display());
            }
            Err(e) => store_output.error = Some(e.to_string()),
        }
    }

    let output = StatusOutput {
        relay_url: ctx.relay_url.clone(),
        relay,
        relay_error,
        health,
        store: store_output,
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!("Relay ({})", output.relay_url);
    match (&output.relay, &output.relay_error) {
        (Some(status), _) if status.is_ready() => {
            println!("  {} READY", green.apply_to("●"));
            if let Some(loaded) = &status.last_loaded {
                println!("  {} {}", dim.apply_to("Loaded:"), loaded);
            }
            if let Some(generation) = status.generation {
                println!("  {} {}", dim.apply_to("Generation:"), generation);
            }
        }
        (Some(status), _) => {
            println!("  {} {}", yellow.apply_to("●"), status.status);
            if let Some(error) = &status.last_error {
                println!("  {} {}", dim.apply_to("Last error:"), error);
            }
        }
        (None, Some(error)) => println!("  {} unreachable: {}", red.apply_to("●"), error),
        (None, None) => {}
    }

    if let Some(report) = &output.health {
        if report.is_authorized() {
            println!("  {} authorized", green.apply_to("✓"));
        } else {
            println!(
                "  {} {} ({})",
                red.apply_to("✗"),
                report.status,
                report.authentication_status.as_deref().unwrap_or("unknown")
            );
        }
    }

    println!();
    println!("Credential Store ({})", output.store.path);
    if let Some(error) = &output.store.error {
        println!("  {} unreadable: {}", red.apply_to("●"), error);
    } else if let (Some(cookies), Some(age)) = (output.store.cookies, age_display) {
        println!("  {} {} cookies, saved {}", green.apply_to("●"), cookies, age);
    } else {
        println!("  {} missing", yellow.apply_to("●"));
    }

    Ok(())
}
