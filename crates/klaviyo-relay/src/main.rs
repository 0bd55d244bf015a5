//! klaviyo-relay - keep an authenticated Klaviyo session alive and share it
//!
//! Main entry point for the klaviyo-relay CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{admin, login, serve, status, supervise, totp};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// klaviyo-relay - Authenticated Klaviyo session proxy
#[derive(Parser)]
#[command(name = "klaviyo-relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to config file (overrides default discovery)
    #[arg(long, global = true, env = "KLAVIYO_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Relay URL for status/reload/save (default: http://127.0.0.1:<server.port>)
    #[arg(long, global = true, env = "KLAVIYO_RELAY_URL")]
    pub relay: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the forwarding proxy
    Serve(serve::ServeArgs),

    /// Log in once and write the Credential Store
    Login(login::LoginArgs),

    /// Log in now and on a schedule, notifying a running proxy
    Supervise(supervise::SuperviseArgs),

    /// Show proxy and Credential Store status
    Status(status::StatusArgs),

    /// Tell a running proxy to reload the Credential Store
    Reload,

    /// Tell a running proxy to persist its live session
    Save,

    /// Print the current MFA code
    Totp(totp::TotpArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = commands::load_config(cli.config.as_deref())?;
    let _guard = logging::init(cli.verbose, &loaded.config.logging());

    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Loaded config");
    }

    let ctx = commands::Context::new(loaded.config, cli.relay, cli.json, cli.verbose);

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Login(args) => login::run(args, &ctx).await,
        Commands::Supervise(args) => supervise::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Reload => admin::reload(&ctx).await,
        Commands::Save => admin::save(&ctx).await,
        Commands::Totp(args) => totp::run(args, &ctx),
    }
}
