//! Totp command - print the current MFA code for diagnostics.

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;

use klaviyo_relay_auth::Totp;
use klaviyo_relay_auth::totp::unix_now;
use klaviyo_relay_config::{SecretKind, require_secret};

use super::Context;

#[derive(Args, Debug)]
pub struct TotpArgs {
    /// Base32 secret (default: KLAVIYO_TOTP_SECRET or config)
    #[arg(long)]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct TotpOutput {
    code: String,
    expires_in_secs: u64,
}

pub fn run(args: TotpArgs, ctx: &Context) -> Result<()> {
    let secret = match args.secret {
        Some(secret) => secret,
        None => require_secret(SecretKind::TotpSecret, &ctx.config)?.value,
    };
    let totp = Totp::from_base32(&secret).context("invalid TOTP secret")?;

    let now = unix_now();
    let output = TotpOutput {
        code: totp.code_at(now),
        expires_in_secs: Totp::seconds_remaining(now),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{} (valid {}s)", output.code, output.expires_in_secs);
    }
    Ok(())
}
