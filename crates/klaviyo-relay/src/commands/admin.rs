//! Reload and save commands - poke a running proxy.

use anyhow::Result;
use console::Style;

use super::Context;

pub async fn reload(ctx: &Context) -> Result<()> {
    let reloaded = ctx.client()?.reload().await?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&reloaded)?);
    } else {
        println!(
            "{} session reloaded at {}",
            Style::new().green().apply_to("✓"),
            reloaded.last_loaded
        );
    }
    Ok(())
}

pub async fn save(ctx: &Context) -> Result<()> {
    let saved = ctx.client()?.save().await?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        println!(
            "{} {} cookies saved at {}",
            Style::new().green().apply_to("✓"),
            saved.cookies,
            saved.saved_at
        );
    }
    Ok(())
}
