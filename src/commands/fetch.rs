use super::Context;
use anyhow::Result;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

pub async fn fetch(ctx: &Context, formulae: &[String], cancel: &CancellationToken) -> Result<u8> {
    let fetched = ctx.installer.fetch(formulae, cancel).await?;

    for (name, source) in &fetched {
        let origin = if source.cached { "cached" } else { "downloaded" };
        println!(
            "{} {} {} {}",
            "✓".green(),
            name.bold(),
            origin.dimmed(),
            source.path.display()
        );
    }
    Ok(0)
}
