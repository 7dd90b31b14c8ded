use super::Context;
use anyhow::Result;
use colored::Colorize;

pub async fn uninstall(ctx: &Context, formulae: &[String], force: bool) -> Result<u8> {
    for name in formulae {
        let receipt = ctx.installer.uninstall(name, force).await?;
        println!(
            "{} Uninstalled {} {} ({} links removed)",
            "✓".green(),
            receipt.formula_name.bold(),
            receipt.installed_version.dimmed(),
            receipt.linked_artifacts.len()
        );
    }
    Ok(0)
}
