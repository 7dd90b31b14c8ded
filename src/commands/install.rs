use super::Context;
use anyhow::Result;
use colored::Colorize;
use kegsmith::{InstallRequest, Outcome, ValidationPolicy};
use std::collections::BTreeSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub async fn install(
    ctx: &Context,
    formulae: &[String],
    options: &[String],
    rollback_on_validation_failure: bool,
    cancel: &CancellationToken,
) -> Result<u8> {
    let request = InstallRequest {
        formulae: formulae.to_vec(),
        options: options.iter().cloned().collect::<BTreeSet<_>>(),
        validation: if rollback_on_validation_failure {
            ValidationPolicy::RollBack
        } else {
            ValidationPolicy::KeepAndWarn
        },
    };

    let start = Instant::now();
    let report = ctx.installer.install(&request, cancel).await?;

    let installed = report
        .outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Outcome::Installed(_)))
        .count();
    let degraded: Vec<&str> = report
        .outcomes
        .iter()
        .filter_map(|(name, outcome)| {
            outcome
                .receipt()
                .filter(|receipt| receipt.validation.is_failed())
                .map(|_| name.as_str())
        })
        .collect();
    let failed = report.failures().count();

    println!();
    if failed == 0 {
        println!(
            "{} Installed {} {} in {:.1}s",
            "✓".green().bold(),
            installed.to_string().bold(),
            if installed == 1 { "formula" } else { "formulae" },
            start.elapsed().as_secs_f64()
        );
    } else {
        println!(
            "{} {} of {} formulae failed",
            "✗".red().bold(),
            failed.to_string().bold(),
            report.outcomes.len()
        );
    }
    if !degraded.is_empty() {
        println!(
            "{} Validation failed for {}; run `kegs status <formula>` for details",
            "⚠".yellow(),
            degraded.join(", ").bold()
        );
    }

    Ok(report.exit_code())
}
