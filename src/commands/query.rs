use super::Context;
use anyhow::Result;
use colored::Colorize;
use kegsmith::{FormulaIndex, InstallStatus, ValidationStatus};
use std::collections::HashSet;

pub async fn status(ctx: &Context, formula: &str) -> Result<u8> {
    let kegs = ctx.layout.installed_versions(formula)?;

    let receipt = match ctx.installer.status(formula).await? {
        InstallStatus::NotInstalled => {
            println!("{} is not installed", formula.bold());
            if !kegs.is_empty() {
                println!("  Stray kegs: {}", kegs.join(", ").yellow());
            }
            return Ok(1);
        }
        InstallStatus::Installed(receipt) => receipt,
    };

    println!(
        "{} {}",
        receipt.formula_name.bold().green(),
        receipt.installed_version
    );
    println!("  Keg:        {}", receipt.install_prefix.display());
    println!("  Source:     {}", receipt.source_url);
    println!("  SHA-256:    {}", receipt.fetched_digest);
    println!("  Installed:  {}", receipt.installed_at());
    println!(
        "  Requested:  {}",
        if receipt.installed_on_request { "yes" } else { "no (dependency)" }
    );
    if !receipt.runtime_dependencies.is_empty() {
        println!("  Depends on: {}", receipt.runtime_dependencies.join(", "));
    }
    if !receipt.enabled_options.is_empty() {
        let options: Vec<&str> = receipt.enabled_options.iter().map(String::as_str).collect();
        println!("  Options:    {}", options.join(", "));
    }
    println!("  Links:      {}", receipt.linked_artifacts.len());

    // Kegs in the Cellar that no receipt owns
    let stray: Vec<&str> = kegs
        .iter()
        .map(String::as_str)
        .filter(|v| *v != receipt.installed_version)
        .collect();
    if !stray.is_empty() {
        println!("  Stray kegs: {}", stray.join(", ").yellow());
    }

    match &receipt.validation {
        ValidationStatus::Passed => println!("  Validation: {}", "passed".green()),
        ValidationStatus::Skipped => println!("  Validation: {}", "skipped".dimmed()),
        ValidationStatus::Failed {
            command,
            exit_status,
            output,
        } => {
            println!(
                "  Validation: {} (`{}` exited with {})",
                "failed".red(),
                command,
                exit_status
            );
            for line in output.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev() {
                println!("    {}", line.dimmed());
            }
        }
    }
    Ok(0)
}

pub async fn list(ctx: &Context, json: bool) -> Result<u8> {
    let receipts = ctx.installer.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&receipts)?);
        return Ok(0);
    }

    // Piped output is names only, one per line
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    if !is_tty {
        for receipt in &receipts {
            println!("{}", receipt.formula_name);
        }
        return Ok(0);
    }

    if receipts.is_empty() {
        println!("No formulae installed in {}", ctx.layout.prefix.display());
        return Ok(0);
    }

    for receipt in &receipts {
        let marker = if receipt.validation.is_failed() {
            format!(" {}", "(validation failed)".yellow())
        } else {
            String::new()
        };
        let name = if receipt.installed_on_request {
            receipt.formula_name.bold().to_string()
        } else {
            receipt.formula_name.normal().to_string()
        };
        println!("{} {}{}", name, receipt.installed_version.dimmed(), marker);
    }
    Ok(0)
}

pub async fn deps(ctx: &Context, formula: &str, tree: bool) -> Result<u8> {
    let plan = ctx.installer.plan(&[formula.to_string()])?;

    if tree {
        println!("{}", formula.bold());
        let mut seen = HashSet::new();
        print_tree(&ctx.index, formula, "", &mut seen);
        return Ok(0);
    }

    for record in plan.iter().filter(|r| r.name != formula) {
        println!("{}", record.name);
    }
    Ok(0)
}

fn print_tree(index: &FormulaIndex, name: &str, indent: &str, seen: &mut HashSet<String>) {
    let Some(record) = index.get(name) else {
        return;
    };

    for (i, dep) in record.dependencies.iter().enumerate() {
        let last = i + 1 == record.dependencies.len();
        let branch = if last { "└── " } else { "├── " };
        let repeat = !seen.insert(dep.clone());

        if repeat {
            println!("{}{}{} {}", indent, branch, dep, "(see above)".dimmed());
            continue;
        }
        println!("{}{}{}", indent, branch, dep);

        let child_indent = format!("{}{}", indent, if last { "    " } else { "│   " });
        print_tree(index, dep, &child_indent, seen);
    }
}
