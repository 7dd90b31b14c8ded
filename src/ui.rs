//! Terminal output: color control and the CLI progress reporter.

use colored::{Colorize, control};
use indicatif::MultiProgress;
use kegsmith::{InstallFailure, InstallationReceipt, Phase, Reporter, ValidationStatus};

/// Configure colors from `NO_COLOR`, `CLICOLOR_FORCE`, `CLICOLOR` and TTY status.
///
/// `NO_COLOR` (any value) wins over everything, then `CLICOLOR_FORCE`, then
/// `CLICOLOR=0`. Otherwise colors follow whether stdout is a terminal.
pub fn init_colors() {
    if std::env::var_os("NO_COLOR").is_some() {
        control::set_override(false);
        return;
    }

    if std::env::var("CLICOLOR_FORCE")
        .map(|v| v != "0")
        .unwrap_or(false)
    {
        control::set_override(true);
        return;
    }

    if std::env::var("CLICOLOR").map(|v| v == "0").unwrap_or(false) {
        control::set_override(false);
        return;
    }

    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    control::set_override(is_tty);
}

/// Prints one line per phase transition, above any live progress bars
pub struct CliReporter {
    progress: MultiProgress,
}

impl CliReporter {
    pub fn new(progress: MultiProgress) -> Self {
        Self { progress }
    }

    fn line(&self, message: String) {
        // A hidden draw target (stdout not a terminal) swallows println
        if self.progress.is_hidden() || self.progress.println(&message).is_err() {
            println!("{}", message);
        }
    }
}

impl Reporter for CliReporter {
    fn phase(&self, formula: &str, phase: Phase) {
        match phase {
            Phase::Installing => self.line(format!("{} Installing {}", "==>".blue().bold(), formula.bold())),
            Phase::Validating => self.line(format!("    ├ Validating {}", formula)),
            _ => tracing::debug!(formula, %phase, "phase"),
        }
    }

    fn already_installed(&self, receipt: &InstallationReceipt) {
        self.line(format!(
            "{} {} {} already installed",
            "✓".green(),
            receipt.formula_name.bold(),
            receipt.installed_version.dimmed()
        ));
    }

    fn installed(&self, receipt: &InstallationReceipt) {
        if let ValidationStatus::Failed { command, exit_status, .. } = &receipt.validation {
            self.line(format!(
                "    ├ {} `{}` failed with {}",
                "⚠".yellow(),
                command,
                exit_status
            ));
        }
        self.line(format!(
            "    └ {} Installed {} {}",
            "✓".green(),
            receipt.formula_name.bold().green(),
            receipt.installed_version.dimmed()
        ));
    }

    fn failed(&self, failure: &InstallFailure) {
        self.line(format!("{} {}", "✗".red(), failure));
    }
}
