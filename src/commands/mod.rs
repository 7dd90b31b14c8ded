//! Command implementations for the kegs CLI
//!
//! - **install**: resolve, fetch, build, validate and record formulae
//! - **uninstall**: remove an installed formula
//! - **query**: `status`, `list` and `deps`
//! - **fetch**: populate the download cache without installing
//!
//! Every command returns the process exit code it wants on success paths that
//! still failed partially (an install report with failures); hard errors
//! propagate as `anyhow::Error` and are mapped to exit codes in `main`.

pub mod fetch;
pub mod install;
pub mod query;
pub mod uninstall;

pub use fetch::fetch;
pub use install::install;
pub use query::{deps, list, status};
pub use uninstall::uninstall;

use crate::ui::CliReporter;
use anyhow::{Context as _, Result};
use indicatif::MultiProgress;
use kegsmith::{
    DefaultTransport, FileReceiptStore, FormulaIndex, InstallError, InstallFailure, Installer,
    Layout, Settings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs, built once from CLI flags
pub struct Context {
    pub layout: Layout,
    pub index: Arc<FormulaIndex>,
    pub installer: Installer,
}

impl Context {
    pub fn new(layout: Layout, formula_dir: &Path, settings: Settings) -> Result<Self> {
        let index = Arc::new(
            FormulaIndex::load_dir(formula_dir)
                .with_context(|| format!("Failed to load formulae from {}", formula_dir.display()))?,
        );
        tracing::debug!(formulae = index.len(), dir = %formula_dir.display(), "loaded formula index");

        let progress = MultiProgress::new();
        let installer = Installer::new(
            layout.clone(),
            index.clone(),
            Arc::new(FileReceiptStore::new(layout.receipts())),
            Arc::new(DefaultTransport::new()?),
            settings,
        )
        .with_reporter(Arc::new(CliReporter::new(progress.clone())))
        .with_progress(progress);

        Ok(Self {
            layout,
            index,
            installer,
        })
    }
}

/// Formula directory: `KEGS_FORMULA_DIR`, else `<prefix>/Formula`
pub fn default_formula_dir(layout: &Layout) -> PathBuf {
    match std::env::var_os("KEGS_FORMULA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => layout.prefix.join("Formula"),
    }
}

/// Exit code for an error that escaped a command
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(failure) = error.downcast_ref::<InstallFailure>() {
        return failure.exit_code();
    }
    if let Some(error) = error.downcast_ref::<InstallError>() {
        return error.exit_code();
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegsmith::Phase;

    #[test]
    fn test_exit_code_sees_through_anyhow() {
        let failure = InstallFailure::new("libx", Phase::Fetching, InstallError::FetchFailed {
            url: "https://example.com/libx.tgz".into(),
            attempts: 3,
            reason: "connection reset".into(),
        });
        assert_eq!(exit_code(&anyhow::Error::new(failure)), 3);
        assert_eq!(exit_code(&anyhow::Error::new(InstallError::Cancelled)), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
