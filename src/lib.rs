//! Library interface for the kegsmith formula installer
//!
//! The engine resolves a formula's dependency graph, fetches and verifies
//! sources into a content-addressed cache, runs install steps in a scoped
//! environment, probes the result and records a receipt. The `kegs` binary is
//! a thin CLI over [`Installer`].
//!
//! ```no_run
//! use kegsmith::{DefaultTransport, FileReceiptStore, FormulaIndex, InstallRequest, Installer, Layout, Settings};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let layout = Layout::detect();
//! let index = FormulaIndex::load_dir("Formula".as_ref())?;
//! let installer = Installer::new(
//!     layout.clone(),
//!     Arc::new(index),
//!     Arc::new(FileReceiptStore::new(layout.receipts())),
//!     Arc::new(DefaultTransport::new()?),
//!     Settings::default(),
//! );
//!
//! let report = installer
//!     .install(&InstallRequest::new("earthscii"), &CancellationToken::new())
//!     .await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod cellar;
pub mod download;
pub mod error;
pub mod executor;
pub mod extract;
pub mod formula;
pub mod installer;
pub mod lock;
pub mod receipt;
pub mod relocate;
pub mod resolve;
pub mod symlink;
pub mod validate;
pub mod verify;

// Re-export commonly used types
pub use cellar::Layout;
pub use download::{DefaultTransport, RetryPolicy, SourceFetcher, Transport, TransportError};
pub use error::{InstallError, InstallFailure, Phase};
pub use formula::{FormulaIndex, FormulaLookup, FormulaRecord, InstallStep};
pub use installer::{
    InstallReport, InstallRequest, InstallStatus, Installer, Outcome, Reporter, Settings,
};
pub use receipt::{
    FileReceiptStore, InstallationReceipt, MemoryReceiptStore, ReceiptStore, ValidationStatus,
};
pub use symlink::normalize_path;
pub use validate::ValidationPolicy;
pub use verify::Digest;
