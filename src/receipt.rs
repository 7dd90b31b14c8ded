//! Installation receipts and the store that owns them.
//!
//! A receipt is the durable record of one completed installation: which
//! version is active, where its keg lives, the digest of the source it was
//! built from, and which links it placed in the prefix. There is at most one
//! receipt per formula name.
//!
//! # Architecture
//!
//! Persistence sits behind [`ReceiptStore`] so the orchestration logic does not
//! care where receipts live. [`FileReceiptStore`] keeps one JSON file per
//! formula:
//! ```text
//! <prefix>/var/kegsmith/receipts/
//!   earthscii.json
//!   numpy.json
//! ```
//! Writes go to a temporary file that is renamed over the old receipt, so a
//! reader sees either the previous receipt or the new one, never a torn file.
//! Each operation locks only its formula name.
//!
//! # Examples
//!
//! ```no_run
//! use kegsmith::receipt::{FileReceiptStore, ReceiptStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = FileReceiptStore::new("/usr/local/kegsmith/var/kegsmith/receipts");
//!     if let Some(receipt) = store.current_receipt("earthscii").await? {
//!         println!("{} {} in {}", receipt.formula_name, receipt.installed_version,
//!             receipt.install_prefix.display());
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::Result;
use crate::lock::KeyedLocks;
use crate::verify::Digest;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Outcome of the post-install probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed {
        command: String,
        exit_status: String,
        output: String,
    },
    /// The formula declares no probe
    Skipped,
}

impl ValidationStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ValidationStatus::Failed { .. })
    }
}

/// Durable record of a completed installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationReceipt {
    pub formula_name: String,
    pub installed_version: String,
    pub install_prefix: PathBuf,
    pub fetched_digest: Digest,
    pub source_url: String,
    /// Unix seconds
    pub time: i64,
    #[serde(default)]
    pub linked_artifacts: BTreeSet<PathBuf>,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    #[serde(default)]
    pub installed_on_request: bool,
    #[serde(default)]
    pub enabled_options: BTreeSet<String>,
    pub validation: ValidationStatus,
    pub tool_version: String,
}

impl InstallationReceipt {
    /// Receipt stamped with the current time and this tool's version.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        formula_name: &str,
        installed_version: &str,
        install_prefix: PathBuf,
        fetched_digest: Digest,
        source_url: &str,
        runtime_dependencies: Vec<String>,
        installed_on_request: bool,
        enabled_options: BTreeSet<String>,
    ) -> Self {
        Self {
            formula_name: formula_name.to_string(),
            installed_version: installed_version.to_string(),
            install_prefix,
            fetched_digest,
            source_url: source_url.to_string(),
            time: chrono::Utc::now().timestamp(),
            linked_artifacts: BTreeSet::new(),
            runtime_dependencies,
            installed_on_request,
            enabled_options,
            validation: ValidationStatus::Skipped,
            tool_version: format!("kegsmith/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Install time formatted for display
    pub fn installed_at(&self) -> String {
        chrono::DateTime::from_timestamp(self.time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| self.time.to_string())
    }
}

/// Persistence for installation receipts, keyed by formula name.
///
/// Operations on one name are atomic; operations on different names do not
/// wait on each other.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Insert or replace the receipt for `receipt.formula_name`.
    async fn record_installation(&self, receipt: &InstallationReceipt) -> Result<()>;

    async fn current_receipt(&self, formula_name: &str) -> Result<Option<InstallationReceipt>>;

    /// Delete the receipt, returning the links it owned for the caller to remove.
    async fn remove_installation(&self, formula_name: &str) -> Result<Option<BTreeSet<PathBuf>>>;

    /// Every receipt, sorted by formula name.
    async fn list_receipts(&self) -> Result<Vec<InstallationReceipt>>;
}

/// One JSON file per formula in a directory
pub struct FileReceiptStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileReceiptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    fn receipt_path(&self, formula_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", formula_name))
    }

    fn read(path: &Path) -> Result<Option<InstallationReceipt>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let receipt = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse receipt: {}", path.display()))?;
        Ok(Some(receipt))
    }

    fn write_atomic(&self, path: &Path, receipt: &InstallationReceipt) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(receipt)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl ReceiptStore for FileReceiptStore {
    async fn record_installation(&self, receipt: &InstallationReceipt) -> Result<()> {
        let _guard = self.locks.lock(&receipt.formula_name).await;
        let path = self.receipt_path(&receipt.formula_name);
        self.write_atomic(&path, receipt)?;
        tracing::debug!(formula = %receipt.formula_name, path = %path.display(), "recorded receipt");
        Ok(())
    }

    async fn current_receipt(&self, formula_name: &str) -> Result<Option<InstallationReceipt>> {
        let _guard = self.locks.lock(formula_name).await;
        Self::read(&self.receipt_path(formula_name))
    }

    async fn remove_installation(&self, formula_name: &str) -> Result<Option<BTreeSet<PathBuf>>> {
        let _guard = self.locks.lock(formula_name).await;
        let path = self.receipt_path(formula_name);
        let Some(receipt) = Self::read(&path)? else {
            return Ok(None);
        };
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove receipt: {}", path.display()))?;
        Ok(Some(receipt.linked_artifacts))
    }

    async fn list_receipts(&self) -> Result<Vec<InstallationReceipt>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")
                    .filter(|stem| !stem.starts_with('.'))
                    .map(str::to_string)
            })
            .collect();
        names.sort();

        let mut receipts = Vec::with_capacity(names.len());
        for name in names {
            if let Some(receipt) = self.current_receipt(&name).await? {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }
}

/// Receipts held in memory only
#[derive(Default)]
pub struct MemoryReceiptStore {
    receipts: Mutex<BTreeMap<String, InstallationReceipt>>,
}

impl MemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn receipts(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstallationReceipt>> {
        self.receipts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn record_installation(&self, receipt: &InstallationReceipt) -> Result<()> {
        self.receipts()
            .insert(receipt.formula_name.clone(), receipt.clone());
        Ok(())
    }

    async fn current_receipt(&self, formula_name: &str) -> Result<Option<InstallationReceipt>> {
        Ok(self.receipts().get(formula_name).cloned())
    }

    async fn remove_installation(&self, formula_name: &str) -> Result<Option<BTreeSet<PathBuf>>> {
        Ok(self
            .receipts()
            .remove(formula_name)
            .map(|receipt| receipt.linked_artifacts))
    }

    async fn list_receipts(&self) -> Result<Vec<InstallationReceipt>> {
        Ok(self.receipts().values().cloned().collect())
    }
}

/// Runtime dependency edges of every installed formula
pub fn dependency_graph(receipts: &[InstallationReceipt]) -> HashMap<&str, &[String]> {
    receipts
        .iter()
        .map(|r| (r.formula_name.as_str(), r.runtime_dependencies.as_slice()))
        .collect()
}
