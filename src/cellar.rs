//! Filesystem layout: prefix, Cellar, caches and state directories.
//!
//! ```text
//! <prefix>/
//!   Cellar/<formula>/<version>/     installed kegs
//!   Cellar/.staging/                scoped working directories
//!   bin/ lib/ share/ …              symlinks into kegs
//!   var/kegsmith/receipts/          one receipt per formula
//! <cache>/<sha256>                  verified source archives
//! ```

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_PREFIX: &str = "/usr/local/kegsmith";

/// Directory layout used by one installer instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub prefix: PathBuf,
    pub cache: PathBuf,
}

impl Layout {
    pub fn new(prefix: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            cache: cache.into(),
        }
    }

    /// Layout from `KEGS_PREFIX` and the XDG cache directory.
    pub fn detect() -> Self {
        Self::new(detect_prefix(), cache_dir())
    }

    pub fn cellar(&self) -> PathBuf {
        self.prefix.join("Cellar")
    }

    pub fn keg_path(&self, formula: &str, version: &str) -> PathBuf {
        self.cellar().join(formula).join(version)
    }

    pub fn staging(&self) -> PathBuf {
        self.cellar().join(".staging")
    }

    pub fn receipts(&self) -> PathBuf {
        self.prefix.join("var/kegsmith/receipts")
    }

    pub fn bin(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    /// Create the directories every operation expects.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.cellar(), self.staging(), self.receipts(), self.cache.clone()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Versions of `formula` present in the Cellar, newest first.
    pub fn installed_versions(&self, formula: &str) -> Result<Vec<String>> {
        let formula_dir = self.cellar().join(formula);
        if !formula_dir.exists() {
            return Ok(vec![]);
        }

        let mut versions: Vec<String> = fs::read_dir(&formula_dir)
            .with_context(|| format!("Failed to read {}", formula_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|version| !version.starts_with('.'))
            .collect();

        versions.sort_by(|a, b| compare_versions(b, a));
        Ok(versions)
    }
}

/// Detect the install prefix on this system
pub fn detect_prefix() -> PathBuf {
    if let Some(prefix) = std::env::var_os("KEGS_PREFIX") {
        return PathBuf::from(prefix);
    }
    PathBuf::from(DEFAULT_PREFIX)
}

/// Get the download cache directory (~/.cache/kegsmith/downloads or equivalent)
pub fn cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("kegsmith/downloads")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/kegsmith/downloads")
    } else {
        PathBuf::from(".cache/kegsmith/downloads")
    }
}

/// Remove `dir` if it exists and is empty.
pub fn remove_if_empty(dir: &Path) -> Result<()> {
    if dir.is_dir() && fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

/// Compare two version strings numerically, falling back to lexicographic order
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<u32> = a.split('.').filter_map(|s| s.parse::<u32>().ok()).collect();
    let b_parts: Vec<u32> = b.split('.').filter_map(|s| s.parse::<u32>().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
