//! Formula records and lookup.
//!
//! A [`FormulaRecord`] is the in-memory form of one formula: where its source
//! lives, the digest that source must match, what it depends on, the install
//! steps to run and the probe that proves the result works. Records are
//! immutable once loaded.
//!
//! Formulae are stored as one JSON document per file:
//!
//! ```json
//! {
//!   "name": "earthscii",
//!   "desc": "Terminal-based 3D Earth terrain viewer",
//!   "url": "https://github.com/Kirito139/earthscii/archive/refs/tags/v0.1.0.tar.gz",
//!   "sha256": "4737b318ac9a37240fa1d95f6ec7114467f195408163f8a0e2a7fb69e364bd4d",
//!   "dependencies": ["python@3.11", "numpy", "rasterio"],
//!   "options": [
//!     { "name": "break-system-packages", "env": { "PIP_BREAK_SYSTEM_PACKAGES": "1" } }
//!   ],
//!   "install": [["pip3", "install", ".", "--prefix=."], "echo done"],
//!   "test": ["earthscii", "--help"]
//! }
//! ```

use crate::error::{InstallError, Result};
use crate::verify::Digest;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Archive suffixes stripped before a version is read from a file name.
const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tbz", ".tar", ".zip",
];

/// Archive formats that can be named but not unpacked; only gzip and plain tar extract.
const UNSUPPORTED_ARCHIVES: &[&str] = &[".tar.xz", ".txz", ".tar.bz2", ".tbz", ".zip"];

/// Minimum Jaro-Winkler similarity for a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.85;

/// One install instruction. Opaque to the engine: it is executed, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallStep {
    /// Run through `/bin/sh -c`
    Shell(String),
    /// Run directly, first element is the program
    Exec(Vec<String>),
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStep::Shell(script) => f.write_str(script),
            InstallStep::Exec(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// A configuration option a formula recognises. Disabled unless a request enables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaOption {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Where a source archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Mutable network reference; a digest is mandatory
    Remote(String),
    Local(PathBuf),
}

impl SourceLocation {
    pub fn parse(url: &str) -> Self {
        if url.starts_with("https://") || url.starts_with("http://") {
            SourceLocation::Remote(url.to_string())
        } else if let Some(path) = url.strip_prefix("file://") {
            SourceLocation::Local(PathBuf::from(path))
        } else {
            SourceLocation::Local(PathBuf::from(url))
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, SourceLocation::Remote(_))
    }
}

/// Formula metadata as loaded from a formula file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRecord {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<Digest>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub options: Vec<FormulaOption>,
    #[serde(default)]
    pub install: Vec<InstallStep>,
    #[serde(default)]
    pub test: Option<Vec<String>>,
}

impl FormulaRecord {
    pub fn source(&self) -> SourceLocation {
        SourceLocation::parse(&self.url)
    }

    /// Version to install: the explicit `version`, else one read from the source file name.
    pub fn version(&self) -> Result<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        version_from_url(&self.url).ok_or_else(|| self.invalid("cannot derive a version from url"))
    }

    pub fn option(&self, name: &str) -> Option<&FormulaOption> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Check the record's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self.name.contains('/')
            || self.name.starts_with('.')
            || self.name.chars().any(char::is_whitespace)
        {
            return Err(self.invalid("name must be a single non-hidden path component"));
        }

        if self.url.trim().is_empty() {
            return Err(self.invalid("url is empty"));
        }
        if self.source().is_network() && self.sha256.is_none() {
            return Err(self.invalid("a sha256 digest is required for network sources"));
        }
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        if let Some(suffix) = UNSUPPORTED_ARCHIVES.iter().find(|s| path.ends_with(*s)) {
            return Err(self.invalid(&format!("{} archives cannot be extracted", suffix)));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.name {
                return Err(self.invalid("formula depends on itself"));
            }
            if !seen.insert(dep.as_str()) {
                return Err(self.invalid(&format!("dependency {} listed twice", dep)));
            }
        }

        let mut option_names = HashSet::new();
        for option in &self.options {
            if !option_names.insert(option.name.as_str()) {
                return Err(self.invalid(&format!("option {} declared twice", option.name)));
            }
        }

        if self.install.is_empty() {
            return Err(self.invalid("no install steps"));
        }
        if self
            .install
            .iter()
            .any(|step| matches!(step, InstallStep::Exec(argv) if argv.is_empty()))
        {
            return Err(self.invalid("install step with empty argv"));
        }
        if matches!(&self.test, Some(argv) if argv.is_empty()) {
            return Err(self.invalid("test command is empty"));
        }

        let version = self.version()?;
        if version.is_empty() || version.contains('/') || version == "." || version == ".." {
            return Err(self.invalid(&format!("unusable version {:?}", version)));
        }

        Ok(())
    }

    fn invalid(&self, reason: &str) -> InstallError {
        InstallError::InvalidFormula {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Read a version out of an archive URL's file name.
///
/// `…/tags/v0.1.0.tar.gz` gives `0.1.0`, `libx-1.2.3.tgz` gives `1.2.3`.
pub fn version_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file_name = path.trim_end_matches('/').rsplit('/').next()?;

    let stem = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .unwrap_or(file_name);

    let chars: Vec<char> = stem.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if !c.is_ascii_digit() {
            continue;
        }
        let starts_token = match i {
            0 => true,
            _ => match chars[i - 1] {
                '-' | '_' => true,
                'v' | 'V' => i == 1 || matches!(chars[i - 2], '-' | '_'),
                _ => false,
            },
        };
        if starts_token {
            return Some(chars[i..].iter().collect());
        }
    }

    None
}

/// Pick the candidate closest to `name`, if any is close enough.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(|candidate| (strsim::jaro_winkler(name, candidate), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, candidate)| candidate.to_string())
}

/// Source of formula records for dependency resolution.
pub trait FormulaLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<FormulaRecord>;

    /// Known names, used for suggestions when a lookup misses
    fn names(&self) -> Vec<String> {
        Vec::new()
    }
}

impl FormulaLookup for HashMap<String, FormulaRecord> {
    fn lookup(&self, name: &str) -> Option<FormulaRecord> {
        self.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

/// Formulae loaded from a directory of `*.json` files
#[derive(Debug, Clone, Default)]
pub struct FormulaIndex {
    formulae: BTreeMap<String, FormulaRecord>,
}

impl FormulaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from records, validating each and rejecting duplicate names.
    pub fn from_records(records: impl IntoIterator<Item = FormulaRecord>) -> Result<Self> {
        let mut index = Self::new();
        for record in records {
            index.insert(record)?;
        }
        Ok(index)
    }

    /// Load every `*.json` file in `dir`. A missing directory is an empty index.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut index = Self::new();

        if !dir.exists() {
            return Ok(index);
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read formula directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        for path in paths {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read formula: {}", path.display()))?;
            let record: FormulaRecord = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse formula: {}", path.display()))?;
            tracing::debug!(formula = %record.name, path = %path.display(), "loaded formula");
            index.insert(record)?;
        }

        Ok(index)
    }

    pub fn insert(&mut self, record: FormulaRecord) -> Result<()> {
        record.validate()?;
        if self.formulae.contains_key(&record.name) {
            return Err(InstallError::InvalidFormula {
                name: record.name.clone(),
                reason: "defined more than once".to_string(),
            });
        }
        self.formulae.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FormulaRecord> {
        self.formulae.get(name)
    }

    pub fn len(&self) -> usize {
        self.formulae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }
}

impl FormulaLookup for FormulaIndex {
    fn lookup(&self, name: &str) -> Option<FormulaRecord> {
        self.formulae.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.formulae.keys().cloned().collect()
    }
}
