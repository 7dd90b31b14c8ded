//! SHA-256 integrity verification for fetched sources.
//!
//! Every archive is checked against the formula's declared digest before it is
//! cached, extracted or executed. Digests are accepted either as 64 bare hex
//! characters or with an explicit `sha256:` prefix, and are compared
//! case-insensitively.
//!
//! # Examples
//!
//! ```
//! use kegsmith::verify::{self, Digest};
//!
//! let content = b"hello";
//! let digest = Digest::of_bytes(content);
//! assert!(verify::verify_bytes(content, &digest).is_ok());
//! assert!(verify::verify_bytes(b"hellp", &digest).is_err());
//! ```

use crate::error::{InstallError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const SHA256_HEX_LEN: usize = 64;

/// A SHA-256 digest, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse `<hex>` or `sha256:<hex>`.
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let trimmed = value.trim();
        let hex = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);

        if hex.len() != SHA256_HEX_LEN {
            return Err(format!(
                "expected {} hex characters, got {}",
                SHA256_HEX_LEN,
                hex.len()
            ));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not a hex digest: {}", hex));
        }

        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Self(format!("{:x}", hash))
    }

    /// Digest of a file, read in 8 KiB chunks.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0; 8192];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Compare two digests, producing the mismatch error used in diagnostics.
pub fn compare(expected: &Digest, actual: &Digest) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(InstallError::IntegrityMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

pub fn verify_bytes(bytes: &[u8], expected: &Digest) -> Result<()> {
    compare(expected, &Digest::of_bytes(bytes))
}

/// Verify a file on disk, returning its actual digest on success.
pub fn verify_file(path: &Path, expected: &Digest) -> Result<Digest> {
    let actual = Digest::of_file(path)?;
    compare(expected, &actual)?;
    Ok(actual)
}
