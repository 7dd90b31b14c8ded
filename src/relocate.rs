//! Keg relocation - rewrite the staged prefix after install steps
//!
//! Install steps run with `PREFIX` pointing into the scoped staging directory,
//! and tools like pip bake that path into shebangs and config files. Before the
//! keg is committed, text files that mention the staged prefix are rewritten to
//! the final keg path. Binaries are left untouched: their embedded strings
//! cannot change length safely.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Bytes sniffed to decide whether a file is text
const SNIFF_LEN: usize = 8192;

/// Rewrite `from` to `to` in every text file under `dir`. Returns the rewritten files.
pub fn relocate_text_files(dir: &Path, from: &Path, to: &Path) -> Result<Vec<PathBuf>> {
    let from_str = from
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid staging path: {}", from.display()))?;
    let to_str = to
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid keg path: {}", to.display()))?;

    let mut relocated = Vec::new();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .max_open(64)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_text(path)? {
            continue;
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            // Not UTF-8 after all
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        if !contents.contains(from_str) {
            continue;
        }

        let permissions = fs::metadata(path)?.permissions();
        fs::write(path, contents.replace(from_str, to_str))
            .with_context(|| format!("Failed to relocate {}", path.display()))?;
        fs::set_permissions(path, permissions)?;

        tracing::debug!(path = %path.display(), "relocated staged prefix");
        relocated.push(path.to_path_buf());
    }

    Ok(relocated)
}

/// A file is text if its first bytes contain no NUL
fn is_text(path: &Path) -> Result<bool> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(false),
    };

    let mut buf = [0u8; SNIFF_LEN];
    let n = file.read(&mut buf)?;
    Ok(!buf[..n].contains(&0))
}
