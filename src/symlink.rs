//! Symlink management for committed kegs.
//!
//! Files under a keg's `bin`, `sbin`, `lib`, `include`, `share` and `etc` are
//! linked into the same directories under the prefix with relative links, so
//! the prefix can be moved as a whole. Every link created is returned and ends
//! up in the receipt's `linked_artifacts`; uninstall removes exactly those.

use crate::cellar::Layout;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories to symlink from a keg into the prefix
const LINKABLE_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc"];

/// Link a keg into the prefix.
///
/// An existing link is replaced only if it already points into `keg` or is in
/// `replaceable` (links owned by the version being superseded). Anything else
/// at a target path is left alone and skipped.
pub fn link_keg(layout: &Layout, keg: &Path, replaceable: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut linked = Vec::new();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&source_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", source_dir.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }

            let relative = entry.path().strip_prefix(keg)?;
            let target = layout.prefix.join(relative);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }

            if target.symlink_metadata().is_ok() {
                let ours = points_into(&target, keg) || replaceable.contains(&target);
                if !ours || !target.symlink_metadata()?.file_type().is_symlink() {
                    tracing::warn!(target = %target.display(), "not linking, path already exists");
                    continue;
                }
                fs::remove_file(&target)
                    .with_context(|| format!("Failed to replace link: {}", target.display()))?;
            }

            create_relative_symlink(entry.path(), &target)?;
            linked.push(target);
        }
    }

    Ok(linked)
}

/// Remove links among `artifacts` that resolve into `keg`. Returns the removed paths.
pub fn unlink_artifacts<'a>(
    artifacts: impl IntoIterator<Item = &'a PathBuf>,
    keg: &Path,
) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for path in artifacts {
        let is_link = path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        if is_link && points_into(path, keg) {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove link: {}", path.display()))?;
            removed.push(path.clone());
        }
    }

    Ok(removed)
}

/// Whether the symlink at `link` resolves to a path inside `dir`.
pub fn points_into(link: &Path, dir: &Path) -> bool {
    let Ok(target) = fs::read_link(link) else {
        return false;
    };
    let resolved = if target.is_relative() {
        match link.parent() {
            Some(parent) => parent.join(&target),
            None => target,
        }
    } else {
        target
    };
    normalize_path(&resolved).starts_with(dir)
}

/// Create a symlink at `target` pointing to `source` by a relative path
fn create_relative_symlink(source: &Path, target: &Path) -> Result<()> {
    let parent = target.parent().unwrap_or(Path::new("/"));
    let relative_source = relative_path(parent, source);

    unix_fs::symlink(&relative_source, target).with_context(|| {
        format!(
            "Failed to create symlink: {} -> {}",
            target.display(),
            relative_source.display()
        )
    })
}

/// Path to `to` relative to directory `from`. Both should be absolute.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from_norm = normalize_path(from);
    let from: Vec<Component> = from_norm.components().collect();
    let to_norm = normalize_path(to);
    let to: Vec<Component> = to_norm.components().collect();

    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut path = PathBuf::new();
    for _ in common..from.len() {
        path.push("..");
    }
    for component in &to[common..] {
        path.push(component.as_os_str());
    }
    path
}

/// Resolve `.` and `..` lexically, without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
