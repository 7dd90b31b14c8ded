//! Source archive extraction.
//!
//! Verified archives are unpacked into the scoped working directory of an
//! install. Gzip-compressed and plain tarballs are supported; compression is
//! detected from the file's magic bytes because cached archives are named by
//! digest, not by their original file name.
//!
//! Release tarballs usually wrap everything in one top-level directory
//! (`earthscii-0.1.0/`). When that is the case the inner directory is returned
//! as the source root.

use crate::error::{InstallError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack `archive` into `dest` and return the source root.
pub fn extract_source(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let fail = |reason: String| InstallError::Extraction {
        archive: archive.to_path_buf(),
        reason,
    };

    fs::create_dir_all(dest)?;

    let mut file = fs::File::open(archive).map_err(|e| fail(format!("cannot open: {}", e)))?;
    let mut magic = [0u8; 2];
    let is_gzip = matches!(file.read_exact(&mut magic), Ok(()) if magic == GZIP_MAGIC);
    file.seek(SeekFrom::Start(0))?;

    let result = if is_gzip {
        Archive::new(GzDecoder::new(file)).unpack(dest)
    } else {
        Archive::new(file).unpack(dest)
    };
    result.map_err(|e| fail(e.to_string()))?;

    let entries: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();

    match entries.as_slice() {
        [] => Err(fail("archive is empty".to_string())),
        [single] if single.is_dir() => Ok(single.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}
