//! Tunnel cache persistence
//!
//! The cache survives restarts through a three-file rotation: the live
//! file, a `.bak` copy of the previous generation, and a `.tmp` staging
//! file that is renamed into place once fully written. A crash at any
//! point leaves at least one consistent generation on disk, and the reader
//! falls back to `.bak` when the live file is unreadable.
//!
//! # File format
//!
//! ```text
//! # tunnel-pool tunnel cache
//! # AUTOMATICALLY GENERATED, DO NOT EDIT
//!
//! # AGE = 16
//! udp://relay.example:9000 16
//!
//! ```
//!
//! Line-oriented: blank lines and `#` comments are skipped, every record is
//! `<url> <age>` with a non-empty, space-free URL of at most
//! [`MAX_URL_LENGTH`] bytes and an age in `0..=255`. Records with age 0 are
//! never written. Malformed content stops the reader with a warning; what
//! was parsed before the bad line is kept.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::PersistError;

/// Maximum accepted URL length, in bytes
pub const MAX_URL_LENGTH: usize = 1024;

/// One persisted cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Tunnel URL
    pub url: String,
    /// Persisted age, never 0 on disk
    pub age: u8,
}

/// Append a suffix to a file name (`TUNNELS` -> `TUNNELS.bak`)
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Backup companion of the cache file
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".bak")
}

/// Staging companion of the cache file
pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

/// Write the cache file through the rotation.
///
/// The previous generation is renamed to `.bak` first (failure there is
/// only a warning: on the very first write there is nothing to back up),
/// then the new content is staged in `.tmp` and renamed into place.
///
/// Callers serialise writers; this function does not lock anything.
///
/// # Errors
///
/// Returns `PersistError` if the staging file cannot be written or moved
/// into place. Both are safe to ignore until the next write.
pub fn write_cache(path: &Path, records: &[CacheRecord]) -> Result<(), PersistError> {
    let bak = backup_path(path);
    let tmp = temp_path(path);

    // Windows rename() refuses to overwrite.
    if cfg!(windows) {
        let _ = fs::remove_file(&bak);
    }
    if let Err(err) = fs::rename(path, &bak) {
        warn!(
            from = %path.display(),
            to = %bak.display(),
            error = %err,
            "unable to back up old tunnel cache file"
        );
    }

    let mut file = fs::File::create(&tmp).map_err(|source| PersistError::Write {
        path: tmp.display().to_string(),
        source,
    })?;

    let mut content = String::new();
    content.push_str(concat!("# ", env!("CARGO_PKG_NAME"), " tunnel cache\n"));
    content.push_str("# AUTOMATICALLY GENERATED, DO NOT EDIT\n\n");
    for record in records {
        if record.age != 0 {
            content.push_str(&format!(
                "# AGE = {age}\n{url} {age}\n\n",
                url = record.url,
                age = record.age
            ));
        }
    }

    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|source| PersistError::Write {
            path: tmp.display().to_string(),
            source,
        })?;
    drop(file);

    if cfg!(windows) {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(|source| PersistError::Rename {
        from: tmp.display().to_string(),
        to: path.display().to_string(),
        source,
    })?;

    debug!(path = %path.display(), records = records.len(), "wrote tunnel cache file");
    Ok(())
}

/// Read the cache file, falling back to `.bak`.
///
/// Returns the records parsed before the first malformed line; an entirely
/// missing cache (fresh installation) yields an empty list without noise
/// beyond a warning.
pub fn read_cache(path: &Path) -> Vec<CacheRecord> {
    let bak = backup_path(path);
    let (contents, source) = match fs::read_to_string(path) {
        Ok(c) => (c, path),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "unable to open tunnel cache file; trying backup"
            );
            match fs::read_to_string(&bak) {
                Ok(c) => (c, bak.as_path()),
                Err(err) => {
                    warn!(
                        path = %bak.display(),
                        error = %err,
                        "unable to open backup tunnel cache file"
                    );
                    return Vec::new();
                }
            }
        }
    };

    let mut records = Vec::new();
    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((url, age)) = parse_record(line) else {
            warn!(
                path = %source.display(),
                line,
                "malformed tunnel cache record; ignoring the rest of the file"
            );
            break;
        };
        records.push(CacheRecord {
            url: url.to_string(),
            age,
        });
    }

    debug!(path = %source.display(), records = records.len(), "read tunnel cache file");
    records
}

/// Parse one `<url> <age>` record line
fn parse_record(line: &str) -> Option<(&str, u8)> {
    let (url, age) = line.split_once(' ')?;
    if url.is_empty() || url.len() > MAX_URL_LENGTH || age.contains(' ') {
        return None;
    }
    let age: u8 = age.parse().ok()?;
    Some((url, age))
}
