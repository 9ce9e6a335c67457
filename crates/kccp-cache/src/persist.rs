//! Crash-safe file replacement.
//!
//! Readers only ever observe the previous complete file or the new complete
//! file. Safe for a single writer per destination; the engine serializes
//! writers per path through its in-flight registry.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// Sibling path used while a replacement is being written.
pub fn temp_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".tmp")
}

/// Sibling path holding the previous generation of an index document.
pub fn backup_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".bak")
}

fn with_suffix(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `dest` with `bytes`.
///
/// A stale temporary from an interrupted write is removed first. The rename
/// replaces the destination in one step, so there is no window in which the
/// destination is missing.
pub async fn atomic_write(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = write_temp(dest, bytes).await?;
    fs::rename(&tmp, dest).await
}

/// Write `bytes` to the temporary sibling of `dest` and flush it to disk.
///
/// Returns the temporary path; the caller renames it into place.
pub async fn write_temp(dest: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let tmp = temp_path(dest);
    remove_if_exists(&tmp).await?;

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(tmp)
}

/// Replace `dest` with a copy of `source` using the same discipline as
/// [`atomic_write`].
pub async fn atomic_copy(source: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(dest);
    remove_if_exists(&tmp).await?;
    let copied = fs::copy(source, &tmp).await?;
    fs::rename(&tmp, dest).await?;
    Ok(copied)
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
