//! Filesystem primitives shared by the store, the queue and the gate.
//!
//! Everything persistent goes through temp-file + rename: the rename is the
//! only point at which a live path changes, so a crash leaves either the old
//! or the new content at the live path.

use crate::{ActlogError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sibling path used while a replacement for `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Temp path private to this process and call, for files that several
/// processes may replace at once.
fn writer_temp_path_for(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

/// Write `bytes` to `path` via temp-file + fsync + rename.
///
/// Concurrent writers each use their own temp file; the last rename wins.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ActlogError::write_failure(parent, e))?;
    }

    let tmp = writer_temp_path_for(path);
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(ActlogError::write_failure(&tmp, e));
    }

    replace_file(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Atomically move a fully written `tmp` over `path`, then sync the directory.
pub fn replace_file(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).map_err(|e| ActlogError::write_failure(path, e))?;
    sync_parent_dir(path);
    Ok(())
}

/// Best effort: persist the directory entry created by a rename.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    if let Ok(dir) = File::open(parent) {
        if let Err(e) = dir.sync_all() {
            tracing::debug!(target: "actlog::store", "Directory sync failed for {}: {}", parent.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Remove a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Advisory whole-file locks. Released when the file is closed.
#[cfg(unix)]
pub mod lock {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
        loop {
            // SAFETY: the descriptor is owned by `file` and valid for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn shared(file: &File) -> std::io::Result<()> {
        flock(file, libc::LOCK_SH)
    }

    pub fn exclusive(file: &File) -> std::io::Result<()> {
        flock(file, libc::LOCK_EX)
    }

    /// Returns `Ok(false)` when another holder has the lock.
    pub fn try_exclusive(file: &File) -> std::io::Result<bool> {
        match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(not(unix))]
pub mod lock {
    use std::fs::File;

    pub fn shared(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn exclusive(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn try_exclusive(_file: &File) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Whether `file` is still the file found at `path` (same inode on unix).
#[cfg(unix)]
pub fn is_same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let open = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(open.dev() == current.dev() && open.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
pub fn is_same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}
