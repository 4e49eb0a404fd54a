//! Advisory file locks.
//!
//! Locking a resource `X/Y` locks the file `X/.Y.lock`. Exclusive holders
//! record their pid and an optional message in the lock file so that a
//! blocked process can report who it is waiting on.

use crate::error::{Error, Result};
use fs4::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many holders at once.
    Shared,
    /// A single holder.
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

/// Diagnostic record written into exclusive lock files.
#[derive(Debug, Serialize)]
struct LockOwner<'a> {
    pid: u32,
    message: Option<&'a str>,
}

/// Get the lock file path for a resource: `X/Y` becomes `X/.Y.lock`.
pub fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lock_name = format!(".{}.lock", name);

    match path.parent() {
        Some(parent) => parent.join(lock_name),
        None => PathBuf::from(lock_name),
    }
}

/// A held advisory lock. The lock is released when this is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Open (creating if needed) and lock a lock file, blocking until the
    /// lock is available.
    pub fn acquire(path: &Path, mode: LockMode, message: Option<&str>) -> Result<Self> {
        if mode == LockMode::Shared && message.is_some() {
            return Err(Error::SharedLockMessage {
                path: path.to_path_buf(),
            });
        }

        // Anybody who can open the lock file can block armature operations.
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;

        if !try_lock(&file, mode)? {
            info!(path = %path.display(), mode = mode.as_str(), "waiting for lock");
            let start = Instant::now();
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file)?,
                LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            }
            info!(
                path = %path.display(),
                seconds = start.elapsed().as_secs_f64(),
                "got lock"
            );
        }

        if mode == LockMode::Exclusive {
            write_owner(&mut file, message)?;
        }

        debug!(path = %path.display(), mode = mode.as_str(), "locked");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    /// Mode the lock is held in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "unlocked");
    }
}

fn try_lock(file: &File, mode: LockMode) -> Result<bool> {
    let attempt = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };

    match attempt {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
        #[cfg(windows)]
        Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Overwrite the lock file with the holder's pid and message.
fn write_owner(file: &mut File, message: Option<&str>) -> Result<()> {
    let owner = LockOwner {
        pid: std::process::id(),
        message,
    };

    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, &owner)?;
    file.flush()?;
    let len = file.stream_position()?;
    file.set_len(len)?;
    Ok(())
}

/// Lock a resource via its `.name.lock` file for the duration of `f`.
pub fn with_lock<T, F>(path: &Path, mode: LockMode, message: Option<&str>, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    with_lock_file(&lock_path(path), mode, message, f)
}

/// Lock an explicit lock file for the duration of `f`.
pub fn with_lock_file<T, F>(
    lock_file: &Path,
    mode: LockMode,
    message: Option<&str>,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _lock = FileLock::acquire(lock_file, mode, message)?;
    f()
}
