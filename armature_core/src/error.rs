//! Error types for armature_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using armature_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during cache, resolution and deploy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("Command failed: {command}\nReturn: {status}\nOutput:\n{output}")]
    CommandFailed {
        /// Exit status, or -1 if the process was killed by a signal.
        status: i32,
        command: String,
        output: String,
    },

    /// A branch, tag, commit or version does not exist in a repository.
    #[error("No such ref '{name}' in repo '{repo}'")]
    RefNotFound { name: String, repo: String },

    /// A reference, module or environment name failed validation.
    #[error("Invalid {what} name '{name}': {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: String,
    },

    /// The cache-wide lock was acquired twice through the same handle.
    #[error("Cannot re-lock cache at {path}")]
    LockReentry { path: PathBuf },

    /// A message was passed when acquiring a shared lock.
    #[error("Lock message may only be set for exclusive locks ({path})")]
    SharedLockMessage { path: PathBuf },

    /// A symlink chain exceeded the maximum depth during GC.
    #[error("Symlink path more than {max} links deep: {chain:?}")]
    SymlinkTooDeep { max: usize, chain: Vec<PathBuf> },

    /// A path expected to be a symlink was something else.
    #[error("Expected a symlink: {path}")]
    NotSymlink { path: PathBuf },

    /// A manifest file could not be interpreted.
    #[error("{path}:{line}: {message}")]
    Manifest {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Forge metadata did not have the expected shape.
    #[error("Invalid metadata from {url}: {reason}")]
    ForgeMetadata { url: String, reason: String },

    /// Unknown repository kind in a cache key.
    #[error("Unknown repository kind in '{id}'")]
    UnknownRepoKind { id: String },

    /// HTTP request failed.
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a CommandFailed error.
    pub fn command_failed(
        status: i32,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Error::CommandFailed {
            status,
            command: command.into(),
            output: output.into(),
        }
    }

    /// Create a RefNotFound error.
    pub fn ref_not_found(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Error::RefNotFound {
            name: name.into(),
            repo: repo.into(),
        }
    }

    /// Create an InvalidName error.
    pub fn invalid_name(
        what: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidName {
            what,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a Manifest error.
    pub fn manifest(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Error::Manifest {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a ForgeMetadata error.
    pub fn forge_metadata(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ForgeMetadata {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// True if this error means the requested ref does not exist.
    pub fn is_ref_not_found(&self) -> bool {
        matches!(self, Error::RefNotFound { .. })
    }
}
