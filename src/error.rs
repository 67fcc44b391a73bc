//! Error kinds surfaced by the filesystem core.
//!
//! Cryptographic authentication failures are never silently recovered; they
//! surface as [`FsError::CorruptedFile`] or [`FsError::CorruptedDirectory`].
//! Host I/O errors pass through untouched so callers can inspect the
//! underlying [`std::io::ErrorKind`].

use std::io;
use std::path::Path;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// A path component (or the terminal entry) does not exist.
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    /// Create or no-replace move onto an existing target.
    #[error("file already exists: {path}")]
    AlreadyExists { path: String },

    /// A non-directory was found where a directory is required.
    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    /// A directory was found where a non-directory is required.
    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    /// Delete or replace of a directory that still has entries.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    /// Cleartext name is too long or contains forbidden components.
    #[error("invalid file name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Authentication failure, truncated header, or sidecar mismatch.
    #[error("corrupted file {path}: {reason}")]
    CorruptedFile { path: String, reason: String },

    /// Malformed `dir.c9r` or a directory id pointing at nothing.
    #[error("corrupted directory {path}: {reason}")]
    CorruptedDirectory { path: String, reason: String },

    /// Mutation attempted on a readonly mount.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Operation attempted on a filesystem that has been closed.
    #[error("filesystem is closed")]
    Closed,

    /// The masterkey loader failed to supply a key.
    #[error("masterkey loading failed: {0}")]
    KeyLoading(String),

    /// Pass-through of backing filesystem errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    pub(crate) fn not_found(path: impl AsRef<Path>) -> Self {
        FsError::NotFound {
            path: path.as_ref().display().to_string(),
        }
    }

    pub(crate) fn already_exists(path: impl AsRef<Path>) -> Self {
        FsError::AlreadyExists {
            path: path.as_ref().display().to_string(),
        }
    }

    pub(crate) fn not_empty(path: impl AsRef<Path>) -> Self {
        FsError::DirectoryNotEmpty {
            path: path.as_ref().display().to_string(),
        }
    }

    pub(crate) fn corrupted_file(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        FsError::CorruptedFile {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupted_directory(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        FsError::CorruptedDirectory {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error denotes a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }

    /// True when the error denotes a corruption of vault data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FsError::CorruptedFile { .. } | FsError::CorruptedDirectory { .. }
        )
    }
}

/// Maps a raw host error on `path` into the crate error, translating
/// `NotFound` so callers see the cleartext-level kind instead of a bare
/// I/O error.
pub(crate) fn host_err(err: io::Error, path: &Path) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::not_found(path),
        io::ErrorKind::AlreadyExists => FsError::already_exists(path),
        _ => FsError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_from_host_error() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = host_err(io, Path::new("/a/b"));
        assert!(err.is_not_found());
    }

    #[test]
    fn corruption_predicate() {
        assert!(FsError::corrupted_file("/x", "tag mismatch").is_corruption());
        assert!(FsError::corrupted_directory("/y", "bad dir.c9r").is_corruption());
        assert!(!FsError::ReadOnly.is_corruption());
    }

    #[test]
    fn display_includes_path() {
        let err = FsError::not_found("/vault/missing.txt");
        assert!(err.to_string().contains("/vault/missing.txt"));
    }
}
