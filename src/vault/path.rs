//! Cleartext path and directory-id types.
//!
//! Two easily-confused strings get their own types: [`DirId`] is the opaque
//! identifier addressing a directory's on-disk location, [`VaultPath`] is
//! the hierarchical path an application sees. Vault paths always use `/`
//! separators, independent of the host OS.

use std::fmt;

use relative_path::{RelativePath, RelativePathBuf};

/// Byte length of a non-root directory id (a UUID in text form).
pub const DIR_ID_LEN: usize = 36;

/// Opaque identifier addressing a directory's ciphertext location.
///
/// The root directory has the empty id by convention; every other directory
/// gets a random UUID when it is created, persisted in its `dir.c9r` file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirId(String);

impl DirId {
    /// The root directory id (empty string).
    #[inline]
    pub fn root() -> Self {
        DirId(String::new())
    }

    /// Generate a fresh random id for a new directory.
    pub fn random() -> Self {
        DirId(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an id read from a `dir.c9r` file. Validation happens at the
    /// store layer, which knows which path to blame.
    #[inline]
    pub fn from_raw(id: impl Into<String>) -> Self {
        DirId(id.into())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Application-facing path inside a vault.
///
/// Leading slashes are stripped on construction; the root path is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultPath(RelativePathBuf);

impl VaultPath {
    #[inline]
    pub fn root() -> Self {
        VaultPath(RelativePathBuf::new())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let trimmed = path.as_ref().trim_start_matches('/').trim_end_matches('/');
        VaultPath(RelativePathBuf::from(trimmed))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VaultPath(self.0.join(component.as_ref()))
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<VaultPath> {
        self.0.parent().map(|p| VaultPath(p.to_relative_path_buf()))
    }

    /// Final component; `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Split into parent and final component; `None` for the root.
    pub fn split(&self) -> Option<(VaultPath, &str)> {
        Some((self.parent()?, self.file_name()?))
    }

    pub fn as_relative_path(&self) -> &RelativePath {
        &self.0
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VaultPath {
    fn from(s: &str) -> Self {
        VaultPath::new(s)
    }
}

impl From<String> for VaultPath {
    fn from(s: String) -> Self {
        VaultPath::new(s)
    }
}
