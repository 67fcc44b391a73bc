//! Shortening of overlong ciphertext names.
//!
//! Encrypted names grow with their cleartext, and hosts cap name length.
//! When a ciphertext name (including its `.c9r` suffix) exceeds the
//! configured threshold, the entry is stored under a hash-derived wrapper
//! directory `<base64url(sha1(name))>.c9s/` and the full name moves into a
//! `name.c9s` sidecar file inside it.

use std::fs;
use std::path::Path;

use tracing::trace;

use crate::crypto::names::{shorten_name, SHORTENED_SUFFIX};
use crate::error::{host_err, FsError, Result};

/// Filename of the sidecar holding the unshortened ciphertext name.
pub const NAME_SIDECAR: &str = "name.c9s";

/// Applies and reverses name shortening around a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct NameShortener {
    threshold: usize,
}

impl NameShortener {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Whether a full ciphertext name (with `.c9r` suffix) must be stored
    /// in shortened form.
    #[inline]
    pub fn is_deflated(&self, ciphertext_name: &str) -> bool {
        ciphertext_name.len() > self.threshold
    }

    /// The shortened wrapper name for a long ciphertext name, including the
    /// `.c9s` suffix. Deterministic, so the same long name always maps to
    /// the same wrapper.
    pub fn deflate(&self, ciphertext_name: &str) -> String {
        format!("{}{}", shorten_name(ciphertext_name), SHORTENED_SUFFIX)
    }

    /// Read the full ciphertext name back from a wrapper's sidecar and
    /// verify it actually hashes to the wrapper's own name. A mismatch means
    /// the sidecar was tampered with or the wrapper was renamed behind our
    /// back.
    pub fn inflate(&self, wrapper_dir: &Path) -> Result<String> {
        let sidecar = wrapper_dir.join(NAME_SIDECAR);
        let long_name =
            fs::read_to_string(&sidecar).map_err(|e| host_err(e, &sidecar))?;
        let long_name = long_name.trim_end().to_string();

        let expected = self.deflate(&long_name);
        let actual = wrapper_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if expected != actual {
            return Err(FsError::corrupted_file(
                &sidecar,
                format!("sidecar names '{long_name}' which deflates to '{expected}', not '{actual}'"),
            ));
        }
        Ok(long_name)
    }

    /// Write (or rewrite) the sidecar inside an existing wrapper directory.
    pub fn write_sidecar(&self, wrapper_dir: &Path, ciphertext_name: &str) -> Result<()> {
        let sidecar = wrapper_dir.join(NAME_SIDECAR);
        trace!(wrapper = %wrapper_dir.display(), "writing name sidecar");
        fs::write(&sidecar, ciphertext_name).map_err(|e| host_err(e, &sidecar))?;
        Ok(())
    }
}
