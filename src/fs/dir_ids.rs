//! Persistence and caching of directory ids.
//!
//! Every directory's id lives in a `dir.c9r` file inside the directory's
//! ciphertext wrapper. Reads go through a bounded cache keyed by the
//! `dir.c9r` path; renames and deletes invalidate aggressively (an ancestor
//! move changes every descendant's ciphertext path, so those events flush
//! the whole cache).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{host_err, FsError, Result};
use crate::vault::path::{DirId, DIR_ID_LEN};

/// Filename of the directory-id marker inside a directory wrapper.
pub const DIR_ID_FILE: &str = "dir.c9r";

/// Filename of the encrypted directory-id backup inside the target dir.
pub const DIR_ID_BACKUP_FILE: &str = "dirid.c9r";

/// Cached loader of `dir.c9r` files.
pub struct DirIdStore {
    cache: moka::sync::Cache<PathBuf, DirId>,
}

impl DirIdStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: moka::sync::Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Load the id stored in `dir_file`, consulting the cache first.
    ///
    /// Two threads racing on a cold entry may both read the file; both reads
    /// return the same bytes, so the duplicated work is harmless.
    pub fn load(&self, dir_file: &Path) -> Result<DirId> {
        if let Some(id) = self.cache.get(dir_file) {
            return Ok(id);
        }
        let id = read_dir_id(dir_file)?;
        self.cache.insert(dir_file.to_path_buf(), id.clone());
        trace!(path = %dir_file.display(), "directory id loaded");
        Ok(id)
    }

    /// Write a freshly allocated id and prime the cache.
    pub fn create(&self, dir_file: &Path, id: &DirId) -> Result<()> {
        fs::write(dir_file, id.as_str()).map_err(|e| host_err(e, dir_file))?;
        self.cache.insert(dir_file.to_path_buf(), id.clone());
        Ok(())
    }

    /// Drop one cached entry (after deleting its directory).
    pub fn invalidate(&self, dir_file: &Path) {
        self.cache.invalidate(dir_file);
    }

    /// Drop everything (after a rename or move whose descendants' ciphertext
    /// paths all changed).
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

fn read_dir_id(dir_file: &Path) -> Result<DirId> {
    let bytes = fs::read(dir_file).map_err(|e| host_err(e, dir_file))?;
    if bytes.len() != DIR_ID_LEN {
        return Err(FsError::corrupted_directory(
            dir_file,
            format!("dir.c9r holds {} bytes, expected {DIR_ID_LEN}", bytes.len()),
        ));
    }
    let text = String::from_utf8(bytes).map_err(|_| {
        FsError::corrupted_directory(dir_file, "dir.c9r is not valid UTF-8")
    })?;
    Ok(DirId::from_raw(text))
}
