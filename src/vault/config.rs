//! Filesystem options and the persisted vault config file.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{MasterkeyLoader, MissingMasterkeyLoader};
use crate::error::{FsError, Result};

/// Vault format revision written by this implementation.
pub const VAULT_FORMAT: u32 = 8;

/// Default maximum length of an encrypted name before shortening applies.
pub const DEFAULT_SHORTENING_THRESHOLD: usize = 220;

/// Default hard cap on cleartext filename length, in characters.
pub const DEFAULT_MAX_CLEARTEXT_NAME_LEN: usize = 220;

/// Default name of the vault config file at the vault root.
pub const DEFAULT_VAULT_CONFIG_FILENAME: &str = "vault.json";

/// Default number of decrypted chunks cached per open file.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;

/// Default capacity of the directory-id cache.
pub const DEFAULT_DIR_ID_CACHE_CAPACITY: u64 = 5000;

/// Options controlling how a filesystem is opened.
///
/// Built with chained `with_*` calls:
///
/// ```
/// use vaultfs::FsOptions;
///
/// let opts = FsOptions::default()
///     .with_shortening_threshold(50)
///     .with_max_cleartext_name_len(100)
///     .with_readonly(true);
/// assert!(opts.readonly);
/// ```
#[derive(Clone)]
pub struct FsOptions {
    pub key_loader: Arc<dyn MasterkeyLoader>,
    pub key_id: String,
    pub shortening_threshold: usize,
    pub max_cleartext_name_len: usize,
    pub readonly: bool,
    pub vault_config_filename: String,
    pub chunk_cache_capacity: usize,
    pub dir_id_cache_capacity: u64,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            key_loader: Arc::new(MissingMasterkeyLoader),
            key_id: String::new(),
            shortening_threshold: DEFAULT_SHORTENING_THRESHOLD,
            max_cleartext_name_len: DEFAULT_MAX_CLEARTEXT_NAME_LEN,
            readonly: false,
            vault_config_filename: DEFAULT_VAULT_CONFIG_FILENAME.to_string(),
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
            dir_id_cache_capacity: DEFAULT_DIR_ID_CACHE_CAPACITY,
        }
    }
}

impl FsOptions {
    pub fn with_key_loader(mut self, loader: Arc<dyn MasterkeyLoader>) -> Self {
        self.key_loader = loader;
        self
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    pub fn with_shortening_threshold(mut self, threshold: usize) -> Self {
        self.shortening_threshold = threshold;
        self
    }

    pub fn with_max_cleartext_name_len(mut self, len: usize) -> Self {
        self.max_cleartext_name_len = len;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_vault_config_filename(mut self, name: impl Into<String>) -> Self {
        self.vault_config_filename = name.into();
        self
    }

    pub fn with_chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.chunk_cache_capacity = capacity.max(1);
        self
    }

    pub fn with_dir_id_cache_capacity(mut self, capacity: u64) -> Self {
        self.dir_id_cache_capacity = capacity;
        self
    }
}

/// Persisted vault parameters, stored as JSON at the vault root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub format: u32,
    pub cipher: String,
    pub shortening_threshold: usize,
    #[serde(default)]
    pub key_id: String,
}

impl VaultConfig {
    pub fn new(shortening_threshold: usize, key_id: impl Into<String>) -> Self {
        Self {
            format: VAULT_FORMAT,
            cipher: "SIV/GCM".to_string(),
            shortening_threshold,
            key_id: key_id.into(),
        }
    }

    /// Write the config file, failing if one already exists.
    pub fn write_new(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(FsError::already_exists(path));
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load and validate the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| crate::error::host_err(e, path))?;
        let config: VaultConfig = serde_json::from_str(&raw)
            .map_err(|e| FsError::corrupted_file(path, format!("malformed vault config: {e}")))?;
        if config.format != VAULT_FORMAT {
            return Err(FsError::corrupted_file(
                path,
                format!("unsupported vault format {}", config.format),
            ));
        }
        Ok(config)
    }
}
