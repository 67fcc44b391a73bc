//! The encrypting filesystem surface.
//!
//! [`CryptoFs`] owns the cryptor, the path mapper, the open-files registry,
//! and the stats collector, and exposes the cleartext operations: file
//! channels, directory creation and deletion, moves, copies, symlinks,
//! listings, and attributes. On disk it maintains the vault layout: a
//! config file plus the `d/` tree of content-addressed directories.

pub mod config;
pub mod path;

use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::crypto::content::cleartext_len;
use crate::crypto::names::{CIPHERTEXT_SUFFIX, SHORTENED_SUFFIX};
use crate::crypto::{Cryptor, FileHeader};
use crate::error::{host_err, FsError, Result};
use crate::fs::dir_ids::{DirIdStore, DIR_ID_BACKUP_FILE, DIR_ID_FILE};
use crate::fs::mapper::{CiphertextNode, PathMapper, Resolution, CONTENTS_FILE, DATA_DIR, SYMLINK_FILE};
use crate::fs::open_file::{FileChannel, OpenCryptoFile};
use crate::fs::registry::OpenFileRegistry;
use crate::fs::shortening::{NameShortener, NAME_SIDECAR};
use crate::fs::symlink;
use crate::fs::{DirEntry, FileAttributes, FileKind};
use crate::stats::FsStats;

pub use config::{FsOptions, VaultConfig};
pub use path::{DirId, VaultPath};

/// How a file channel is opened.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    append: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Create the file if it does not exist (requires `write`).
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Create the file, failing if it already exists.
    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Truncate the file to zero length on open.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Every write lands at the current end of file.
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    fn wants_mutation(&self) -> bool {
        self.write || self.create || self.create_new || self.truncate || self.append
    }

    fn writable(&self) -> bool {
        self.write || self.append
    }
}

/// An encrypting filesystem over one vault directory.
pub struct CryptoFs {
    vault_root: PathBuf,
    cryptor: Arc<Cryptor>,
    mapper: PathMapper,
    open_files: Arc<OpenFileRegistry>,
    stats: Arc<FsStats>,
    readonly: bool,
    chunk_cache_capacity: NonZeroUsize,
    closed: AtomicBool,
}

impl fmt::Debug for CryptoFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoFs")
            .field("vault_root", &self.vault_root)
            .field("readonly", &self.readonly)
            .field("closed", &self.closed)
            .finish()
    }
}

impl CryptoFs {
    /// Initialize a new vault at `root`: config file, `d/` tree, and the
    /// root directory with its id backup. Fails if a vault config already
    /// exists there.
    #[instrument(level = "debug", skip(options))]
    pub fn init(root: &Path, options: &FsOptions) -> Result<()> {
        fs::create_dir_all(root).map_err(|e| host_err(e, root))?;
        let config = VaultConfig::new(options.shortening_threshold, options.key_id.clone());
        config.write_new(&root.join(&options.vault_config_filename))?;

        let key = options.key_loader.load_key(&options.key_id)?;
        let cryptor = Cryptor::new(key);
        let root_id = DirId::root();
        let hash = cryptor
            .hash_dir_id(root_id.as_str())
            .map_err(|e| FsError::Io(io::Error::other(e)))?;
        let target = root.join(DATA_DIR).join(&hash[..2]).join(&hash[2..]);
        fs::create_dir_all(&target).map_err(|e| host_err(e, &target))?;
        write_dir_id_backup(&target, &root_id, &cryptor)?;
        info!(root = %root.display(), "vault initialized");
        Ok(())
    }

    /// Open an initialized vault at `root`.
    pub fn open(root: &Path, options: FsOptions) -> Result<Self> {
        let config = VaultConfig::load(&root.join(&options.vault_config_filename))?;
        let key_id = if config.key_id.is_empty() {
            options.key_id.clone()
        } else {
            config.key_id.clone()
        };
        let key = options.key_loader.load_key(&key_id)?;
        let cryptor = Arc::new(Cryptor::new(key));

        let mapper = PathMapper::new(
            root.to_path_buf(),
            Arc::clone(&cryptor),
            DirIdStore::new(options.dir_id_cache_capacity),
            NameShortener::new(config.shortening_threshold),
            options.max_cleartext_name_len,
        );
        let root_dir = mapper.root_dir()?;
        if !root_dir.path.is_dir() {
            return Err(FsError::corrupted_directory(
                &root_dir.path,
                "vault root directory is missing; was the vault initialized?",
            ));
        }
        debug!(root = %root.display(), readonly = options.readonly, "vault opened");

        Ok(Self {
            vault_root: root.to_path_buf(),
            cryptor,
            mapper,
            open_files: Arc::new(OpenFileRegistry::new()),
            stats: Arc::new(FsStats::new()),
            readonly: options.readonly,
            chunk_cache_capacity: NonZeroUsize::new(options.chunk_cache_capacity.max(1))
                .unwrap_or(NonZeroUsize::MIN),
            closed: AtomicBool::new(false),
        })
    }

    /// Initialize and immediately open, for fresh vaults.
    pub fn init_and_open(root: &Path, options: FsOptions) -> Result<Self> {
        Self::init(root, &options)?;
        Self::open(root, options)
    }

    pub fn vault_root(&self) -> &Path {
        &self.vault_root
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FsError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.readonly {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Close the filesystem: all open files are flushed and released, and
    /// further operations fail.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(root = %self.vault_root.display(), "closing filesystem");
        self.open_files.close_all()
    }

    // ------------------------------------------------------------------
    // File channels
    // ------------------------------------------------------------------

    /// Open a channel on a cleartext file.
    #[instrument(level = "debug", skip(self, options), fields(path = %path))]
    pub fn open_file(&self, path: &VaultPath, options: &OpenOptions) -> Result<FileChannel> {
        self.check_open()?;
        if options.wants_mutation() {
            self.check_writable()?;
        }
        let resolution = self.mapper.resolve(path)?;
        let content_path = match &resolution.node {
            Some(node) if node.kind.is_directory() => {
                return Err(FsError::IsADirectory {
                    path: path.to_string(),
                })
            }
            Some(node) if node.kind.is_symlink() => {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot open a symlink as a file",
                )))
            }
            Some(node) => {
                if options.create_new {
                    return Err(FsError::AlreadyExists {
                        path: path.to_string(),
                    });
                }
                node.file_content_path()
            }
            None => {
                if !(options.create || options.create_new) || !options.writable() {
                    return Err(FsError::NotFound {
                        path: path.to_string(),
                    });
                }
                self.prepare_new_file(&resolution)?
            }
        };

        let host_writable = !self.readonly;
        let cryptor = Arc::clone(&self.cryptor);
        let stats = Arc::clone(&self.stats);
        let capacity = self.chunk_cache_capacity;
        let file = self.open_files.get_or_create(&content_path, || {
            OpenCryptoFile::open(
                &content_path,
                host_writable,
                true,
                Arc::clone(&cryptor),
                Arc::clone(&stats),
                capacity,
            )
        })?;

        let channel = FileChannel::new(
            file,
            Arc::clone(&self.open_files),
            options.writable(),
            options.append,
        );
        if options.truncate && options.writable() {
            channel.truncate(0)?;
        }
        Ok(channel)
    }

    /// Lay out the wrapper for a file that is about to be created, and
    /// return its content path.
    fn prepare_new_file(&self, resolution: &Resolution) -> Result<PathBuf> {
        let shortener = self.mapper.shortener();
        if shortener.is_deflated(&resolution.ciphertext_name) {
            let wrapper = resolution
                .parent
                .path
                .join(shortener.deflate(&resolution.ciphertext_name));
            fs::create_dir_all(&wrapper).map_err(|e| host_err(e, &wrapper))?;
            shortener.write_sidecar(&wrapper, &resolution.ciphertext_name)?;
            Ok(wrapper.join(CONTENTS_FILE))
        } else {
            Ok(resolution.parent.path.join(&resolution.ciphertext_name))
        }
    }

    /// Read a whole file into memory.
    pub fn read(&self, path: &VaultPath) -> Result<Vec<u8>> {
        let channel = self.open_file(path, &OpenOptions::new().read(true))?;
        let size = channel.size()?;
        let mut buf = vec![0u8; size as usize];
        let mut done = 0usize;
        while done < buf.len() {
            let n = channel.read_at(done as u64, &mut buf[done..])?;
            if n == 0 {
                buf.truncate(done);
                break;
            }
            done += n;
        }
        channel.close()?;
        Ok(buf)
    }

    /// Create or replace a file with the given content.
    pub fn write(&self, path: &VaultPath, content: &[u8]) -> Result<()> {
        let channel = self.open_file(
            path,
            &OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        channel.write_at(0, content)?;
        channel.close()
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    /// Create a directory. The parent must exist.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn create_dir(&self, path: &VaultPath) -> Result<()> {
        self.check_writable()?;
        let resolution = self.mapper.resolve(path)?;
        if resolution.node.is_some() {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }

        let dir_id = DirId::random();
        let target = self.mapper.dir_path(&dir_id)?;
        fs::create_dir_all(&target).map_err(|e| host_err(e, &target))?;
        write_dir_id_backup(&target, &dir_id, &self.cryptor)?;

        let wrapper = self.entry_wrapper_path(&resolution);
        fs::create_dir(&wrapper).map_err(|e| host_err(e, &wrapper))?;
        if self
            .mapper
            .shortener()
            .is_deflated(&resolution.ciphertext_name)
        {
            self.mapper
                .shortener()
                .write_sidecar(&wrapper, &resolution.ciphertext_name)?;
        }
        // The dir.c9r marker lands last; the directory is invisible to the
        // mapper until it is fully in place.
        self.mapper
            .dir_ids()
            .create(&wrapper.join(DIR_ID_FILE), &dir_id)?;
        Ok(())
    }

    /// Create a directory and any missing ancestors.
    pub fn create_dir_all(&self, path: &VaultPath) -> Result<()> {
        if path.is_root() {
            return Ok(());
        }
        let mut prefix = VaultPath::root();
        for component in path.components() {
            prefix = prefix.join(component);
            match self.create_dir(&prefix) {
                Ok(()) => {}
                Err(FsError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Delete an empty directory.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn remove_dir(&self, path: &VaultPath) -> Result<()> {
        self.check_writable()?;
        let resolution = self.mapper.resolve(path)?;
        let node = resolution.node.ok_or_else(|| FsError::NotFound {
            path: path.to_string(),
        })?;
        if !node.kind.is_directory() {
            return Err(FsError::NotADirectory {
                path: path.to_string(),
            });
        }

        let dir_id_file = node.dir_id_file();
        let dir_id = self.mapper.dir_ids().load(&dir_id_file)?;
        let target = self.mapper.dir_path(&dir_id)?;
        match fs::read_dir(&target) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_name() != DIR_ID_BACKUP_FILE {
                        return Err(FsError::not_empty(path.to_string()));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::corrupted_directory(
                    &target,
                    format!("directory id {dir_id} addresses no directory"),
                ));
            }
            Err(e) => return Err(FsError::Io(e)),
        }

        // Deletion order: marker first, then the id-addressed directory,
        // then the wrapper. A crash in between leaves only ignorable debris.
        fs::remove_file(&dir_id_file).map_err(|e| host_err(e, &dir_id_file))?;
        self.mapper.dir_ids().invalidate(&dir_id_file);
        fs::remove_dir_all(&target).map_err(|e| host_err(e, &target))?;
        fs::remove_dir_all(&node.wrapper_path).map_err(|e| host_err(e, &node.wrapper_path))?;
        Ok(())
    }

    /// Delete a file or symlink.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn remove_file(&self, path: &VaultPath) -> Result<()> {
        self.check_writable()?;
        let resolution = self.mapper.resolve(path)?;
        let node = resolution.node.ok_or_else(|| FsError::NotFound {
            path: path.to_string(),
        })?;
        if node.kind.is_directory() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        delete_leaf_node(&node)
    }

    /// List a directory's cleartext entries, sorted by name.
    ///
    /// Entries whose names cannot be decrypted (foreign files, conflicting
    /// copies from other tools) are skipped with a warning.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn list_dir(&self, path: &VaultPath) -> Result<Vec<DirEntry>> {
        self.check_open()?;
        let dir = self.mapper.ciphertext_dir(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir.path).map_err(|e| host_err(e, &dir.path))? {
            let entry = entry?;
            let host_name = entry.file_name().to_string_lossy().into_owned();
            if host_name == DIR_ID_BACKUP_FILE {
                continue;
            }
            let ciphertext_name = if host_name.ends_with(SHORTENED_SUFFIX) {
                match self.mapper.shortener().inflate(&entry.path()) {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(entry = %host_name, error = %err, "skipping unreadable shortened entry");
                        continue;
                    }
                }
            } else if host_name.ends_with(CIPHERTEXT_SUFFIX) {
                host_name.clone()
            } else {
                continue;
            };
            let cleartext = match self
                .cryptor
                .decrypt_name(&ciphertext_name, dir.dir_id.as_str())
            {
                Ok(name) => name,
                Err(err) => {
                    warn!(entry = %host_name, error = %err, "skipping undecryptable entry");
                    continue;
                }
            };
            match self.mapper.probe(&dir, &ciphertext_name)? {
                Some(node) => entries.push(DirEntry {
                    name: cleartext,
                    kind: node_file_kind(&node),
                }),
                None => continue,
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Move and copy
    // ------------------------------------------------------------------

    /// Move `src` to `dst`. Kinds must match when the target exists, and
    /// replacing is only done when `replace_existing` is set (a replaced
    /// directory must be empty). File content bytes are never rewritten;
    /// the ciphertext wrapper is renamed on the host and any open file is
    /// re-keyed in the registry.
    ///
    /// Symlinks move like files: with `replace_existing`, an existing
    /// non-directory target (symlink included) is removed first.
    #[instrument(level = "debug", skip(self), fields(src = %src, dst = %dst))]
    pub fn rename(&self, src: &VaultPath, dst: &VaultPath, replace_existing: bool) -> Result<()> {
        self.check_writable()?;
        if src == dst {
            return Ok(());
        }
        let src_resolution = self.mapper.resolve(src)?;
        let src_node = src_resolution.node.as_ref().ok_or_else(|| FsError::NotFound {
            path: src.to_string(),
        })?;
        if src_node.kind.is_directory()
            && dst.as_str().starts_with(&format!("{}/", src.as_str()))
        {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot move a directory into its own subtree",
            )));
        }
        let dst_resolution = self.mapper.resolve(dst)?;

        if src_node.kind.is_directory() {
            self.rename_dir(dst, src_node, &dst_resolution, replace_existing)
        } else {
            self.rename_leaf(dst, src_node, &dst_resolution, replace_existing)
        }
    }

    fn rename_leaf(
        &self,
        dst: &VaultPath,
        src_node: &CiphertextNode,
        dst_resolution: &Resolution,
        replace_existing: bool,
    ) -> Result<()> {
        if let Some(dst_node) = &dst_resolution.node {
            if dst_node.kind.is_directory() {
                return Err(FsError::IsADirectory {
                    path: dst.to_string(),
                });
            }
            if !replace_existing {
                return Err(FsError::AlreadyExists {
                    path: dst.to_string(),
                });
            }
            delete_leaf_node(dst_node)?;
        }

        let shortener = self.mapper.shortener();
        let dst_shortened = shortener.is_deflated(&dst_resolution.ciphertext_name);

        if src_node.kind.is_file() {
            let src_content = src_node.file_content_path();
            let dst_content = if dst_shortened {
                let wrapper = dst_resolution
                    .parent
                    .path
                    .join(shortener.deflate(&dst_resolution.ciphertext_name));
                fs::create_dir_all(&wrapper).map_err(|e| host_err(e, &wrapper))?;
                shortener.write_sidecar(&wrapper, &dst_resolution.ciphertext_name)?;
                wrapper.join(CONTENTS_FILE)
            } else {
                dst_resolution
                    .parent
                    .path
                    .join(&dst_resolution.ciphertext_name)
            };
            fs::rename(&src_content, &dst_content).map_err(|e| host_err(e, &src_content))?;
            self.open_files.prepare_move(&src_content, &dst_content);
            if src_node.kind.is_shortened() {
                fs::remove_dir_all(&src_node.wrapper_path)
                    .map_err(|e| host_err(e, &src_node.wrapper_path))?;
            }
        } else {
            // Symlinks live in a wrapper directory in both shapes.
            let dst_wrapper = if dst_shortened {
                dst_resolution
                    .parent
                    .path
                    .join(shortener.deflate(&dst_resolution.ciphertext_name))
            } else {
                dst_resolution
                    .parent
                    .path
                    .join(&dst_resolution.ciphertext_name)
            };
            fs::rename(&src_node.wrapper_path, &dst_wrapper)
                .map_err(|e| host_err(e, &src_node.wrapper_path))?;
            self.fix_wrapper_sidecar(&dst_wrapper, &dst_resolution.ciphertext_name, dst_shortened)?;
        }
        Ok(())
    }

    fn rename_dir(
        &self,
        dst: &VaultPath,
        src_node: &CiphertextNode,
        dst_resolution: &Resolution,
        replace_existing: bool,
    ) -> Result<()> {
        if let Some(dst_node) = &dst_resolution.node {
            if !dst_node.kind.is_directory() {
                return Err(FsError::NotADirectory {
                    path: dst.to_string(),
                });
            }
            if !replace_existing {
                return Err(FsError::AlreadyExists {
                    path: dst.to_string(),
                });
            }
            // The empty-directory rule applies to the replaced target.
            self.remove_dir(dst)?;
        }

        let shortener = self.mapper.shortener();
        let dst_shortened = shortener.is_deflated(&dst_resolution.ciphertext_name);
        let dst_wrapper = if dst_shortened {
            dst_resolution
                .parent
                .path
                .join(shortener.deflate(&dst_resolution.ciphertext_name))
        } else {
            dst_resolution
                .parent
                .path
                .join(&dst_resolution.ciphertext_name)
        };
        fs::rename(&src_node.wrapper_path, &dst_wrapper)
            .map_err(|e| host_err(e, &src_node.wrapper_path))?;
        self.fix_wrapper_sidecar(&dst_wrapper, &dst_resolution.ciphertext_name, dst_shortened)?;
        // The moved dir.c9r changed its host path.
        self.mapper
            .dir_ids()
            .invalidate(&src_node.wrapper_path.join(DIR_ID_FILE));
        Ok(())
    }

    /// After renaming a wrapper directory, bring its sidecar in line with
    /// the target name's shape.
    fn fix_wrapper_sidecar(
        &self,
        wrapper: &Path,
        ciphertext_name: &str,
        shortened: bool,
    ) -> Result<()> {
        let sidecar = wrapper.join(NAME_SIDECAR);
        if shortened {
            self.mapper
                .shortener()
                .write_sidecar(wrapper, ciphertext_name)?;
        } else if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(|e| host_err(e, &sidecar))?;
        }
        Ok(())
    }

    /// Copy a file's content to a new location. Unlike [`rename`], the
    /// bytes cross the crypto boundary: the copy gets a fresh header,
    /// content key, and nonces.
    #[instrument(level = "debug", skip(self), fields(src = %src, dst = %dst))]
    pub fn copy_file(&self, src: &VaultPath, dst: &VaultPath, replace_existing: bool) -> Result<()> {
        self.check_writable()?;
        if src == dst {
            return Ok(());
        }
        if !replace_existing {
            let dst_resolution = self.mapper.resolve(dst)?;
            if dst_resolution.node.is_some() {
                return Err(FsError::AlreadyExists {
                    path: dst.to_string(),
                });
            }
        }
        let src_channel = self.open_file(src, &OpenOptions::new().read(true))?;
        let dst_channel = self.open_file(
            dst,
            &OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        let mut buf = vec![0u8; 128 * 1024];
        let mut pos = 0u64;
        loop {
            let n = src_channel.read_at(pos, &mut buf)?;
            if n == 0 {
                break;
            }
            dst_channel.write_at(pos, &buf[..n])?;
            pos += n as u64;
        }
        src_channel.close()?;
        dst_channel.close()
    }

    // ------------------------------------------------------------------
    // Symlinks
    // ------------------------------------------------------------------

    /// Create a symlink at `link` pointing at the cleartext `target` path.
    /// The target is stored encrypted and is never resolved by the core.
    #[instrument(level = "debug", skip(self), fields(link = %link))]
    pub fn create_symlink(&self, link: &VaultPath, target: &str) -> Result<()> {
        self.check_writable()?;
        let resolution = self.mapper.resolve(link)?;
        if resolution.node.is_some() {
            return Err(FsError::AlreadyExists {
                path: link.to_string(),
            });
        }
        let wrapper = self.entry_wrapper_path(&resolution);
        fs::create_dir(&wrapper).map_err(|e| host_err(e, &wrapper))?;
        if self
            .mapper
            .shortener()
            .is_deflated(&resolution.ciphertext_name)
        {
            self.mapper
                .shortener()
                .write_sidecar(&wrapper, &resolution.ciphertext_name)?;
        }
        symlink::write_target(&wrapper.join(SYMLINK_FILE), target, &self.cryptor)
    }

    /// Read the cleartext target of a symlink.
    pub fn read_symlink(&self, link: &VaultPath) -> Result<String> {
        self.check_open()?;
        let resolution = self.mapper.resolve(link)?;
        let node = resolution.node.ok_or_else(|| FsError::NotFound {
            path: link.to_string(),
        })?;
        if !node.kind.is_symlink() {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a symlink",
            )));
        }
        symlink::read_target(&node.symlink_content_path(), &self.cryptor)
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Attributes of a cleartext path.
    ///
    /// File sizes come from the ciphertext length through the chunk-layout
    /// formula — unless the file is open, in which case the open file's
    /// authoritative size and tracked mtime win.
    pub fn attributes(&self, path: &VaultPath) -> Result<FileAttributes> {
        self.check_open()?;
        if path.is_root() {
            let root = self.mapper.root_dir()?;
            let metadata = fs::metadata(&root.path).map_err(|e| host_err(e, &root.path))?;
            return Ok(dir_attributes(&metadata, false));
        }
        let resolution = self.mapper.resolve(path)?;
        let node = resolution.node.ok_or_else(|| FsError::NotFound {
            path: path.to_string(),
        })?;
        let shortened = node.kind.is_shortened();
        if node.kind.is_directory() {
            let metadata = fs::metadata(&node.wrapper_path)
                .map_err(|e| host_err(e, &node.wrapper_path))?;
            return Ok(dir_attributes(&metadata, shortened));
        }
        if node.kind.is_symlink() {
            let metadata = fs::metadata(&node.wrapper_path)
                .map_err(|e| host_err(e, &node.wrapper_path))?;
            let target = symlink::read_target(&node.symlink_content_path(), &self.cryptor)?;
            return Ok(FileAttributes {
                kind: FileKind::Symlink,
                size: target.len() as u64,
                modified: metadata.modified().ok(),
                accessed: metadata.accessed().ok(),
                created: metadata.created().ok(),
                shortened,
            });
        }

        let content_path = node.file_content_path();
        let metadata = fs::metadata(&content_path).map_err(|e| host_err(e, &content_path))?;
        let (size, modified) = match self.open_files.get(&content_path) {
            Some(open) => (open.size(), Some(open.mtime())),
            None => {
                let ciphertext = metadata.len();
                let size = if ciphertext == 0 {
                    0
                } else {
                    cleartext_len(ciphertext)
                        .map_err(|e| FsError::corrupted_file(&content_path, e.to_string()))?
                };
                (size, metadata.modified().ok())
            }
        };
        Ok(FileAttributes {
            kind: FileKind::File,
            size,
            modified,
            accessed: metadata.accessed().ok(),
            created: metadata.created().ok(),
            shortened,
        })
    }

    /// Whether a cleartext path exists (any kind).
    pub fn exists(&self, path: &VaultPath) -> Result<bool> {
        self.check_open()?;
        if path.is_root() {
            return Ok(true);
        }
        match self.mapper.resolve(path) {
            Ok(resolution) => Ok(resolution.node.is_some()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(FsError::NotADirectory { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Ciphertext bytes read from the host since the last poll; resets.
    pub fn poll_bytes_read(&self) -> u64 {
        self.stats.poll_bytes_read()
    }

    /// Ciphertext bytes written to the host since the last poll; resets.
    pub fn poll_bytes_written(&self) -> u64 {
        self.stats.poll_bytes_written()
    }

    /// Plaintext bytes encrypted since the last poll; resets.
    pub fn poll_bytes_encrypted(&self) -> u64 {
        self.stats.poll_bytes_encrypted()
    }

    /// Plaintext bytes decrypted since the last poll; resets.
    pub fn poll_bytes_decrypted(&self) -> u64 {
        self.stats.poll_bytes_decrypted()
    }

    /// Chunk cache lookups since the last poll; resets.
    pub fn poll_chunk_cache_accesses(&self) -> u64 {
        self.stats.poll_chunk_cache_accesses()
    }

    /// Chunk cache misses since the last poll; resets.
    pub fn poll_chunk_cache_misses(&self) -> u64 {
        self.stats.poll_chunk_cache_misses()
    }

    // ------------------------------------------------------------------

    fn entry_wrapper_path(&self, resolution: &Resolution) -> PathBuf {
        let shortener = self.mapper.shortener();
        if shortener.is_deflated(&resolution.ciphertext_name) {
            resolution
                .parent
                .path
                .join(shortener.deflate(&resolution.ciphertext_name))
        } else {
            resolution.parent.path.join(&resolution.ciphertext_name)
        }
    }
}

impl Drop for CryptoFs {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(error = %err, "closing dropped filesystem failed");
            }
        }
    }
}

/// Delete a non-directory node: a bare `.c9r` file, or the wrapper
/// directory of a symlink or shortened entry.
fn delete_leaf_node(node: &CiphertextNode) -> Result<()> {
    if node.kind.is_shortened() || node.kind.is_symlink() {
        fs::remove_dir_all(&node.wrapper_path).map_err(|e| host_err(e, &node.wrapper_path))
    } else {
        fs::remove_file(&node.wrapper_path).map_err(|e| host_err(e, &node.wrapper_path))
    }
}

fn node_file_kind(node: &CiphertextNode) -> FileKind {
    if node.kind.is_directory() {
        FileKind::Directory
    } else if node.kind.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

fn dir_attributes(metadata: &fs::Metadata, shortened: bool) -> FileAttributes {
    FileAttributes {
        kind: FileKind::Directory,
        size: 0,
        modified: metadata.modified().ok(),
        accessed: metadata.accessed().ok(),
        created: metadata.created().ok(),
        shortened,
    }
}

/// Write the encrypted directory-id backup into an id-addressed directory.
/// The backup allows rebuilding the tree when `dir.c9r` markers are lost.
fn write_dir_id_backup(target: &Path, dir_id: &DirId, cryptor: &Cryptor) -> Result<()> {
    let backup_path = target.join(DIR_ID_BACKUP_FILE);
    let header = FileHeader::random();
    let mut sealed = cryptor
        .encrypt_header(&header)
        .map_err(|e| FsError::corrupted_file(&backup_path, e.to_string()))?;
    let chunk = cryptor
        .encrypt_chunk(dir_id.as_str().as_bytes(), 0, &header)
        .map_err(|e| FsError::corrupted_file(&backup_path, e.to_string()))?;
    sealed.extend_from_slice(&chunk);
    fs::write(&backup_path, sealed).map_err(|e| host_err(e, &backup_path))?;
    Ok(())
}

fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<CryptoFs>();
    assert::<FileChannel>();
}
