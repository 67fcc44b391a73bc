//! Translation of cleartext paths to ciphertext nodes.
//!
//! A cleartext path `/a/b/c` is resolved component-wise: starting from the
//! root directory id, each component's name is encrypted under the current
//! directory id, the resulting entry is probed on disk to learn its kind,
//! and — for directories — the next directory id is read from the entry's
//! `dir.c9r`. Directory contents never nest on disk; they live under
//! `d/XX/YYY…` addressed by the hash of their directory id.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::trace;

use crate::crypto::names::CIPHERTEXT_SUFFIX;
use crate::crypto::Cryptor;
use crate::error::{FsError, Result};
use crate::fs::dir_ids::{DirIdStore, DIR_ID_FILE};
use crate::fs::shortening::NameShortener;
use crate::vault::path::{DirId, VaultPath};

/// Name of the well-known subtree holding all ciphertext directories.
pub const DATA_DIR: &str = "d";

/// File body inside a shortened wrapper.
pub const CONTENTS_FILE: &str = "contents.c9r";

/// Symlink target file inside a directory or shortened wrapper.
pub const SYMLINK_FILE: &str = "symlink.c9r";

/// Kind of a ciphertext node. Shortened entries wrap the kind they shorten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Shortened(Box<NodeKind>),
}

impl NodeKind {
    /// The kind with any shortening wrapper removed.
    pub fn leaf(&self) -> &NodeKind {
        match self {
            NodeKind::Shortened(inner) => inner.leaf(),
            other => other,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.leaf(), NodeKind::File)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.leaf(), NodeKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.leaf(), NodeKind::Symlink)
    }

    pub fn is_shortened(&self) -> bool {
        matches!(self, NodeKind::Shortened(_))
    }
}

/// Ciphertext location of a directory's contents.
#[derive(Debug, Clone)]
pub struct CiphertextDir {
    pub dir_id: DirId,
    /// The `d/XX/YYY…` directory holding this directory's entries.
    pub path: PathBuf,
}

/// A ciphertext entry found on disk.
#[derive(Debug, Clone)]
pub struct CiphertextNode {
    pub kind: NodeKind,
    /// The entry as named in its parent: a bare `<enc>.c9r` file for regular
    /// files, a `<enc>.c9r/` directory for directories and symlinks, or a
    /// `<hash>.c9s/` wrapper for shortened entries of any kind.
    pub wrapper_path: PathBuf,
    /// Full ciphertext name including the `.c9r` suffix, even when the
    /// on-disk entry is shortened.
    pub ciphertext_name: String,
}

impl CiphertextNode {
    /// Path of the encrypted file body.
    pub fn file_content_path(&self) -> PathBuf {
        if self.kind.is_shortened() {
            self.wrapper_path.join(CONTENTS_FILE)
        } else {
            self.wrapper_path.clone()
        }
    }

    /// Path of the encrypted symlink target.
    pub fn symlink_content_path(&self) -> PathBuf {
        self.wrapper_path.join(SYMLINK_FILE)
    }

    /// Path of the `dir.c9r` marker (directories only).
    pub fn dir_id_file(&self) -> PathBuf {
        self.wrapper_path.join(DIR_ID_FILE)
    }
}

/// Resolution of one cleartext path.
#[derive(Debug)]
pub struct Resolution {
    /// Ciphertext directory containing the terminal entry.
    pub parent: CiphertextDir,
    pub cleartext_name: String,
    /// Ciphertext name of the terminal entry, with `.c9r` suffix.
    pub ciphertext_name: String,
    /// The node, or `None` when the terminal entry does not exist.
    pub node: Option<CiphertextNode>,
}

/// Maps cleartext paths to ciphertext nodes.
pub struct PathMapper {
    vault_root: PathBuf,
    cryptor: Arc<Cryptor>,
    dir_ids: DirIdStore,
    shortener: NameShortener,
    max_name_len: usize,
}

impl PathMapper {
    pub fn new(
        vault_root: PathBuf,
        cryptor: Arc<Cryptor>,
        dir_ids: DirIdStore,
        shortener: NameShortener,
        max_name_len: usize,
    ) -> Self {
        Self {
            vault_root,
            cryptor,
            dir_ids,
            shortener,
            max_name_len,
        }
    }

    pub fn shortener(&self) -> &NameShortener {
        &self.shortener
    }

    pub fn dir_ids(&self) -> &DirIdStore {
        &self.dir_ids
    }

    /// The `d/XX/YYY…` path addressed by a directory id.
    pub fn dir_path(&self, dir_id: &DirId) -> Result<PathBuf> {
        let hash = self
            .cryptor
            .hash_dir_id(dir_id.as_str())
            .map_err(|e| FsError::Io(io::Error::other(e)))?;
        Ok(self
            .vault_root
            .join(DATA_DIR)
            .join(&hash[..2])
            .join(&hash[2..]))
    }

    /// Ciphertext location of the vault root directory.
    pub fn root_dir(&self) -> Result<CiphertextDir> {
        Ok(CiphertextDir {
            dir_id: DirId::root(),
            path: self.dir_path(&DirId::root())?,
        })
    }

    /// Validate and encrypt a single cleartext name under its parent id,
    /// returning the full ciphertext name with suffix.
    pub fn ciphertext_name(&self, name: &str, parent_dir_id: &DirId) -> Result<String> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidName {
                name: name.to_string(),
                reason: "reserved or empty path component".to_string(),
            });
        }
        let char_len = name.chars().count();
        if char_len > self.max_name_len {
            return Err(FsError::InvalidName {
                name: name.to_string(),
                reason: format!(
                    "{char_len} characters exceeds the limit of {}",
                    self.max_name_len
                ),
            });
        }
        let encrypted = self
            .cryptor
            .encrypt_name(name, parent_dir_id.as_str())
            .map_err(|e| FsError::Io(io::Error::other(e)))?;
        Ok(format!("{encrypted}{CIPHERTEXT_SUFFIX}"))
    }

    /// Resolve the ciphertext directory whose entries hold the contents of
    /// the cleartext directory `path`.
    ///
    /// Fails with not-found when a component is missing, not-a-directory
    /// when one is a file or symlink, and corrupted-directory when a
    /// `dir.c9r` exists but its addressed `d/XX/YYY…` directory does not.
    pub fn ciphertext_dir(&self, path: &VaultPath) -> Result<CiphertextDir> {
        let mut dir = self.root_dir()?;
        let mut walked = VaultPath::root();
        for component in path.components() {
            walked = walked.join(component);
            let node = self
                .probe_child(&dir, component)?
                .ok_or_else(|| FsError::NotFound {
                    path: walked.to_string(),
                })?;
            if !node.kind.is_directory() {
                return Err(FsError::NotADirectory {
                    path: walked.to_string(),
                });
            }
            let dir_id = self.dir_ids.load(&node.dir_id_file())?;
            let dir_path = self.dir_path(&dir_id)?;
            if !dir_path.is_dir() {
                return Err(FsError::corrupted_directory(
                    &dir_path,
                    format!("directory id {dir_id} addresses no directory"),
                ));
            }
            dir = CiphertextDir {
                dir_id,
                path: dir_path,
            };
        }
        Ok(dir)
    }

    /// Resolve a non-root cleartext path to its ciphertext node (or its
    /// would-be location when the terminal entry is missing).
    pub fn resolve(&self, path: &VaultPath) -> Result<Resolution> {
        let (parent_path, name) = path.split().ok_or_else(|| FsError::InvalidName {
            name: "/".to_string(),
            reason: "the root has no parent entry".to_string(),
        })?;
        let parent = self.ciphertext_dir(&parent_path)?;
        let ciphertext_name = self.ciphertext_name(name, &parent.dir_id)?;
        let node = self.probe(&parent, &ciphertext_name)?;
        trace!(path = %path, present = node.is_some(), "resolved");
        Ok(Resolution {
            parent,
            cleartext_name: name.to_string(),
            ciphertext_name,
            node,
        })
    }

    /// Resolve only the parent directory plus the terminal cleartext name,
    /// for create and delete operations whose terminal may not exist.
    pub fn resolve_parent(&self, path: &VaultPath) -> Result<(CiphertextDir, String)> {
        let (parent_path, name) = path.split().ok_or_else(|| FsError::InvalidName {
            name: "/".to_string(),
            reason: "the root has no parent entry".to_string(),
        })?;
        Ok((self.ciphertext_dir(&parent_path)?, name.to_string()))
    }

    /// Probe a directory for a cleartext child name.
    pub fn probe_child(
        &self,
        parent: &CiphertextDir,
        cleartext_name: &str,
    ) -> Result<Option<CiphertextNode>> {
        let ciphertext_name = self.ciphertext_name(cleartext_name, &parent.dir_id)?;
        self.probe(parent, &ciphertext_name)
    }

    /// Probe a directory for a ciphertext name, checking the regular entry
    /// first and the shortened wrapper second.
    pub fn probe(
        &self,
        parent: &CiphertextDir,
        ciphertext_name: &str,
    ) -> Result<Option<CiphertextNode>> {
        let regular = parent.path.join(ciphertext_name);
        match fs::metadata(&regular) {
            Ok(md) if md.is_dir() => {
                let kind = match marker_kind(&regular) {
                    Some(kind) => kind,
                    // A wrapper without markers is a creation in progress
                    // (or an interrupted one); the entry does not exist yet.
                    None => return Ok(None),
                };
                Ok(Some(CiphertextNode {
                    kind,
                    wrapper_path: regular,
                    ciphertext_name: ciphertext_name.to_string(),
                }))
            }
            Ok(_) => Ok(Some(CiphertextNode {
                kind: NodeKind::File,
                wrapper_path: regular,
                ciphertext_name: ciphertext_name.to_string(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !self.shortener.is_deflated(ciphertext_name) {
                    return Ok(None);
                }
                let wrapper = parent.path.join(self.shortener.deflate(ciphertext_name));
                if !wrapper.is_dir() {
                    return Ok(None);
                }
                let inner = match marker_kind(&wrapper) {
                    Some(kind) => kind,
                    None => return Ok(None),
                };
                Ok(Some(CiphertextNode {
                    kind: NodeKind::Shortened(Box::new(inner)),
                    wrapper_path: wrapper,
                    ciphertext_name: ciphertext_name.to_string(),
                }))
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }
}

/// Kind of a wrapper directory, judged by its marker files.
fn marker_kind(wrapper: &std::path::Path) -> Option<NodeKind> {
    if wrapper.join(DIR_ID_FILE).is_file() {
        Some(NodeKind::Directory)
    } else if wrapper.join(SYMLINK_FILE).is_file() {
        Some(NodeKind::Symlink)
    } else if wrapper.join(CONTENTS_FILE).is_file() {
        Some(NodeKind::File)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::vault::config::{DEFAULT_DIR_ID_CACHE_CAPACITY, DEFAULT_SHORTENING_THRESHOLD};
    use tempfile::TempDir;

    fn mapper_on(tmp: &TempDir) -> PathMapper {
        let cryptor = Arc::new(Cryptor::new(MasterKey::new([5u8; 32], [6u8; 32])));
        PathMapper::new(
            tmp.path().to_path_buf(),
            cryptor,
            DirIdStore::new(DEFAULT_DIR_ID_CACHE_CAPACITY),
            NameShortener::new(DEFAULT_SHORTENING_THRESHOLD),
            220,
        )
    }

    /// Build the vault skeleton plus the root data dir by hand.
    fn init_root(mapper: &PathMapper) -> CiphertextDir {
        let root = mapper.root_dir().unwrap();
        fs::create_dir_all(&root.path).unwrap();
        root
    }

    #[test]
    fn node_kind_leaf_unwraps_shortening() {
        let kind = NodeKind::Shortened(Box::new(NodeKind::Directory));
        assert!(kind.is_directory());
        assert!(kind.is_shortened());
        assert_eq!(kind.leaf(), &NodeKind::Directory);
        assert!(!NodeKind::File.is_shortened());
    }

    #[test]
    fn dir_path_splits_hash() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let path = mapper.dir_path(&DirId::root()).unwrap();
        let rel = path.strip_prefix(tmp.path()).unwrap();
        let comps: Vec<_> = rel.iter().map(|c| c.to_string_lossy()).collect();
        assert_eq!(comps.len(), 3);
        assert_eq!(comps[0], DATA_DIR);
        assert_eq!(comps[1].len(), 2);
        assert_eq!(comps[2].len(), 30);
    }

    #[test]
    fn resolve_missing_terminal_yields_none_node() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        init_root(&mapper);
        let res = mapper.resolve(&VaultPath::new("/ghost.txt")).unwrap();
        assert!(res.node.is_none());
        assert_eq!(res.cleartext_name, "ghost.txt");
        assert!(res.ciphertext_name.ends_with(CIPHERTEXT_SUFFIX));
    }

    #[test]
    fn resolve_missing_intermediate_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        init_root(&mapper);
        let err = mapper.resolve(&VaultPath::new("/no/such/file")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn resolve_file_intermediate_is_not_a_directory() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);
        let enc = mapper.ciphertext_name("blob", &root.dir_id).unwrap();
        fs::write(root.path.join(&enc), b"ciphertext").unwrap();
        let err = mapper.resolve(&VaultPath::new("/blob/child")).unwrap_err();
        assert!(matches!(err, FsError::NotADirectory { .. }));
    }

    #[test]
    fn probe_detects_file_directory_and_symlink() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);

        let file_name = mapper.ciphertext_name("f.txt", &root.dir_id).unwrap();
        fs::write(root.path.join(&file_name), b"x").unwrap();

        let dir_name = mapper.ciphertext_name("sub", &root.dir_id).unwrap();
        let dir_wrapper = root.path.join(&dir_name);
        fs::create_dir(&dir_wrapper).unwrap();
        fs::write(dir_wrapper.join(DIR_ID_FILE), DirId::random().as_str()).unwrap();

        let link_name = mapper.ciphertext_name("lnk", &root.dir_id).unwrap();
        let link_wrapper = root.path.join(&link_name);
        fs::create_dir(&link_wrapper).unwrap();
        fs::write(link_wrapper.join(SYMLINK_FILE), b"enc-target").unwrap();

        let file = mapper.probe_child(&root, "f.txt").unwrap().unwrap();
        assert!(file.kind.is_file());
        assert_eq!(file.file_content_path(), root.path.join(&file_name));

        let dir = mapper.probe_child(&root, "sub").unwrap().unwrap();
        assert!(dir.kind.is_directory());

        let link = mapper.probe_child(&root, "lnk").unwrap().unwrap();
        assert!(link.kind.is_symlink());
        assert_eq!(
            link.symlink_content_path(),
            link_wrapper.join(SYMLINK_FILE)
        );
    }

    #[test]
    fn probe_finds_shortened_wrapper() {
        let tmp = TempDir::new().unwrap();
        let cryptor = Arc::new(Cryptor::new(MasterKey::new([5u8; 32], [6u8; 32])));
        let mapper = PathMapper::new(
            tmp.path().to_path_buf(),
            cryptor,
            DirIdStore::new(100),
            NameShortener::new(40),
            220,
        );
        let root = init_root(&mapper);

        let long = mapper
            .ciphertext_name("a name long enough to deflate", &root.dir_id)
            .unwrap();
        assert!(mapper.shortener().is_deflated(&long));
        let wrapper = root.path.join(mapper.shortener().deflate(&long));
        fs::create_dir(&wrapper).unwrap();
        fs::write(wrapper.join(CONTENTS_FILE), b"body").unwrap();

        let node = mapper
            .probe_child(&root, "a name long enough to deflate")
            .unwrap()
            .unwrap();
        assert!(node.kind.is_shortened());
        assert!(node.kind.is_file());
        assert_eq!(node.file_content_path(), wrapper.join(CONTENTS_FILE));
    }

    #[test]
    fn markless_wrapper_counts_as_missing() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);
        let enc = mapper.ciphertext_name("half-made", &root.dir_id).unwrap();
        fs::create_dir(root.path.join(&enc)).unwrap();
        assert!(mapper.probe_child(&root, "half-made").unwrap().is_none());
    }

    #[test]
    fn overlong_cleartext_name_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);
        let long_name = "x".repeat(221);
        let err = mapper.probe_child(&root, &long_name).unwrap_err();
        assert!(matches!(err, FsError::InvalidName { .. }));
    }

    #[test]
    fn reserved_components_are_invalid() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);
        for name in [".", "..", ""] {
            assert!(matches!(
                mapper.ciphertext_name(name, &root.dir_id),
                Err(FsError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn missing_dir_target_is_corrupted_directory() {
        let tmp = TempDir::new().unwrap();
        let mapper = mapper_on(&tmp);
        let root = init_root(&mapper);
        // A directory entry whose dir id addresses nothing under d/.
        let enc = mapper.ciphertext_name("broken", &root.dir_id).unwrap();
        let wrapper = root.path.join(&enc);
        fs::create_dir(&wrapper).unwrap();
        fs::write(wrapper.join(DIR_ID_FILE), DirId::random().as_str()).unwrap();
        let err = mapper
            .ciphertext_dir(&VaultPath::new("/broken"))
            .unwrap_err();
        assert!(matches!(err, FsError::CorruptedDirectory { .. }));
    }
}
