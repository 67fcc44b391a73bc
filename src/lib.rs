//! vaultfs — an encrypting virtual filesystem core.
//!
//! Applications operate on a familiar hierarchical namespace (open, read,
//! write, move, delete, list, attributes); on the backing host filesystem
//! only encrypted file bodies, encrypted filenames, and a content-addressed
//! directory structure exist.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vaultfs::{CryptoFs, FsOptions, StaticMasterkeyLoader, VaultPath};
//!
//! # fn main() -> vaultfs::Result<()> {
//! let options = FsOptions::default()
//!     .with_key_loader(Arc::new(StaticMasterkeyLoader::new([0x55; 64])))
//!     .with_key_id("static:demo");
//! let fs = CryptoFs::init_and_open("/mnt/backing/vault".as_ref(), options)?;
//!
//! fs.create_dir(&VaultPath::new("/docs"))?;
//! fs.write(&VaultPath::new("/docs/hello.txt"), b"hello vault")?;
//! assert_eq!(fs.read(&VaultPath::new("/docs/hello.txt"))?, b"hello vault");
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod fs;
pub mod stats;
pub mod vault;

pub use crypto::{Cryptor, MasterKey, MasterkeyLoader, StaticMasterkeyLoader};
pub use error::{FsError, Result};
pub use fs::{DirEntry, FileAttributes, FileChannel, FileKind};
pub use stats::FsStats;
pub use vault::{CryptoFs, DirId, FsOptions, OpenOptions, VaultConfig, VaultPath};
