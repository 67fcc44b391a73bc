//! Cryptographic primitives behind the filesystem core.
//!
//! The rest of the crate consumes these through the [`Cryptor`] facade,
//! which bundles a vault's master key with the filename codec and the file
//! body cipher.

pub mod content;
pub mod keys;
pub mod names;

pub use content::{FileHeader, CIPHERTEXT_CHUNK_LEN, CLEARTEXT_CHUNK_LEN, HEADER_LEN};
pub use keys::{MasterKey, MasterkeyLoader, StaticMasterkeyLoader};

use self::content::ContentError;
use self::names::NameError;

/// Capability object performing every cryptographic operation of a vault.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Cryptor {
    master_key: MasterKey,
}

impl Cryptor {
    pub fn new(master_key: MasterKey) -> Self {
        Self { master_key }
    }

    /// Encrypt a cleartext name under its parent directory id. Pure over
    /// `(name, parent_dir_id)`.
    pub fn encrypt_name(&self, name: &str, parent_dir_id: &str) -> Result<String, NameError> {
        names::encrypt_name(name, parent_dir_id, &self.master_key)
    }

    /// Decrypt a ciphertext name under its parent directory id.
    pub fn decrypt_name(
        &self,
        encrypted_name: &str,
        parent_dir_id: &str,
    ) -> Result<String, NameError> {
        names::decrypt_name(encrypted_name, parent_dir_id, &self.master_key)
    }

    /// Hash a directory id to its `d/XX/YYY…` address component.
    pub fn hash_dir_id(&self, dir_id: &str) -> Result<String, NameError> {
        names::hash_dir_id(dir_id, &self.master_key)
    }

    /// Seal a file header into its on-disk form.
    pub fn encrypt_header(&self, header: &FileHeader) -> Result<Vec<u8>, ContentError> {
        content::encrypt_header(header, &self.master_key)
    }

    /// Open an on-disk file header.
    pub fn decrypt_header(&self, sealed: &[u8]) -> Result<FileHeader, ContentError> {
        content::decrypt_header(sealed, &self.master_key)
    }

    /// Encrypt one body chunk.
    pub fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        index: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, ContentError> {
        content::encrypt_chunk(cleartext, index, header)
    }

    /// Decrypt one body chunk.
    pub fn decrypt_chunk(
        &self,
        sealed: &[u8],
        index: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, ContentError> {
        content::decrypt_chunk(sealed, index, header)
    }
}
