//! Vault master key material and the loader capability.
//!
//! A vault key is 512 bits: a 256-bit AES key for file header encryption and
//! a 256-bit MAC key that, combined with the AES key, forms the AES-SIV key
//! used for filename encryption. Key bytes are held in [`Zeroizing`]
//! containers so they are wiped when dropped, and the `Debug` implementation
//! redacts them.

use std::fmt;

use generic_array::{typenum::U64, GenericArray};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{FsError, Result};

/// Length of the raw combined key material: AES key followed by MAC key.
pub const RAW_KEY_LEN: usize = 64;

/// Master key pair for a vault.
///
/// Thread-safe by construction: the key bytes are immutable after creation,
/// so a `MasterKey` can be shared across threads behind an `Arc` without
/// interior locking.
pub struct MasterKey {
    aes_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("aes_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    /// Build a master key from its two 256-bit halves.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self {
            aes_key: Zeroizing::new(aes_key),
            mac_key: Zeroizing::new(mac_key),
        }
    }

    /// Generate a fresh random key pair from the system CSPRNG.
    pub fn random() -> Self {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        rand::rng().fill_bytes(&mut aes_key);
        rand::rng().fill_bytes(&mut mac_key);
        Self::new(aes_key, mac_key)
    }

    /// Build a master key from 64 raw bytes: AES key first, MAC key second.
    pub fn from_raw_bytes(raw: &[u8; RAW_KEY_LEN]) -> Self {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        aes_key.copy_from_slice(&raw[..32]);
        mac_key.copy_from_slice(&raw[32..]);
        Self::new(aes_key, mac_key)
    }

    /// The AES-256 key used for file header encryption.
    pub(crate) fn aes_key(&self) -> &[u8; 32] {
        &self.aes_key
    }

    /// The AES-SIV key: MAC key followed by AES key, as the SIV
    /// construction expects. Returned in a zeroizing buffer.
    pub(crate) fn siv_key(&self) -> Zeroizing<GenericArray<u8, U64>> {
        let mut key = GenericArray::<u8, U64>::default();
        key[..32].copy_from_slice(self.mac_key.as_ref());
        key[32..].copy_from_slice(self.aes_key.as_ref());
        Zeroizing::new(key)
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self::new(*self.aes_key, *self.mac_key)
    }
}

/// Injected capability that supplies the master key when a filesystem is
/// opened. The `key_id` is the identifier recorded in the vault config.
pub trait MasterkeyLoader: Send + Sync {
    fn load_key(&self, key_id: &str) -> Result<MasterKey>;
}

/// Loader over fixed raw key bytes. Useful for tests and for callers that
/// perform key unwrapping themselves.
pub struct StaticMasterkeyLoader {
    raw: Zeroizing<[u8; RAW_KEY_LEN]>,
}

impl StaticMasterkeyLoader {
    pub fn new(raw: [u8; RAW_KEY_LEN]) -> Self {
        Self {
            raw: Zeroizing::new(raw),
        }
    }
}

impl MasterkeyLoader for StaticMasterkeyLoader {
    fn load_key(&self, _key_id: &str) -> Result<MasterKey> {
        Ok(MasterKey::from_raw_bytes(&self.raw))
    }
}

/// Loader that always fails; the default until a caller provides one.
pub(crate) struct MissingMasterkeyLoader;

impl MasterkeyLoader for MissingMasterkeyLoader {
    fn load_key(&self, key_id: &str) -> Result<MasterKey> {
        Err(FsError::KeyLoading(format!(
            "no masterkey loader configured (key id '{key_id}')"
        )))
    }
}
