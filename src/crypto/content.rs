//! File body encryption: header and chunk ciphers plus size arithmetic.
//!
//! A ciphertext file is `header || chunk_0 || chunk_1 || …`. The header is
//! 68 bytes: a 12-byte nonce, a 40-byte AES-GCM-encrypted payload (8
//! reserved bytes followed by the 32-byte content key) and the 16-byte tag.
//! Each chunk carries up to 32 KiB of cleartext as
//! `nonce (12) || ciphertext (≤32768) || tag (16)`, encrypted under the
//! per-file content key with AAD = chunk index (u64, big-endian) followed by
//! the header nonce. The AAD binds chunks to their position and their file,
//! so chunks cannot be reordered or transplanted without detection.

use std::fmt;

use aead::Payload;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::MasterKey;

/// Total encrypted header length in bytes.
pub const HEADER_LEN: u64 = 68;

/// Length of the header nonce prefix.
pub const HEADER_NONCE_LEN: usize = 12;

/// Cleartext payload capacity of one chunk.
pub const CLEARTEXT_CHUNK_LEN: usize = 32 * 1024;

/// Per-chunk ciphertext overhead: nonce plus tag.
pub const CHUNK_OVERHEAD: usize = 28;

/// On-disk length of one full ciphertext chunk.
pub const CIPHERTEXT_CHUNK_LEN: usize = CLEARTEXT_CHUNK_LEN + CHUNK_OVERHEAD;

const HEADER_RESERVED: [u8; 8] = [0xFF; 8];

/// Errors of the content cipher. All of them denote corruption of the
/// ciphertext (or use of the wrong key); none are recoverable.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("invalid file header: {0}")]
    InvalidHeader(String),

    #[error("file header authentication failed (tampered or wrong key)")]
    HeaderAuth,

    #[error("chunk {index} authentication failed (tampered, reordered, or wrong key)")]
    ChunkAuth { index: u64 },

    #[error("chunk {index} is truncated: {len} bytes is shorter than the {CHUNK_OVERHEAD}-byte overhead")]
    TruncatedChunk { index: u64, len: usize },

    #[error("ciphertext length {len} is not a valid chunked file body")]
    InvalidLength { len: u64 },
}

/// Decrypted per-file header: the nonce it was sealed with and the content
/// key protecting the file body.
///
/// The nonce doubles as associated data for every chunk, so it is fixed for
/// the lifetime of the file body and re-used when the header is re-sealed.
pub struct FileHeader {
    nonce: [u8; HEADER_NONCE_LEN],
    content_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &self.nonce)
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

impl FileHeader {
    /// Create a fresh header with a random nonce and content key.
    pub fn random() -> Self {
        let mut nonce = [0u8; HEADER_NONCE_LEN];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(content_key.as_mut());
        Self { nonce, content_key }
    }

    pub(crate) fn nonce(&self) -> &[u8; HEADER_NONCE_LEN] {
        &self.nonce
    }
}

/// Seal a header into its 68-byte on-disk form.
pub fn encrypt_header(header: &FileHeader, key: &MasterKey) -> Result<Vec<u8>, ContentError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.aes_key()));
    let mut plaintext = Zeroizing::new(Vec::with_capacity(40));
    plaintext.extend_from_slice(&HEADER_RESERVED);
    plaintext.extend_from_slice(header.content_key.as_ref());

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&header.nonce), plaintext.as_slice())
        .map_err(|_| ContentError::InvalidHeader("header encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN as usize);
    sealed.extend_from_slice(&header.nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a 68-byte on-disk header.
pub fn decrypt_header(sealed: &[u8], key: &MasterKey) -> Result<FileHeader, ContentError> {
    if sealed.len() != HEADER_LEN as usize {
        return Err(ContentError::InvalidHeader(format!(
            "expected {HEADER_LEN} bytes, got {}",
            sealed.len()
        )));
    }
    let mut nonce = [0u8; HEADER_NONCE_LEN];
    nonce.copy_from_slice(&sealed[..HEADER_NONCE_LEN]);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.aes_key()));
    let decrypted = cipher
        .decrypt(Nonce::from_slice(&nonce), &sealed[HEADER_NONCE_LEN..])
        .map_err(|_| ContentError::HeaderAuth)?;
    let decrypted = Zeroizing::new(decrypted);

    if decrypted.len() != 40 {
        return Err(ContentError::InvalidHeader(format!(
            "decrypted payload has {} bytes, expected 40",
            decrypted.len()
        )));
    }
    // The first 8 bytes are reserved; accepted regardless of value for
    // forward compatibility.
    let mut content_key = Zeroizing::new([0u8; 32]);
    content_key.copy_from_slice(&decrypted[8..40]);
    Ok(FileHeader { nonce, content_key })
}

fn chunk_aad(index: u64, header: &FileHeader) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8..].copy_from_slice(&header.nonce);
    aad
}

/// Encrypt one chunk at `index` under the file's content key.
pub fn encrypt_chunk(
    cleartext: &[u8],
    index: u64,
    header: &FileHeader,
) -> Result<Vec<u8>, ContentError> {
    debug_assert!(cleartext.len() <= CLEARTEXT_CHUNK_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&header.content_key[..]));
    let mut nonce = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce);

    let aad = chunk_aad(index, header);
    let payload = Payload {
        msg: cleartext,
        aad: &aad,
    };
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| ContentError::ChunkAuth { index })?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt one chunk at `index` under the file's content key.
pub fn decrypt_chunk(
    sealed: &[u8],
    index: u64,
    header: &FileHeader,
) -> Result<Vec<u8>, ContentError> {
    if sealed.len() < CHUNK_OVERHEAD {
        return Err(ContentError::TruncatedChunk {
            index,
            len: sealed.len(),
        });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&header.content_key[..]));
    let nonce = Nonce::from_slice(&sealed[..12]);
    let aad = chunk_aad(index, header);
    let payload = Payload {
        msg: &sealed[12..],
        aad: &aad,
    };
    cipher
        .decrypt(nonce, payload)
        .map_err(|_| ContentError::ChunkAuth { index })
}

/// Number of chunks needed for `cleartext_len` bytes of payload.
pub fn chunk_count(cleartext_len: u64) -> u64 {
    cleartext_len.div_ceil(CLEARTEXT_CHUNK_LEN as u64)
}

/// Ciphertext file length for a body of `cleartext_len` bytes.
pub fn ciphertext_len(cleartext_len: u64) -> u64 {
    let full = cleartext_len / CLEARTEXT_CHUNK_LEN as u64;
    let rest = cleartext_len % CLEARTEXT_CHUNK_LEN as u64;
    let mut len = HEADER_LEN + full * CIPHERTEXT_CHUNK_LEN as u64;
    if rest > 0 {
        len += rest + CHUNK_OVERHEAD as u64;
    }
    len
}

/// Cleartext body length for a ciphertext file of `ciphertext_len` bytes.
///
/// Fails with [`ContentError::InvalidLength`] when the length cannot result
/// from the chunked layout (shorter than the header, or a trailing fragment
/// smaller than the chunk overhead).
pub fn cleartext_len(ciphertext_len: u64) -> Result<u64, ContentError> {
    if ciphertext_len < HEADER_LEN {
        return Err(ContentError::InvalidLength {
            len: ciphertext_len,
        });
    }
    let body = ciphertext_len - HEADER_LEN;
    if body == 0 {
        return Ok(0);
    }
    let full = body / CIPHERTEXT_CHUNK_LEN as u64;
    let rest = body % CIPHERTEXT_CHUNK_LEN as u64;
    if rest == 0 {
        return Ok(full * CLEARTEXT_CHUNK_LEN as u64);
    }
    if rest <= CHUNK_OVERHEAD as u64 {
        return Err(ContentError::InvalidLength {
            len: ciphertext_len,
        });
    }
    Ok(full * CLEARTEXT_CHUNK_LEN as u64 + rest - CHUNK_OVERHEAD as u64)
}
