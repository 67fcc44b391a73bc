//! Symlink targets, stored as small encrypted files.
//!
//! A symlink's cleartext target path is sealed with the same header and
//! chunk machinery as a file body and written to `symlink.c9r` inside the
//! entry's wrapper directory. The target is never path-translated; it is an
//! opaque cleartext string to the core.

use std::fs;
use std::path::Path;

use crate::crypto::content::{CIPHERTEXT_CHUNK_LEN, CLEARTEXT_CHUNK_LEN, HEADER_LEN};
use crate::crypto::Cryptor;
use crate::error::{host_err, FsError, Result};

/// Longest representable symlink target (one chunk).
pub const MAX_TARGET_LEN: usize = CLEARTEXT_CHUNK_LEN;

/// Encrypt `target` and write it to `path`.
pub fn write_target(path: &Path, target: &str, cryptor: &Cryptor) -> Result<()> {
    if target.is_empty() {
        return Err(FsError::InvalidName {
            name: String::new(),
            reason: "symlink target must not be empty".to_string(),
        });
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(FsError::InvalidName {
            name: target.chars().take(32).collect(),
            reason: format!("symlink target exceeds {MAX_TARGET_LEN} bytes"),
        });
    }
    let header = crate::crypto::FileHeader::random();
    let mut sealed = cryptor
        .encrypt_header(&header)
        .map_err(|e| FsError::corrupted_file(path, e.to_string()))?;
    let chunk = cryptor
        .encrypt_chunk(target.as_bytes(), 0, &header)
        .map_err(|e| FsError::corrupted_file(path, e.to_string()))?;
    sealed.extend_from_slice(&chunk);
    fs::write(path, sealed).map_err(|e| host_err(e, path))?;
    Ok(())
}

/// Read and decrypt the target stored at `path`.
pub fn read_target(path: &Path, cryptor: &Cryptor) -> Result<String> {
    let sealed = fs::read(path).map_err(|e| host_err(e, path))?;
    if sealed.len() < HEADER_LEN as usize {
        return Err(FsError::corrupted_file(path, "truncated symlink header"));
    }
    let body = &sealed[HEADER_LEN as usize..];
    if body.len() > CIPHERTEXT_CHUNK_LEN {
        return Err(FsError::corrupted_file(
            path,
            "symlink target spans more than one chunk",
        ));
    }
    let header = cryptor
        .decrypt_header(&sealed[..HEADER_LEN as usize])
        .map_err(|e| FsError::corrupted_file(path, e.to_string()))?;
    if body.is_empty() {
        return Err(FsError::corrupted_file(path, "symlink has no target"));
    }
    let target = cryptor
        .decrypt_chunk(body, 0, &header)
        .map_err(|e| FsError::corrupted_file(path, e.to_string()))?;
    String::from_utf8(target)
        .map_err(|_| FsError::corrupted_file(path, "symlink target is not valid UTF-8"))
}
