//! Filename encryption primitives.
//!
//! Filenames are encrypted with AES-SIV, using the parent directory id as
//! associated data, so the same cleartext name maps to different ciphertext
//! names in different directories while staying deterministic within one.
//! Encrypted names are base64url-encoded; directory ids are additionally
//! hashed (AES-SIV, then SHA-1, then Base32) to form their storage address
//! under `d/`.
//!
//! Cleartext names are normalized to Unicode NFC before encryption so that
//! hosts which hand out NFD names (macOS) interoperate with hosts that use
//! NFC.

use aes_siv::{siv::Aes256Siv, Key, KeyInit};
use base64::{engine::general_purpose, Engine as _};
use data_encoding::BASE32;
use ring::digest;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use super::keys::MasterKey;

/// Suffix of regular (unshortened) ciphertext entries.
pub const CIPHERTEXT_SUFFIX: &str = ".c9r";

/// Suffix of shortened ciphertext entries.
pub const SHORTENED_SUFFIX: &str = ".c9s";

/// Errors of the filename codec.
///
/// Decryption failures are integrity violations: AES-SIV is authenticated,
/// so a failure means the name was tampered with, moved between directories,
/// or encrypted under a different key.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("filename authentication failed (tampered, moved, or wrong key)")]
    DecryptionFailed,

    #[error("encrypted filename is not valid base64url: {0}")]
    Base64(String),

    #[error("decrypted filename is not valid UTF-8")]
    Utf8,

    #[error("filename encryption failed unexpectedly")]
    EncryptionFailed,
}

/// Encrypt a single cleartext name under its parent directory id.
///
/// Returns the base64url encoding of the SIV output, without any suffix; the
/// path layer appends [`CIPHERTEXT_SUFFIX`].
pub fn encrypt_name(
    name: &str,
    parent_dir_id: &str,
    key: &MasterKey,
) -> Result<String, NameError> {
    let normalized: String = name.nfc().collect();
    let mut cipher = Aes256Siv::new(Key::<Aes256Siv>::from_slice(key.siv_key().as_slice()));
    let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
    let encrypted = cipher
        .encrypt(associated_data, normalized.as_bytes())
        .map_err(|_| NameError::EncryptionFailed)?;
    Ok(general_purpose::URL_SAFE.encode(encrypted))
}

/// Decrypt a ciphertext name under its parent directory id.
///
/// Accepts names with or without the `.c9r` suffix and with or without
/// base64 padding, so entries written by other implementations decode too.
pub fn decrypt_name(
    encrypted_name: &str,
    parent_dir_id: &str,
    key: &MasterKey,
) -> Result<String, NameError> {
    let stripped = encrypted_name
        .strip_suffix(CIPHERTEXT_SUFFIX)
        .unwrap_or(encrypted_name);
    let decoded = general_purpose::URL_SAFE
        .decode(stripped.as_bytes())
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(stripped.as_bytes()))
        .map_err(|e| NameError::Base64(e.to_string()))?;

    let mut cipher = Aes256Siv::new(Key::<Aes256Siv>::from_slice(key.siv_key().as_slice()));
    let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
    let decrypted = cipher
        .decrypt(associated_data, &decoded)
        .map_err(|_| NameError::DecryptionFailed)?;
    String::from_utf8(decrypted).map_err(|_| NameError::Utf8)
}

/// Hash a directory id to its storage address component.
///
/// The id is encrypted with AES-SIV (no associated data), hashed with SHA-1,
/// and Base32-encoded, yielding 32 uppercase characters. Storage paths split
/// this as `d/{hash[0..2]}/{hash[2..]}`.
pub fn hash_dir_id(dir_id: &str, key: &MasterKey) -> Result<String, NameError> {
    let mut cipher = Aes256Siv::new(Key::<Aes256Siv>::from_slice(key.siv_key().as_slice()));
    let associated_data: &[&[u8]] = &[];
    let encrypted = cipher
        .encrypt(associated_data, dir_id.as_bytes())
        .map_err(|_| NameError::EncryptionFailed)?;
    let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
    Ok(BASE32.encode(hashed.as_ref()))
}

/// Derive the shortened form of an overlong ciphertext name.
///
/// The full name (including its `.c9r` suffix) is hashed with SHA-1 and
/// base64url-encoded. The caller appends [`SHORTENED_SUFFIX`] and stores the
/// original name in the wrapper's sidecar.
pub fn shorten_name(long_ciphertext_name: &str) -> String {
    let hash = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY,
        long_ciphertext_name.as_bytes(),
    );
    general_purpose::URL_SAFE.encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        let mut aes = [0u8; 32];
        let mut mac = [0u8; 32];
        for i in 0..32 {
            aes[i] = i as u8;
            mac[i] = (i + 32) as u8;
        }
        MasterKey::new(aes, mac)
    }

    #[test]
    fn encryption_is_deterministic() {
        let key = test_key();
        let a = encrypt_name("report.txt", "", &key).unwrap();
        let b = encrypt_name("report.txt", "", &key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn roundtrip_various_names() {
        let key = test_key();
        for name in [
            "simple.txt",
            "with spaces.doc",
            "unicode-café.txt",
            ".hidden",
            "many.dots.in.name",
            "日本語ファイル名",
        ] {
            let enc = encrypt_name(name, "some-dir-id", &key).unwrap();
            let dec = decrypt_name(&enc, "some-dir-id", &key).unwrap();
            assert_eq!(dec, name, "roundtrip failed for {name}");
        }
    }

    #[test]
    fn parent_dir_id_changes_ciphertext() {
        let key = test_key();
        let a = encrypt_name("file.txt", "dir-a", &key).unwrap();
        let b = encrypt_name("file.txt", "dir-b", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_parent_dir_id_fails_authentication() {
        let key = test_key();
        let enc = encrypt_name("file.txt", "correct", &key).unwrap();
        let err = decrypt_name(&enc, "wrong", &key).unwrap_err();
        assert!(matches!(err, NameError::DecryptionFailed));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = test_key();
        let other = MasterKey::new([9u8; 32], [8u8; 32]);
        let enc = encrypt_name("file.txt", "", &key).unwrap();
        assert!(matches!(
            decrypt_name(&enc, "", &other),
            Err(NameError::DecryptionFailed)
        ));
    }

    #[test]
    fn decrypt_accepts_suffix_and_padding_variants() {
        let key = test_key();
        let enc = encrypt_name("doc.pdf", "", &key).unwrap();
        let with_suffix = format!("{enc}.c9r");
        let without_pad = enc.trim_end_matches('=').to_string();
        assert_eq!(decrypt_name(&with_suffix, "", &key).unwrap(), "doc.pdf");
        assert_eq!(decrypt_name(&without_pad, "", &key).unwrap(), "doc.pdf");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let key = test_key();
        assert!(matches!(
            decrypt_name("not base64!.c9r", "", &key),
            Err(NameError::Base64(_))
        ));
    }

    #[test]
    fn nfd_input_normalizes_to_nfc() {
        let key = test_key();
        let nfd = "cafe\u{0301}.txt";
        let nfc = "caf\u{00E9}.txt";
        let enc_nfd = encrypt_name(nfd, "", &key).unwrap();
        let enc_nfc = encrypt_name(nfc, "", &key).unwrap();
        assert_eq!(enc_nfd, enc_nfc);
        assert_eq!(decrypt_name(&enc_nfd, "", &key).unwrap(), nfc);
    }

    #[test]
    fn dir_id_hash_is_32_base32_chars() {
        let key = test_key();
        let hash = hash_dir_id("", &key).unwrap();
        assert_eq!(hash.len(), 32);
        assert!(hash
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
    }

    #[test]
    fn dir_id_hash_is_deterministic_and_distinct() {
        let key = test_key();
        let root = hash_dir_id("", &key).unwrap();
        assert_eq!(root, hash_dir_id("", &key).unwrap());
        let other = hash_dir_id("e9250eb8-078d-4fc0-8835-be92a313360c", &key).unwrap();
        assert_ne!(root, other);
    }

    #[test]
    fn shortened_name_known_vectors() {
        // SHA-1 of the input, base64url-encoded with padding.
        assert_eq!(shorten_name(""), "2jmj7l5rSw0yVb_vlWAYkK_YBwk=");
        assert_eq!(shorten_name("test.c9r"), "0qDU_c4BtBHnMmrVdDZiZAgaqVM=");
    }

    #[test]
    fn shortened_name_is_28_chars_of_base64url() {
        let short = shorten_name("some_very_long_encrypted_name.c9r");
        assert_eq!(short.len(), 28);
        assert!(short
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
    }
}
