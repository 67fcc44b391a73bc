//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use vaultfs::{CryptoFs, FsOptions, StaticMasterkeyLoader};

pub const TEST_KEY: [u8; 64] = [0x55u8; 64];

pub fn test_options() -> FsOptions {
    FsOptions::default()
        .with_key_loader(Arc::new(StaticMasterkeyLoader::new(TEST_KEY)))
        .with_key_id("test:key")
}

/// A fresh vault with default options.
pub fn open_test_fs() -> (TempDir, CryptoFs) {
    let tmp = TempDir::new().expect("temp dir");
    let fs = CryptoFs::init_and_open(tmp.path(), test_options()).expect("init vault");
    (tmp, fs)
}

/// A fresh vault with explicit shortening threshold, name cap, and
/// readonly flag (the vault is always initialized writable first).
pub fn open_test_fs_with(
    shortening_threshold: usize,
    max_name_len: usize,
    readonly: bool,
) -> (TempDir, CryptoFs) {
    let tmp = TempDir::new().expect("temp dir");
    let init_options = test_options()
        .with_shortening_threshold(shortening_threshold)
        .with_max_cleartext_name_len(max_name_len);
    CryptoFs::init(tmp.path(), &init_options).expect("init vault");
    let fs = CryptoFs::open(tmp.path(), init_options.with_readonly(readonly)).expect("open vault");
    (tmp, fs)
}

/// Reopen the vault in `tmp` as a fresh filesystem instance.
pub fn reopen(tmp: &TempDir) -> CryptoFs {
    CryptoFs::open(tmp.path(), test_options()).expect("reopen vault")
}
