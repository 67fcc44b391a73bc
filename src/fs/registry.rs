//! Registry of open files, keyed by ciphertext path.
//!
//! `get_or_create` is linearizable: racing callers for one path converge on
//! one [`OpenCryptoFile`] instance, and a close that drained the channel
//! count cannot be resurrected — the closing instance rejects registration,
//! the caller waits for it to leave the map, and a fresh instance is built.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::fs::open_file::OpenCryptoFile;

#[derive(Default)]
pub struct OpenFileRegistry {
    map: DashMap<PathBuf, Arc<OpenCryptoFile>>,
    /// Serializes re-keying so a move never interleaves with another move.
    move_lock: Mutex<()>,
}

impl OpenFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The open file at `path`, if any.
    pub fn get(&self, path: &Path) -> Option<Arc<OpenCryptoFile>> {
        self.map.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of currently open files.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch the open file at `path`, creating it with `make` when absent,
    /// and attach one channel to it.
    ///
    /// The channel registration happens while the map entry is held, so a
    /// concurrent close either completes before this call (and a fresh
    /// instance is created) or observes the new channel and stays open.
    pub fn get_or_create<F>(&self, path: &Path, make: F) -> Result<Arc<OpenCryptoFile>>
    where
        F: Fn() -> Result<Arc<OpenCryptoFile>>,
    {
        loop {
            let entry = self
                .map
                .entry(path.to_path_buf())
                .or_try_insert_with(&make)?;
            if entry.value().register_channel() {
                return Ok(Arc::clone(entry.value()));
            }
            // The instance is closing; its finalizer removes the entry.
            drop(entry);
            trace!(path = %path.display(), "waiting for closing instance to leave the registry");
            std::thread::yield_now();
        }
    }

    /// Remove `file`'s entry, but only if the map still holds that exact
    /// instance (a racing create may already have replaced it).
    pub(crate) fn remove(&self, path: &Path, file: &Arc<OpenCryptoFile>) {
        self.map.remove_if(path, |_, v| Arc::ptr_eq(v, file));
    }

    /// Re-key an open file from `src` to `dst` after a rename. No-op when
    /// the file is not open.
    pub fn prepare_move(&self, src: &Path, dst: &Path) {
        let _guard = self.move_lock.lock();
        if let Some((_, file)) = self.map.remove(src) {
            debug!(src = %src.display(), dst = %dst.display(), "re-keying open file");
            file.set_current_path(dst);
            self.map.insert(dst.to_path_buf(), file);
        }
    }

    /// Close every open file, flushing each. Used on filesystem shutdown;
    /// the first error is reported but every file is still closed.
    pub fn close_all(&self) -> Result<()> {
        let paths: Vec<PathBuf> = self.map.iter().map(|e| e.key().clone()).collect();
        let mut first_err = None;
        for path in paths {
            if let Some((_, file)) = self.map.remove(&path) {
                if let Err(err) = file.force_close() {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Cryptor, MasterKey};
    use crate::stats::FsStats;
    use std::num::NonZeroUsize;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn maker(
        path: PathBuf,
        cryptor: Arc<Cryptor>,
        stats: Arc<FsStats>,
    ) -> impl Fn() -> Result<Arc<OpenCryptoFile>> {
        move || {
            OpenCryptoFile::open(
                &path,
                true,
                true,
                Arc::clone(&cryptor),
                Arc::clone(&stats),
                NonZeroUsize::new(5).unwrap(),
            )
        }
    }

    fn fixtures(tmp: &TempDir, name: &str) -> (PathBuf, Arc<Cryptor>, Arc<FsStats>) {
        (
            tmp.path().join(name),
            Arc::new(Cryptor::new(MasterKey::new([1u8; 32], [9u8; 32]))),
            Arc::new(FsStats::new()),
        )
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let tmp = TempDir::new().unwrap();
        let registry = OpenFileRegistry::new();
        let (path, cryptor, stats) = fixtures(&tmp, "a.c9r");
        let make = maker(path.clone(), cryptor, stats);

        let first = registry.get_or_create(&path, &make).unwrap();
        let second = registry.get_or_create(&path, &make).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.channel_count(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_opens_converge_on_one_instance() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let (path, cryptor, stats) = fixtures(&tmp, "racy.c9r");

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let make = maker(path.clone(), Arc::clone(&cryptor), Arc::clone(&stats));
                let path = path.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create(&path, &make).unwrap()
                })
            })
            .collect();
        let files: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for file in &files[1..] {
            assert!(Arc::ptr_eq(&files[0], file));
        }
        assert_eq!(files[0].channel_count(), threads as u64);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_release_evicts_entry() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let (path, cryptor, stats) = fixtures(&tmp, "b.c9r");
        let make = maker(path.clone(), cryptor, stats);

        let first = registry.get_or_create(&path, &make).unwrap();
        let second = registry.get_or_create(&path, &make).unwrap();
        first.release_channel(&registry).unwrap();
        assert_eq!(registry.len(), 1);
        second.release_channel(&registry).unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reopen_after_close_builds_fresh_instance() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let (path, cryptor, stats) = fixtures(&tmp, "c.c9r");
        let make = maker(path.clone(), cryptor, stats);

        let first = registry.get_or_create(&path, &make).unwrap();
        first.write_at(0, b"persisted").unwrap();
        first.release_channel(&registry).unwrap();

        let second = registry.get_or_create(&path, &make).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.size(), 9);
        second.release_channel(&registry).unwrap();
    }

    #[test]
    fn prepare_move_rekeys_open_entry() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let (src, cryptor, stats) = fixtures(&tmp, "src.c9r");
        let dst = tmp.path().join("dst.c9r");
        let make = maker(src.clone(), cryptor, stats);

        let file = registry.get_or_create(&src, &make).unwrap();
        registry.prepare_move(&src, &dst);
        assert!(registry.get(&src).is_none());
        let moved = registry.get(&dst).unwrap();
        assert!(Arc::ptr_eq(&file, &moved));
        assert_eq!(file.current_path(), dst);
        file.release_channel(&registry).unwrap();
        assert!(registry.get(&dst).is_none());
    }

    #[test]
    fn close_all_flushes_and_clears() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let (path, cryptor, stats) = fixtures(&tmp, "d.c9r");
        let make = maker(path.clone(), cryptor, stats);

        let file = registry.get_or_create(&path, &make).unwrap();
        file.write_at(0, &[7u8; 42]).unwrap();
        registry.close_all().unwrap();
        assert!(registry.is_empty());
        // The flush reached the host: the ciphertext has header and body.
        let host_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(host_len, crate::crypto::content::ciphertext_len(42));
    }
}
