//! The open-file coordinator and its virtual channels.
//!
//! One [`OpenCryptoFile`] exists per live ciphertext path (the registry
//! enforces this) and serializes every channel opened on the same cleartext
//! file. It owns the authoritative cleartext size — which supersedes
//! anything derivable from the ciphertext length while the file is open —
//! the tracked modification time, and the chunk store.
//!
//! Readers share the per-file lock; writers, truncation, and flushes take
//! it exclusively. Size and mtime are atomics so snapshots need no lock.

use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::crypto::content::{cleartext_len, CLEARTEXT_CHUNK_LEN, HEADER_LEN};
use crate::crypto::Cryptor;
use crate::error::{host_err, FsError, Result};
use crate::fs::chunks::{chunk_cleartext_len, ChunkStore};
use crate::fs::registry::OpenFileRegistry;
use crate::stats::FsStats;

/// Sentinel in the channel counter marking a closed file.
const CLOSED: i64 = -1;

/// State of one open cleartext file.
pub struct OpenCryptoFile {
    current_path: Mutex<PathBuf>,
    store: Mutex<ChunkStore>,
    lock: RwLock<()>,
    /// Authoritative cleartext size in bytes.
    size: AtomicI64,
    mtime_millis: AtomicI64,
    mtime_dirty: AtomicBool,
    /// Number of live channels, or [`CLOSED`].
    channels: AtomicI64,
}

impl std::fmt::Debug for OpenCryptoFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCryptoFile")
            .field("current_path", &self.current_path)
            .field("size", &self.size)
            .field("mtime_millis", &self.mtime_millis)
            .field("mtime_dirty", &self.mtime_dirty)
            .field("channels", &self.channels)
            .finish()
    }
}

impl OpenCryptoFile {
    /// Open (or create) the ciphertext file at `path` and build the
    /// coordinator around it. The size initializes from the ciphertext
    /// length; a ciphertext shorter than the header is corrupt.
    pub(crate) fn open(
        path: &Path,
        writable: bool,
        create: bool,
        cryptor: Arc<Cryptor>,
        stats: Arc<FsStats>,
        cache_capacity: NonZeroUsize,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)
            .map_err(|e| host_err(e, path))?;
        let metadata = file.metadata()?;
        let ciphertext_len = metadata.len();
        let size = if ciphertext_len == 0 {
            0
        } else if ciphertext_len < HEADER_LEN {
            return Err(FsError::corrupted_file(
                path,
                format!("{ciphertext_len} bytes is shorter than the file header"),
            ));
        } else {
            cleartext_len(ciphertext_len)
                .map_err(|e| FsError::corrupted_file(path, e.to_string()))?
        };
        let mtime = metadata
            .modified()
            .unwrap_or_else(|_| SystemTime::now());
        debug!(path = %path.display(), size, "opened crypto file");

        Ok(Arc::new(Self {
            current_path: Mutex::new(path.to_path_buf()),
            store: Mutex::new(ChunkStore::new(
                file,
                path.to_path_buf(),
                ciphertext_len,
                cryptor,
                stats,
                cache_capacity,
            )),
            lock: RwLock::new(()),
            size: AtomicI64::new(size as i64),
            mtime_millis: AtomicI64::new(millis_since_epoch(mtime)),
            mtime_dirty: AtomicBool::new(false),
            channels: AtomicI64::new(0),
        }))
    }

    /// Current cleartext size snapshot.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire).max(0) as u64
    }

    /// Tracked modification time snapshot.
    pub fn mtime(&self) -> SystemTime {
        let millis = self.mtime_millis.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
    }

    /// The ciphertext path this file currently lives at; swapped on move.
    pub fn current_path(&self) -> PathBuf {
        self.current_path.lock().clone()
    }

    pub(crate) fn set_current_path(&self, path: &Path) {
        *self.current_path.lock() = path.to_path_buf();
    }

    /// Try to attach another channel. Fails when the file is closing, in
    /// which case the caller retries against a fresh instance.
    pub(crate) fn register_channel(&self) -> bool {
        self.channels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c < 0 {
                    None
                } else {
                    Some(c + 1)
                }
            })
            .is_ok()
    }

    /// Number of live channels; [`CLOSED`] maps to zero.
    pub fn channel_count(&self) -> u64 {
        self.channels.load(Ordering::Acquire).max(0) as u64
    }

    fn ensure_open(&self) -> Result<()> {
        if self.channels.load(Ordering::Acquire) < 0 {
            Err(FsError::Closed)
        } else {
            Ok(())
        }
    }

    fn touch_mtime(&self) {
        self.mtime_millis
            .store(millis_since_epoch(SystemTime::now()), Ordering::Release);
        self.mtime_dirty.store(true, Ordering::Release);
    }

    /// Read up to `buf.len()` bytes at `pos`. Returns 0 at end of file.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        let size = self.size();
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = size.min(pos + buf.len() as u64);
        let mut store = self.store.lock();
        let mut done = 0usize;
        let mut cursor = pos;
        while cursor < end {
            let index = cursor / CLEARTEXT_CHUNK_LEN as u64;
            let offset = (cursor % CLEARTEXT_CHUNK_LEN as u64) as usize;
            let expected = chunk_cleartext_len(index, size);
            let chunk = store.chunk_mut(index, expected)?;
            let available = chunk.data.len().saturating_sub(offset);
            let wanted = ((end - cursor) as usize).min(available);
            if wanted == 0 {
                break;
            }
            buf[done..done + wanted].copy_from_slice(&chunk.data[offset..offset + wanted]);
            done += wanted;
            cursor += wanted as u64;
        }
        Ok(done)
    }

    /// Write `buf` at `pos`, growing the file and zero-filling any gap
    /// between the previous end of file and `pos`.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let mut store = self.store.lock();
        let old_size = self.size();
        let mut logical_size = old_size;
        if pos > old_size {
            logical_size = write_zeros(&mut store, old_size, pos - old_size, logical_size)?;
        }
        logical_size = write_span(&mut store, pos, buf, logical_size)?;
        if logical_size != old_size {
            self.size.store(logical_size as i64, Ordering::Release);
            store.mark_len_dirty();
        }
        self.touch_mtime();
        Ok(buf.len())
    }

    /// Append `buf` at the current end of file, atomically with respect to
    /// other writers.
    pub fn append(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let mut store = self.store.lock();
        let old_size = self.size();
        let new_size = write_span(&mut store, old_size, buf, old_size)?;
        self.size.store(new_size as i64, Ordering::Release);
        store.mark_len_dirty();
        self.touch_mtime();
        Ok(buf.len())
    }

    /// Shrink the file to `new_size`; a no-op when `new_size` is not
    /// smaller than the current size.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let old_size = self.size();
        if new_size >= old_size {
            return Ok(());
        }
        let mut store = self.store.lock();
        store.truncate_chunks(new_size, old_size)?;
        self.size.store(new_size as i64, Ordering::Release);
        self.touch_mtime();
        Ok(())
    }

    /// Write every dirty chunk and the header to the host. Does not close.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        self.store.lock().flush(self.size())
    }

    /// Flush and write the tracked mtime back to the host file.
    fn finalize(&self) -> Result<()> {
        let _guard = self.lock.write();
        let mut store = self.store.lock();
        store.flush(self.size())?;
        if self.mtime_dirty.swap(false, Ordering::AcqRel) {
            store.set_host_mtime(self.mtime())?;
        }
        Ok(())
    }

    /// Detach one channel. The channel that drops the count to zero marks
    /// the file closed, finalizes it, and releases the registry entry.
    pub(crate) fn release_channel(self: &Arc<Self>, registry: &OpenFileRegistry) -> Result<()> {
        loop {
            let current = self.channels.load(Ordering::Acquire);
            if current <= 0 {
                // Force-closed underneath us; nothing left to release.
                return Ok(());
            }
            if self
                .channels
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if current == 1
                && self
                    .channels
                    .compare_exchange(0, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let result = self.finalize();
                registry.remove(&self.current_path(), self);
                return result;
            }
            return Ok(());
        }
    }

    /// Close regardless of the channel count, for filesystem shutdown.
    pub(crate) fn force_close(&self) -> Result<()> {
        self.channels.store(CLOSED, Ordering::Release);
        self.finalize()
    }
}

fn millis_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Copy `buf` into the chunk cache at `pos`, returning the grown logical
/// size. Intra-chunk gaps are zero-filled by the resize.
fn write_span(
    store: &mut ChunkStore,
    pos: u64,
    buf: &[u8],
    mut logical_size: u64,
) -> Result<u64> {
    let mut done = 0usize;
    let mut cursor = pos;
    while done < buf.len() {
        let index = cursor / CLEARTEXT_CHUNK_LEN as u64;
        let offset = (cursor % CLEARTEXT_CHUNK_LEN as u64) as usize;
        let existing = chunk_cleartext_len(index, logical_size);
        let chunk = store.chunk_mut(index, existing)?;
        let n = (buf.len() - done).min(CLEARTEXT_CHUNK_LEN - offset);
        if chunk.data.len() < offset + n {
            chunk.data.resize(offset + n, 0);
        }
        chunk.data[offset..offset + n].copy_from_slice(&buf[done..done + n]);
        chunk.dirty = true;
        done += n;
        cursor += n as u64;
        logical_size = logical_size.max(cursor);
    }
    Ok(logical_size)
}

/// Zero-fill `len` bytes starting at `pos` through the chunk cache.
fn write_zeros(
    store: &mut ChunkStore,
    pos: u64,
    len: u64,
    mut logical_size: u64,
) -> Result<u64> {
    let zeros = vec![0u8; CLEARTEXT_CHUNK_LEN];
    let mut cursor = pos;
    let end = pos + len;
    while cursor < end {
        let offset = (cursor % CLEARTEXT_CHUNK_LEN as u64) as usize;
        let n = ((end - cursor) as usize).min(CLEARTEXT_CHUNK_LEN - offset);
        logical_size = write_span(store, cursor, &zeros[..n], logical_size)?;
        cursor += n as u64;
    }
    Ok(logical_size)
}

/// A virtual channel on one open cleartext file.
///
/// Channels are positional: `read_at` and `write_at` take explicit offsets
/// and may run concurrently with other channels on the same file, linearized
/// by the file's read/write lock. Dropping a channel closes it, logging
/// instead of panicking if the final flush fails; call [`close`](Self::close)
/// to observe that error.
pub struct FileChannel {
    file: Arc<OpenCryptoFile>,
    registry: Arc<OpenFileRegistry>,
    writable: bool,
    append_only: bool,
    closed: AtomicBool,
}

impl FileChannel {
    pub(crate) fn new(
        file: Arc<OpenCryptoFile>,
        registry: Arc<OpenFileRegistry>,
        writable: bool,
        append_only: bool,
    ) -> Self {
        Self {
            file,
            registry,
            writable,
            append_only,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_usable()?;
        if !self.writable {
            return Err(FsError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "channel is not writable",
            )));
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `pos`; 0 means end of file.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_usable()?;
        self.file.read_at(pos, buf)
    }

    /// Write `buf` at `pos` (or at the end of file for append channels).
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        if self.append_only {
            self.file.append(buf)
        } else {
            self.file.write_at(pos, buf)
        }
    }

    /// Append `buf` at the end of file.
    pub fn append(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        self.file.append(buf)
    }

    /// Shrink the file to `new_size`; no-op if it is already smaller.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file.truncate(new_size)
    }

    /// Current cleartext size.
    pub fn size(&self) -> Result<u64> {
        self.ensure_usable()?;
        Ok(self.file.size())
    }

    /// Force dirty chunks and the header to the host without closing.
    pub fn flush(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.writable {
            self.file.flush()
        } else {
            Ok(())
        }
    }

    /// Close this channel. The last channel on a file flushes it, persists
    /// size and mtime, and releases it from the registry.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.file.release_channel(&self.registry)
    }
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(error = %err, "closing dropped channel failed");
            }
        }
    }
}
