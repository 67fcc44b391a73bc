//! Per-open-file chunk cache and ciphertext I/O.
//!
//! Each open file holds a small LRU of decrypted chunks. Reads hit the
//! cache or load, authenticate and decrypt the ciphertext range
//! `[H + i·C, H + (i+1)·C)`. Writes only dirty cached chunks; a dirty chunk
//! is encrypted and written back at its canonical offset when it is evicted
//! or when the file is flushed, so the on-disk layout always matches the
//! size formula once a flush completes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::crypto::content::{
    ContentError, CHUNK_OVERHEAD, CIPHERTEXT_CHUNK_LEN, CLEARTEXT_CHUNK_LEN, HEADER_LEN,
};
use crate::crypto::{Cryptor, FileHeader};
use crate::error::{FsError, Result};
use crate::stats::FsStats;

/// One decrypted chunk.
#[derive(Debug, Default)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub dirty: bool,
}

impl Chunk {
    fn fresh() -> Self {
        Chunk::default()
    }
}

/// Cleartext bytes held by chunk `index` in a file of `size` bytes.
pub fn chunk_cleartext_len(index: u64, size: u64) -> usize {
    let start = index * CLEARTEXT_CHUNK_LEN as u64;
    size.saturating_sub(start).min(CLEARTEXT_CHUNK_LEN as u64) as usize
}

/// Chunk cache plus ciphertext file handle of one open file.
///
/// Not internally synchronized; the owning open file serializes access.
pub struct ChunkStore {
    file: File,
    path: PathBuf,
    header: Option<FileHeader>,
    header_on_disk: bool,
    header_dirty: bool,
    cache: LruCache<u64, Chunk>,
    cryptor: Arc<Cryptor>,
    stats: Arc<FsStats>,
    /// The host file length no longer matches the authoritative size.
    len_dirty: bool,
    /// Anything was persisted since the last sync.
    needs_sync: bool,
}

impl ChunkStore {
    /// Wrap an opened ciphertext file. `ciphertext_len` is the file's
    /// current length, used to decide whether a header already exists.
    pub fn new(
        file: File,
        path: PathBuf,
        ciphertext_len: u64,
        cryptor: Arc<Cryptor>,
        stats: Arc<FsStats>,
        cache_capacity: NonZeroUsize,
    ) -> Self {
        Self {
            file,
            path,
            header: None,
            header_on_disk: ciphertext_len >= HEADER_LEN,
            header_dirty: false,
            cache: LruCache::new(cache_capacity),
            cryptor,
            stats,
            len_dirty: false,
            needs_sync: false,
        }
    }

    fn corruption(&self, err: ContentError) -> FsError {
        FsError::corrupted_file(&self.path, err.to_string())
    }

    /// Make sure the file header is present, reading it from disk or
    /// creating a fresh one.
    ///
    /// Creation happens on the first write to a file that never had one;
    /// the header reaches the disk on the next flush.
    fn ensure_header(&mut self) -> Result<()> {
        if self.header.is_some() {
            return Ok(());
        }
        if self.header_on_disk {
            let mut sealed = [0u8; HEADER_LEN as usize];
            self.file.seek(SeekFrom::Start(0))?;
            self.file
                .read_exact(&mut sealed)
                .map_err(|_| FsError::corrupted_file(&self.path, "truncated file header"))?;
            self.stats.add_bytes_read(HEADER_LEN);
            let header = self
                .cryptor
                .decrypt_header(&sealed)
                .map_err(|e| self.corruption(e))?;
            self.header = Some(header);
        } else {
            self.header = Some(FileHeader::random());
            self.header_dirty = true;
        }
        Ok(())
    }

    /// The file header, loading or creating it first.
    pub fn header(&mut self) -> Result<&FileHeader> {
        self.ensure_header()?;
        self.header
            .as_ref()
            .ok_or_else(|| FsError::Io(std::io::Error::other("header initialization failed")))
    }

    /// Borrow the chunk at `index`, loading it on a miss.
    ///
    /// `existing_len` is the number of cleartext bytes the chunk currently
    /// holds according to the authoritative file size; zero means the chunk
    /// is brand new and nothing is read from disk.
    pub fn chunk_mut(&mut self, index: u64, existing_len: usize) -> Result<&mut Chunk> {
        self.stats.add_chunk_cache_access();
        if !self.cache.contains(&index) {
            self.stats.add_chunk_cache_miss();
            let chunk = if existing_len == 0 {
                Chunk::fresh()
            } else {
                self.load_chunk(index, existing_len)?
            };
            if let Some((evicted_index, evicted)) = self.cache.push(index, chunk) {
                if evicted_index != index && evicted.dirty {
                    self.write_chunk(evicted_index, &evicted.data)?;
                }
            }
        }
        self.cache
            .get_mut(&index)
            .ok_or_else(|| FsError::Io(std::io::Error::other("chunk cache lookup failed")))
    }

    fn load_chunk(&mut self, index: u64, existing_len: usize) -> Result<Chunk> {
        let offset = HEADER_LEN + index * CIPHERTEXT_CHUNK_LEN as u64;
        let sealed_len = existing_len + CHUNK_OVERHEAD;
        let mut sealed = vec![0u8; sealed_len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut sealed).map_err(|_| {
            FsError::corrupted_file(&self.path, format!("ciphertext ends inside chunk {index}"))
        })?;
        self.stats.add_bytes_read(sealed_len as u64);

        self.ensure_header()?;
        let header = match self.header.as_ref() {
            Some(h) => h,
            None => return Err(FsError::Io(std::io::Error::other("header missing"))),
        };
        let data = self
            .cryptor
            .decrypt_chunk(&sealed, index, header)
            .map_err(|e| FsError::corrupted_file(&self.path, e.to_string()))?;
        self.stats.add_bytes_decrypted(data.len() as u64);
        trace!(index, len = data.len(), "chunk loaded");
        Ok(Chunk { data, dirty: false })
    }

    fn write_chunk(&mut self, index: u64, data: &[u8]) -> Result<()> {
        self.ensure_header()?;
        let header = match self.header.as_ref() {
            Some(h) => h,
            None => return Err(FsError::Io(std::io::Error::other("header missing"))),
        };
        let sealed = self
            .cryptor
            .encrypt_chunk(data, index, header)
            .map_err(|e| FsError::corrupted_file(&self.path, e.to_string()))?;
        self.stats.add_bytes_encrypted(data.len() as u64);

        let offset = HEADER_LEN + index * CIPHERTEXT_CHUNK_LEN as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&sealed)?;
        self.stats.add_bytes_written(sealed.len() as u64);
        self.needs_sync = true;
        trace!(index, len = data.len(), "chunk written back");
        Ok(())
    }

    /// Drop cached chunks beyond a new size and cut the terminal chunk.
    ///
    /// `old_size` is the size before the truncation; the terminal chunk is
    /// loaded if necessary so its shortened payload can be re-encrypted.
    pub fn truncate_chunks(&mut self, new_size: u64, old_size: u64) -> Result<()> {
        let keep = new_size.div_ceil(CLEARTEXT_CHUNK_LEN as u64);
        let stale: Vec<u64> = self
            .cache
            .iter()
            .map(|(i, _)| *i)
            .filter(|i| *i >= keep)
            .collect();
        for index in stale {
            self.cache.pop(&index);
        }
        let tail = new_size % CLEARTEXT_CHUNK_LEN as u64;
        if tail > 0 {
            let index = keep - 1;
            let existing = chunk_cleartext_len(index, old_size);
            let chunk = self.chunk_mut(index, existing)?;
            chunk.data.truncate(tail as usize);
            chunk.dirty = true;
        }
        self.len_dirty = true;
        Ok(())
    }

    /// Mark the host length stale; the next flush fixes it up.
    pub fn mark_len_dirty(&mut self) {
        self.len_dirty = true;
    }

    /// Write back every dirty chunk and the header, then settle the host
    /// file length to match `size` exactly and sync.
    pub fn flush(&mut self, size: u64) -> Result<()> {
        // Anything to persist needs a header on disk; materialize it now so
        // the header-write branch below sees it as dirty.
        let has_dirty = self.cache.iter().any(|(_, c)| c.dirty);
        if has_dirty || self.len_dirty {
            self.ensure_header()?;
        }
        if self.header_dirty {
            self.ensure_header()?;
            let header = match self.header.as_ref() {
                Some(h) => h,
                None => return Err(FsError::Io(std::io::Error::other("header missing"))),
            };
            let sealed = self
                .cryptor
                .encrypt_header(header)
                .map_err(|e| FsError::corrupted_file(&self.path, e.to_string()))?;
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&sealed)?;
            self.stats.add_bytes_written(sealed.len() as u64);
            self.header_on_disk = true;
            self.header_dirty = false;
            self.needs_sync = true;
        }

        let mut dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(i, _)| *i)
            .collect();
        dirty.sort_unstable();
        for index in dirty {
            let data = match self.cache.peek(&index) {
                Some(chunk) => chunk.data.clone(),
                None => continue,
            };
            self.write_chunk(index, &data)?;
            if let Some(chunk) = self.cache.peek_mut(&index) {
                chunk.dirty = false;
            }
        }

        if self.len_dirty {
            let target = crate::crypto::content::ciphertext_len(size);
            self.file.set_len(target)?;
            self.len_dirty = false;
            self.needs_sync = true;
        }

        if self.needs_sync {
            self.file.sync_data()?;
            self.needs_sync = false;
        }
        Ok(())
    }

    /// Set the host file's modified time, used when a closing file writes
    /// its tracked mtime back.
    pub fn set_host_mtime(&self, mtime: std::time::SystemTime) -> Result<()> {
        self.file.set_modified(mtime)?;
        Ok(())
    }
}
