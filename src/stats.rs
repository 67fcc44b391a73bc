//! Filesystem performance counters with poll-and-reset semantics.
//!
//! Counters are sharded across cache-line-padded atomics so concurrent
//! readers and writers on different threads do not contend on a single hot
//! line. A poll atomically drains every shard: the sum over all polls always
//! equals the total of all increments, for every interleaving.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SHARDS: usize = 8;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_INDEX: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

/// One shard, padded to its own cache line.
#[repr(align(64))]
#[derive(Debug, Default)]
struct Shard(AtomicU64);

/// A monotonic counter supporting lock-free increments and destructive polls.
#[derive(Debug, Default)]
pub struct Counter {
    shards: [Shard; SHARDS],
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter. Lock-free; each thread sticks to one shard.
    #[inline]
    pub fn add(&self, n: u64) {
        let idx = SHARD_INDEX.with(|i| *i);
        self.shards[idx].0.fetch_add(n, Ordering::Relaxed);
    }

    /// Return the accumulated sum and reset it to zero.
    ///
    /// Every increment is counted by exactly one poll: each shard is drained
    /// with an atomic swap, so increments racing with a poll land either in
    /// this poll's sum or in the next one, never in both or neither.
    pub fn poll(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.0.swap(0, Ordering::AcqRel))
            .sum()
    }

    /// Non-destructive snapshot, used by tests and diagnostics.
    pub fn peek(&self) -> u64 {
        self.shards.iter().map(|s| s.0.load(Ordering::Relaxed)).sum()
    }
}

/// Per-filesystem performance metrics.
///
/// Raw bytes moved to or from the host ciphertext files are tracked
/// separately from the plaintext bytes produced or consumed by the chunk
/// cipher, so callers can observe both transport and crypto throughput.
#[derive(Debug, Default)]
pub struct FsStats {
    bytes_read: Counter,
    bytes_written: Counter,
    bytes_encrypted: Counter,
    bytes_decrypted: Counter,
    chunk_cache_accesses: Counter,
    chunk_cache_misses: Counter,
}

impl FsStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_encrypted(&self, n: u64) {
        self.bytes_encrypted.add(n);
    }

    #[inline]
    pub(crate) fn add_bytes_decrypted(&self, n: u64) {
        self.bytes_decrypted.add(n);
    }

    #[inline]
    pub(crate) fn add_chunk_cache_access(&self) {
        self.chunk_cache_accesses.add(1);
    }

    #[inline]
    pub(crate) fn add_chunk_cache_miss(&self) {
        self.chunk_cache_misses.add(1);
    }

    /// Raw ciphertext bytes read from the host since the last poll.
    pub fn poll_bytes_read(&self) -> u64 {
        self.bytes_read.poll()
    }

    /// Raw ciphertext bytes written to the host since the last poll.
    pub fn poll_bytes_written(&self) -> u64 {
        self.bytes_written.poll()
    }

    /// Plaintext bytes consumed by chunk encryption since the last poll.
    pub fn poll_bytes_encrypted(&self) -> u64 {
        self.bytes_encrypted.poll()
    }

    /// Plaintext bytes produced by chunk decryption since the last poll.
    pub fn poll_bytes_decrypted(&self) -> u64 {
        self.bytes_decrypted.poll()
    }

    /// Chunk cache lookups since the last poll.
    pub fn poll_chunk_cache_accesses(&self) -> u64 {
        self.chunk_cache_accesses.poll()
    }

    /// Chunk cache misses since the last poll. Hits are accesses minus misses.
    pub fn poll_chunk_cache_misses(&self) -> u64 {
        self.chunk_cache_misses.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_then_poll_then_zero() {
        let c = Counter::new();
        c.add(3);
        c.add(4);
        assert_eq!(c.poll(), 7);
        assert_eq!(c.poll(), 0);
    }

    #[test]
    fn peek_does_not_reset() {
        let c = Counter::new();
        c.add(10);
        assert_eq!(c.peek(), 10);
        assert_eq!(c.peek(), 10);
        assert_eq!(c.poll(), 10);
    }

    #[test]
    fn concurrent_increments_are_all_counted() {
        let c = Arc::new(Counter::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    for _ in 0..125_000 {
                        c.add(1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(c.poll(), 1_000_000);
        assert_eq!(c.poll(), 0);
    }

    #[test]
    fn polls_racing_with_increments_lose_nothing() {
        let c = Arc::new(Counter::new());
        let total: u64 = 200_000;
        let adder = {
            let c = Arc::clone(&c);
            thread::spawn(move || {
                for _ in 0..total {
                    c.add(1);
                }
            })
        };
        let mut polled = 0u64;
        while polled < total {
            polled += c.poll();
            thread::yield_now();
        }
        adder.join().unwrap();
        polled += c.poll();
        assert_eq!(polled, total);
    }

    #[test]
    fn fs_stats_counters_are_independent() {
        let stats = FsStats::new();
        stats.add_bytes_read(100);
        stats.add_bytes_written(200);
        stats.add_chunk_cache_access();
        stats.add_chunk_cache_access();
        stats.add_chunk_cache_miss();
        assert_eq!(stats.poll_bytes_read(), 100);
        assert_eq!(stats.poll_bytes_written(), 200);
        assert_eq!(stats.poll_chunk_cache_accesses(), 2);
        assert_eq!(stats.poll_chunk_cache_misses(), 1);
        assert_eq!(stats.poll_bytes_encrypted(), 0);
        assert_eq!(stats.poll_bytes_read(), 0);
    }
}
