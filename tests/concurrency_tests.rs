//! Concurrency tests: racing opens, parallel appends, mixed readers and
//! writers, and the destructive-poll counter semantics.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{open_test_fs, reopen};
use vaultfs::{OpenOptions, VaultPath};

// A5 (scaled down): two threads append to one file; the final size is the
// sum of all appends and every byte reads back without corruption.
#[test]
fn concurrent_appends_interleave_without_corruption() {
    let (tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);
    let path = VaultPath::new("/shared.bin");

    let threads = 2;
    let appends_per_thread = 250;
    let block = 4096usize;

    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                let channel = fs
                    .open_file(
                        &path,
                        &OpenOptions::new().write(true).create(true).append(true),
                    )
                    .unwrap();
                barrier.wait();
                // Every appended block is filled with the thread's marker.
                let payload = vec![t as u8 + 1; block];
                for _ in 0..appends_per_thread {
                    channel.append(&payload).unwrap();
                }
                channel.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (threads * appends_per_thread * block) as u64;
    assert_eq!(fs.attributes(&path).unwrap().size, expected);

    // Blocks are whole: appends never tear.
    let content = fs.read(&path).unwrap();
    assert_eq!(content.len() as u64, expected);
    for chunk in content.chunks(block) {
        assert!(
            chunk.iter().all(|&b| b == chunk[0]) && (chunk[0] == 1 || chunk[0] == 2),
            "interleaved append tore a block"
        );
    }

    // And the bytes survive a reopen.
    drop(fs);
    let fs = reopen(&tmp);
    assert_eq!(fs.read(&path).unwrap().len() as u64, expected);
}

// Racing opens of the same path converge on one coordinator: a write
// through one channel is immediately visible through the other.
#[test]
fn racing_channels_share_one_open_file() {
    let (_tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);
    let path = VaultPath::new("/converge.bin");

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                barrier.wait();
                fs.open_file(
                    &path,
                    &OpenOptions::new().read(true).write(true).create(true),
                )
                .unwrap()
            })
        })
        .collect();
    let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    channels[0].write_at(0, b"seen by all").unwrap();
    for channel in &channels {
        assert_eq!(channel.size().unwrap(), 11);
        let mut buf = [0u8; 11];
        assert_eq!(channel.read_at(0, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"seen by all");
    }
    for channel in channels {
        channel.close().unwrap();
    }
}

#[test]
fn concurrent_readers_on_one_file() {
    let (_tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);
    let path = VaultPath::new("/readers.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 239) as u8).collect();
    fs.write(&path, &content).unwrap();

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            let content = content.clone();
            thread::spawn(move || {
                let channel = fs.open_file(&path, &OpenOptions::new().read(true)).unwrap();
                barrier.wait();
                // Each reader walks the file from a different starting block.
                let block = 8192usize;
                let mut buf = vec![0u8; block];
                let mut pos = (t * 13 * block) % content.len();
                for _ in 0..64 {
                    let n = channel.read_at(pos as u64, &mut buf).unwrap();
                    let end = (pos + n).min(content.len());
                    assert_eq!(&buf[..n], &content[pos..end]);
                    pos = (pos + block * 7) % content.len();
                }
                channel.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn mixed_readers_and_writers_stay_consistent() {
    let (_tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);
    let path = VaultPath::new("/mixed.bin");
    fs.write(&path, &[0u8; 65536]).unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let fs = Arc::clone(&fs);
        let path = path.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let channel = fs
                .open_file(&path, &OpenOptions::new().write(true))
                .unwrap();
            let mut round = 1u8;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                // A whole-block write: readers must never see a torn block.
                channel.write_at(16384, &[round; 16384]).unwrap();
                round = round.wrapping_add(1).max(1);
            }
            channel.close().unwrap();
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let path = path.clone();
            thread::spawn(move || {
                let channel = fs.open_file(&path, &OpenOptions::new().read(true)).unwrap();
                let mut buf = vec![0u8; 16384];
                for _ in 0..200 {
                    let n = channel.read_at(16384, &mut buf).unwrap();
                    assert_eq!(n, 16384);
                    assert!(
                        buf[..n].iter().all(|&b| b == buf[0]),
                        "read observed a torn write"
                    );
                }
                channel.close().unwrap();
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().unwrap();
}

// A6 analogue through the public surface: the destructive polls account
// for every byte exactly once.
#[test]
fn stats_polls_drain_exactly_once() {
    let (_tmp, fs) = open_test_fs();
    let path = VaultPath::new("/counted.bin");
    let payload = vec![0x5Au8; 100_000];

    fs.write(&path, &payload).unwrap();
    let encrypted_first = fs.poll_bytes_encrypted();
    assert_eq!(encrypted_first, payload.len() as u64);
    assert_eq!(fs.poll_bytes_encrypted(), 0);

    let written = fs.poll_bytes_written();
    assert!(written > payload.len() as u64, "header and chunk overhead");
    assert_eq!(fs.poll_bytes_written(), 0);

    let before_read = fs.poll_bytes_decrypted();
    assert_eq!(before_read, 0);
    let content = fs.read(&path).unwrap();
    assert_eq!(content.len(), payload.len());
    assert_eq!(fs.poll_bytes_decrypted(), payload.len() as u64);
    assert_eq!(fs.poll_bytes_decrypted(), 0);

    let accesses = fs.poll_chunk_cache_accesses();
    let misses = fs.poll_chunk_cache_misses();
    assert!(accesses >= misses);
    assert!(misses > 0);
    assert_eq!(fs.poll_chunk_cache_accesses(), 0);
}

#[test]
fn concurrent_stats_polling_loses_nothing() {
    let (_tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);

    // Writers generate encrypted bytes while a poller drains the counter;
    // the drained total plus a final poll must equal the bytes written.
    let writers = 4;
    let files_per_writer = 8;
    let file_size = 10_000usize;

    let poller = {
        let fs = Arc::clone(&fs);
        thread::spawn(move || {
            let mut drained = 0u64;
            for _ in 0..500 {
                drained += fs.poll_bytes_encrypted();
                thread::yield_now();
            }
            drained
        })
    };

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..files_per_writer {
                    let path = VaultPath::new(format!("/w{w}_{i}.bin"));
                    fs.write(&path, &vec![1u8; file_size]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let drained = poller.join().unwrap();
    let total = drained + fs.poll_bytes_encrypted();
    assert_eq!(total, (writers * files_per_writer * file_size) as u64);
}

#[test]
fn concurrent_file_creation_in_one_directory() {
    let (_tmp, fs) = open_test_fs();
    let fs = Arc::new(fs);
    fs.create_dir(&VaultPath::new("/busy")).unwrap();

    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..10 {
                    let path = VaultPath::new(format!("/busy/file_{t}_{i}.txt"));
                    fs.write(&path, format!("{t}:{i}").as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = fs.list_dir(&VaultPath::new("/busy")).unwrap();
    assert_eq!(entries.len(), threads * 10);
    for t in 0..threads {
        for i in 0..10 {
            let path = VaultPath::new(format!("/busy/file_{t}_{i}.txt"));
            assert_eq!(fs.read(&path).unwrap(), format!("{t}:{i}").as_bytes());
        }
    }
}
