//! Concurrency Tests
//!
//! These tests verify:
//! - Disjoint keyspaces written from many threads do not interfere
//! - Threads sharing one handle and threads with their own handles
//! - Same-key contention leaves exactly one block
//! - Readers never observe torn values

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use memkv::{Config, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp_dir: &TempDir) -> Config {
    Config::builder()
        .name("concurrent")
        .data_dir(temp_dir.path())
        .max_key_size(32)
        .max_value_size(64)
        .max_blocks_per_segment(256)
        .max_segment_count(16)
        .max_connections(64)
        .build()
}

// =============================================================================
// Disjoint Keyspace Tests
// =============================================================================

#[test]
fn test_disjoint_writers_shared_handle() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(test_config(&temp_dir)).unwrap());
    let threads = 8;
    let keys_per_thread = 200;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..keys_per_thread {
                    let key = format!("t{}_k{}", t, i);
                    let value = format!("t{}_v{}", t, i);
                    store.put(key.as_bytes(), value.as_bytes()).unwrap();
                    assert_eq!(store.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        store.stats().unwrap().live_keys,
        (threads * keys_per_thread) as u64
    );
    for t in 0..threads {
        for i in 0..keys_per_thread {
            let key = format!("t{}_k{}", t, i);
            let value = format!("t{}_v{}", t, i);
            assert_eq!(store.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
        }
    }
}

#[test]
fn test_disjoint_put_get_remove_loops_own_handles() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = Store::open(config).unwrap();
                barrier.wait();

                for round in 0..50 {
                    for i in 0..20 {
                        let key = format!("w{}_{}", t, i);
                        let value = format!("w{}_{}_r{}", t, i, round);
                        store.put(key.as_bytes(), value.as_bytes()).unwrap();
                        assert_eq!(
                            store.get(key.as_bytes()).unwrap(),
                            Some(value.into_bytes())
                        );
                        if i % 3 == 0 {
                            store.remove(key.as_bytes()).unwrap();
                            assert_eq!(store.get(key.as_bytes()).unwrap(), None);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let store = Store::open(config).unwrap();
    let stats = store.stats().unwrap();
    // 20 keys per worker, 7 of them removed in the last round
    assert_eq!(stats.live_keys, (threads * 13) as u64);
    assert_eq!(stats.used_blocks, stats.live_keys);
}

// =============================================================================
// Contention Tests
// =============================================================================

#[test]
fn test_same_key_contention_leaves_one_block() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(test_config(&temp_dir)).unwrap());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    let value = format!("writer{}_{}", t, i);
                    store.put(b"hot", value.as_bytes()).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let value = store.get(b"hot").unwrap().unwrap();
    assert!(String::from_utf8(value).unwrap().ends_with("_499"));

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 1);
    assert_eq!(stats.used_blocks, 1);
}

#[test]
fn test_readers_never_see_torn_values() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(test_config(&temp_dir)).unwrap());
    store.put(b"shared", &[b'a'; 64]).unwrap();

    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut fill = b'a';
            while !stop.load(Ordering::Relaxed) {
                fill = if fill == b'z' { b'a' } else { fill + 1 };
                // Alternate lengths so a torn read would mix sizes too
                let len = if fill % 2 == 0 { 64 } else { 17 };
                store.put(b"shared", &vec![fill; len]).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..20_000 {
                    let value = store.get(b"shared").unwrap().unwrap();
                    assert!(value.len() == 64 || value.len() == 17);
                    assert!(value.iter().all(|&b| b == value[0]), "torn read");
                }
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn test_concurrent_segment_growth() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .name("growth")
        .data_dir(temp_dir.path())
        .max_blocks_per_segment(8)
        .max_segment_count(32)
        .max_connections(16)
        .build();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = Store::open(config).unwrap();
                barrier.wait();
                for i in 0..32 {
                    store
                        .put(format!("g{}_{}", t, i).as_bytes(), b"v")
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let store = Store::open(config).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 256);
    assert_eq!(stats.segments, 32);
    assert!(store.put(b"overflow", b"v").is_err());
}
