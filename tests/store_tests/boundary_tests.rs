//! Boundary Tests
//!
//! These tests verify:
//! - Key and value length limits (inclusive)
//! - Empty key rejection, empty value acceptance
//! - The capacity ceiling and that overwrites never consume capacity
//! - Put/remove churn keeps the key index from filling with tombstones
//! - The connection ceiling and slot reuse after detach

use memkv::{Config, MemKvError, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_sized_store(max_key: usize, max_value: usize) -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .name("bounds")
        .data_dir(temp_dir.path())
        .max_key_size(max_key)
        .max_value_size(max_value)
        .max_blocks_per_segment(16)
        .max_segment_count(2)
        .max_connections(4)
        .build();
    let store = Store::open(config).unwrap();
    (temp_dir, store)
}

fn setup_capacity_store(blocks: usize, segments: usize) -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .name("capacity")
        .data_dir(temp_dir.path())
        .max_blocks_per_segment(blocks)
        .max_segment_count(segments)
        .build();
    let store = Store::open(config).unwrap();
    (temp_dir, store)
}

// =============================================================================
// Key / Value Length Tests
// =============================================================================

#[test]
fn test_key_at_max_size_accepted() {
    let (_temp, store) = setup_sized_store(64, 256);
    let key = vec![b'k'; 64];

    store.put(&key, b"value").unwrap();

    assert_eq!(store.get(&key).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_key_over_max_size_rejected() {
    let (_temp, store) = setup_sized_store(64, 256);
    let key = vec![b'k'; 65];

    assert!(matches!(
        store.put(&key, b"value"),
        Err(MemKvError::KeyTooLong { len: 65, max: 64 })
    ));
    assert!(matches!(
        store.get(&key),
        Err(MemKvError::KeyTooLong { .. })
    ));
    assert!(matches!(
        store.remove(&key),
        Err(MemKvError::KeyTooLong { .. })
    ));
    assert_eq!(store.stats().unwrap().live_keys, 0);
}

#[test]
fn test_value_at_max_size_accepted() {
    let (_temp, store) = setup_sized_store(64, 256);
    let value = vec![0x5Au8; 256];

    store.put(b"key", &value).unwrap();

    assert_eq!(store.get(b"key").unwrap(), Some(value));
}

#[test]
fn test_value_over_max_size_rejected() {
    let (_temp, store) = setup_sized_store(64, 256);
    let value = vec![0x5Au8; 257];

    assert!(matches!(
        store.put(b"key", &value),
        Err(MemKvError::ValueTooLong { len: 257, max: 256 })
    ));
    assert_eq!(store.get(b"key").unwrap(), None);
}

#[test]
fn test_rejected_overwrite_keeps_old_value() {
    let (_temp, store) = setup_sized_store(8, 8);
    store.put(b"key", b"old").unwrap();

    assert!(store.put(b"key", b"far too long").is_err());

    assert_eq!(store.get(b"key").unwrap(), Some(b"old".to_vec()));
}

#[test]
fn test_empty_key_rejected() {
    let (_temp, store) = setup_sized_store(64, 256);

    assert!(matches!(store.put(b"", b"v"), Err(MemKvError::EmptyKey)));
    assert!(matches!(store.get(b""), Err(MemKvError::EmptyKey)));
    assert!(matches!(store.remove(b""), Err(MemKvError::EmptyKey)));
}

#[test]
fn test_empty_value_accepted() {
    let (_temp, store) = setup_sized_store(64, 256);

    store.put(b"k", b"").unwrap();

    assert_eq!(store.get(b"k").unwrap(), Some(Vec::new()));
    let mut buf = [0u8; 0];
    assert_eq!(store.get_into(b"k", &mut buf).unwrap(), 0);
}

#[test]
fn test_single_byte_limits() {
    let (_temp, store) = setup_sized_store(1, 1);

    store.put(b"a", b"b").unwrap();

    assert_eq!(store.get(b"a").unwrap(), Some(b"b".to_vec()));
    assert!(store.put(b"ab", b"c").is_err());
    assert!(store.put(b"a", b"cd").is_err());
}

// =============================================================================
// Capacity Tests
// =============================================================================

#[test]
fn test_capacity_ceiling() {
    let (_temp, store) = setup_capacity_store(100, 1);

    for i in 0..100 {
        store.put(format!("key{}", i).as_bytes(), b"value").unwrap();
    }

    assert!(matches!(
        store.put(b"key100", b"value"),
        Err(MemKvError::CapacityExceeded)
    ));

    // Existing data is intact
    for i in 0..100 {
        assert_eq!(
            store.get(format!("key{}", i).as_bytes()).unwrap(),
            Some(b"value".to_vec())
        );
    }
}

#[test]
fn test_capacity_across_segments() {
    let (_temp, store) = setup_capacity_store(10, 3);

    for i in 0..30 {
        store.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }

    assert!(matches!(
        store.put(b"one-too-many", b"v"),
        Err(MemKvError::CapacityExceeded)
    ));
    assert_eq!(store.stats().unwrap().segments, 3);
}

#[test]
fn test_overwrite_at_capacity_succeeds() {
    let (_temp, store) = setup_capacity_store(10, 1);

    for i in 0..10 {
        store.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }

    for round in 0..5 {
        let value = format!("round{}", round);
        store.put(b"key3", value.as_bytes()).unwrap();
        assert_eq!(store.get(b"key3").unwrap(), Some(value.into_bytes()));
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 10);
    assert_eq!(stats.used_blocks, 10);
}

#[test]
fn test_remove_frees_capacity() {
    let (_temp, store) = setup_capacity_store(10, 1);

    for i in 0..10 {
        store.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }
    assert!(store.put(b"extra", b"v").is_err());

    store.remove(b"key0").unwrap();
    store.put(b"extra", b"v").unwrap();

    assert_eq!(store.get(b"extra").unwrap(), Some(b"v".to_vec()));
    assert_eq!(store.get(b"key0").unwrap(), None);
}

#[test]
fn test_churn_at_capacity() {
    let (_temp, store) = setup_capacity_store(8, 1);

    // Far more inserts than the table has slots; tombstones are compacted away
    for i in 0..500 {
        let key = format!("churn{}", i);
        store.put(key.as_bytes(), b"v").unwrap();
        store.remove(key.as_bytes()).unwrap();
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 0);
    assert_eq!(stats.used_blocks, 0);
    assert!(stats.tombstones * 4 <= stats.index_capacity as u64);

    for i in 0..8 {
        store.put(format!("final{}", i).as_bytes(), b"v").unwrap();
    }
    assert!(store.put(b"over", b"v").is_err());
}

#[test]
fn test_churn_keeps_index_healthy_without_host() {
    let (_temp, store) = setup_capacity_store(8, 1);
    let index_capacity = store.stats().unwrap().index_capacity as u64;
    assert_eq!(index_capacity, 16);

    for i in 0..4 {
        store.put(format!("resident{}", i).as_bytes(), b"r").unwrap();
    }

    for i in 0..2000 {
        let key = format!("churn{}", i);
        store.put(key.as_bytes(), b"v").unwrap();
        store.remove(key.as_bytes()).unwrap();

        let stats = store.stats().unwrap();
        assert!(
            stats.live_keys + stats.tombstones < index_capacity,
            "index full after {} rounds: {}",
            i,
            stats
        );
        assert!(stats.tombstones * 4 <= index_capacity);
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 4);
    assert_eq!(stats.used_blocks, 4);
    assert_eq!(stats.maintenance_runs, 0);
    for i in 0..4 {
        assert_eq!(
            store.get(format!("resident{}", i).as_bytes()).unwrap(),
            Some(b"r".to_vec())
        );
    }
    assert_eq!(store.get(b"churn0").unwrap(), None);
}

#[test]
fn test_overwrite_churn_at_capacity() {
    let (_temp, store) = setup_capacity_store(4, 2);
    for i in 0..8 {
        store.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }

    for round in 0..100 {
        let key = format!("key{}", round % 8);
        let value = format!("round{}", round);
        store.put(key.as_bytes(), value.as_bytes()).unwrap();
        assert_eq!(store.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_keys, 8);
    assert_eq!(stats.used_blocks, 8);
    assert!(matches!(
        store.put(b"extra", b"v"),
        Err(MemKvError::CapacityExceeded)
    ));
}

// =============================================================================
// Connection Limit Tests
// =============================================================================

#[test]
fn test_connection_ceiling() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .name("crowded")
        .data_dir(temp_dir.path())
        .max_blocks_per_segment(10)
        .max_segment_count(1)
        .build();
    assert_eq!(config.max_connections, 1000);

    let handles: Vec<Store> = (0..1000)
        .map(|_| Store::open(config.clone()).unwrap())
        .collect();
    assert_eq!(handles[0].stats().unwrap().connections, 1000);

    assert!(matches!(
        Store::open(config.clone()),
        Err(MemKvError::ConnectionLimitExceeded { max: 1000 })
    ));

    // Existing connections keep working
    handles[10].put(b"key", b"value").unwrap();
    assert_eq!(handles[999].get(b"key").unwrap(), Some(b"value".to_vec()));

    // Detaching one frees a slot
    let mut handles = handles;
    handles.pop().unwrap().dispose();
    let replacement = Store::open(config.clone()).unwrap();
    assert_eq!(replacement.get(b"key").unwrap(), Some(b"value".to_vec()));

    assert!(Store::open(config).is_err());
}

#[test]
fn test_connection_ceiling_via_attach() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .name("small")
        .data_dir(temp_dir.path())
        .max_connections(2)
        .max_blocks_per_segment(10)
        .max_segment_count(1)
        .build();

    let _first = Store::open(config).unwrap();
    let _second = Store::attach(temp_dir.path(), "small").unwrap();

    assert!(matches!(
        Store::attach(temp_dir.path(), "small"),
        Err(MemKvError::ConnectionLimitExceeded { max: 2 })
    ));
}
