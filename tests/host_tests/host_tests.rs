//! Tests for Host
//!
//! These tests verify:
//! - The Stopped → Running → Stopped state machine per store name
//! - Start/stop idempotence and stop_all
//! - Periodic maintenance on hosted stores
//! - Data outliving the host and being picked up by the next start

use std::thread;
use std::time::{Duration, Instant};

use memkv::{Config, Host, HostState, MemKvError, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const FAST_REFRESH: Duration = Duration::from_millis(20);

fn test_config(temp_dir: &TempDir, name: &str) -> Config {
    Config::builder()
        .name(name)
        .data_dir(temp_dir.path())
        .max_blocks_per_segment(32)
        .max_segment_count(2)
        .max_connections(8)
        .build()
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// =============================================================================
// State Machine Tests
// =============================================================================

#[test]
fn test_start_and_stop() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();

    assert_eq!(host.state("alpha"), HostState::Stopped);
    assert!(host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap());
    assert_eq!(host.state("alpha"), HostState::Running);
    assert_eq!(host.running(), vec!["alpha".to_string()]);

    assert!(host.stop("alpha").unwrap());
    assert_eq!(host.state("alpha"), HostState::Stopped);
    assert!(host.running().is_empty());
}

#[test]
fn test_start_twice_is_noop() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();

    assert!(host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap());
    assert!(!host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap());
    assert_eq!(host.running().len(), 1);
}

#[test]
fn test_stop_when_stopped() {
    let host = Host::new();
    assert!(!host.stop("never-started").unwrap());
}

#[test]
fn test_stop_all() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();

    for name in ["a", "b", "c"] {
        host.start(test_config(&temp_dir, name), FAST_REFRESH).unwrap();
    }
    assert_eq!(host.running(), vec!["a", "b", "c"]);

    assert_eq!(host.stop_all().unwrap(), 3);
    assert!(host.running().is_empty());
    assert_eq!(host.stop_all().unwrap(), 0);
}

#[test]
fn test_zero_refresh_interval_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();

    assert!(matches!(
        host.start(test_config(&temp_dir, "alpha"), Duration::ZERO),
        Err(MemKvError::InvalidConfig(_))
    ));
    assert_eq!(host.state("alpha"), HostState::Stopped);
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();

    let mut config = test_config(&temp_dir, "alpha");
    config.max_value_size = 0;
    assert!(matches!(
        host.start(config, FAST_REFRESH),
        Err(MemKvError::InvalidConfig(_))
    ));

    assert!(matches!(
        host.start(test_config(&temp_dir, ""), FAST_REFRESH),
        Err(MemKvError::InvalidConfig(_))
    ));
    assert!(host.running().is_empty());
}

#[test]
fn test_incompatible_existing_store_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let _client = Store::open(test_config(&temp_dir, "alpha")).unwrap();
    let host = Host::new();

    let mut config = test_config(&temp_dir, "alpha");
    config.max_key_size = 128;

    assert!(matches!(
        host.start(config, FAST_REFRESH),
        Err(MemKvError::IncompatibleLayout(_))
    ));
    assert_eq!(host.state("alpha"), HostState::Stopped);
}

// =============================================================================
// Hosting Behavior Tests
// =============================================================================

#[test]
fn test_host_recorded_in_store() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();
    host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();

    let client = Store::attach(temp_dir.path(), "alpha").unwrap();
    let stats = client.stats().unwrap();
    assert_eq!(stats.host_pid, Some(std::process::id()));
    assert!(stats.host_alive);

    host.stop("alpha").unwrap();
    assert_eq!(client.stats().unwrap().host_pid, None);
}

#[test]
fn test_maintenance_runs_periodically() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();
    host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();

    let store = host.store("alpha").unwrap();
    wait_for(|| store.stats().unwrap().maintenance_runs >= 3);
}

#[test]
fn test_maintenance_stops_with_host() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();
    host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();
    let store = host.store("alpha").unwrap();
    wait_for(|| store.stats().unwrap().maintenance_runs >= 1);

    host.stop("alpha").unwrap();
    let runs = store.stats().unwrap().maintenance_runs;
    thread::sleep(FAST_REFRESH * 5);

    assert_eq!(store.stats().unwrap().maintenance_runs, runs);
    assert!(host.store("alpha").is_none());
}

#[test]
fn test_clients_work_while_hosted() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();
    host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();

    let client = Store::attach(temp_dir.path(), "alpha").unwrap();
    for round in 0..20 {
        for i in 0..32 {
            let key = format!("k{}", i);
            client.put(key.as_bytes(), format!("r{}", round).as_bytes()).unwrap();
            if i % 2 == 0 {
                client.remove(key.as_bytes()).unwrap();
            }
        }
        thread::sleep(Duration::from_millis(2));
    }

    for i in (1..32).step_by(2) {
        assert_eq!(
            client.get(format!("k{}", i).as_bytes()).unwrap(),
            Some(b"r19".to_vec())
        );
    }
}

#[test]
fn test_data_survives_stop_and_restart() {
    let temp_dir = TempDir::new().unwrap();
    let host = Host::new();
    host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();

    {
        let client = Store::attach(temp_dir.path(), "alpha").unwrap();
        client.put(b"persistent", b"yes").unwrap();
    }

    host.stop("alpha").unwrap();
    assert!(host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap());

    let store = host.store("alpha").unwrap();
    assert_eq!(store.get(b"persistent").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_host_drop_stops_everything() {
    let temp_dir = TempDir::new().unwrap();
    {
        let host = Host::new();
        host.start(test_config(&temp_dir, "alpha"), FAST_REFRESH).unwrap();
    }

    // The host's connection is gone, so the store can be destroyed
    assert!(Store::destroy(temp_dir.path(), "alpha").unwrap());
}
