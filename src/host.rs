//! Host Module
//!
//! Keeps stores open independently of any client and runs periodic
//! maintenance on them.
//!
//! ## Responsibilities
//! - Track hosted stores by name (Stopped ⇄ Running)
//! - Run one maintenance worker per store every `refresh_interval`
//! - Record the hosting PID in the store so clients can see it
//!
//! Stopping a store only ends hosting. The data lives in the store's files
//! and is picked up again by the next `start` or by attached clients.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{MemKvError, Result};
use crate::store::Store;

/// Maintenance interval used when none is given
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(10_000);

/// Hosting state of one store name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Running,
}

struct HostedStore {
    store: Arc<Store>,
    /// Dropping the sender stops the worker
    shutdown: Sender<()>,
    worker: JoinHandle<()>,
}

impl HostedStore {
    fn stop(self) -> Result<()> {
        let name = self.store.name().to_string();
        drop(self.shutdown);

        if self.worker.join().is_err() {
            tracing::error!("Maintenance worker for '{}' panicked", name);
        }

        self.store.release_host();
        self.store.flush()?;
        tracing::info!("Stopped hosting store '{}'", name);
        Ok(())
    }
}

/// Registry of hosted stores
pub struct Host {
    stores: Mutex<HashMap<String, HostedStore>>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide host instance
    pub fn global() -> &'static Host {
        static HOST: OnceLock<Host> = OnceLock::new();
        HOST.get_or_init(Host::new)
    }

    /// Start hosting the store described by `config`, creating it if needed
    ///
    /// Returns `Ok(false)` if this host already runs a store of that name.
    pub fn start(&self, config: Config, refresh_interval: Duration) -> Result<bool> {
        if refresh_interval.is_zero() {
            return Err(MemKvError::InvalidConfig(
                "refresh interval must be positive".to_string(),
            ));
        }

        let mut stores = self.stores.lock();
        if stores.contains_key(&config.name) {
            return Ok(false);
        }

        let name = config.name.clone();
        let store = Arc::new(Store::open(config)?);
        if let Some(previous) = store.claim_host() {
            tracing::warn!("Store '{}' was hosted by pid {}, taking over", name, previous);
        }

        let (shutdown, signal) = channel::bounded::<()>(1);
        let worker = thread::Builder::new()
            .name(format!("memkv-host-{}", name))
            .spawn({
                let store = Arc::clone(&store);
                move || run_maintenance(store, signal, refresh_interval)
            })?;

        stores.insert(
            name.clone(),
            HostedStore {
                store,
                shutdown,
                worker,
            },
        );

        tracing::info!(
            "Hosting store '{}' (maintenance every {:?})",
            name,
            refresh_interval
        );
        Ok(true)
    }

    /// Stop hosting `name`. Returns `Ok(false)` if it was not running.
    pub fn stop(&self, name: &str) -> Result<bool> {
        let hosted = self.stores.lock().remove(name);
        match hosted {
            Some(hosted) => {
                hosted.stop()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every hosted store, returning how many were running
    pub fn stop_all(&self) -> Result<usize> {
        let drained: Vec<HostedStore> = self.stores.lock().drain().map(|(_, h)| h).collect();
        let count = drained.len();

        let mut first_error = None;
        for hosted in drained {
            if let Err(e) = hosted.stop() {
                tracing::error!("Failed to stop hosted store: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    pub fn state(&self, name: &str) -> HostState {
        if self.stores.lock().contains_key(name) {
            HostState::Running
        } else {
            HostState::Stopped
        }
    }

    /// Names of running stores, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle to a running store
    pub fn store(&self, name: &str) -> Option<Arc<Store>> {
        self.stores
            .lock()
            .get(name)
            .map(|hosted| Arc::clone(&hosted.store))
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Err(e) = self.stop_all() {
            tracing::warn!("Error while stopping hosted stores: {}", e);
        }
    }
}

fn run_maintenance(store: Arc<Store>, signal: Receiver<()>, interval: Duration) {
    tracing::debug!("Maintenance worker for '{}' started", store.name());
    loop {
        match signal.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = store.maintain() {
                    tracing::warn!("Maintenance of '{}' failed: {}", store.name(), e);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Maintenance worker for '{}' stopped", store.name());
}
