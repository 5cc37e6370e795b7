//! Connection Table
//!
//! Every open store handle owns one slot of the connection table in the
//! control file. A slot holds the owner's PID, so slots of processes that
//! died without detaching can be found and reclaimed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::control::ControlFile;
use crate::error::{MemKvError, Result};
use crate::shm::process_alive;

/// A claimed connection slot, released on drop
pub(crate) struct Connection {
    control: Arc<ControlFile>,
    slot: usize,
    pid: u32,
}

impl Connection {
    /// Claim a free slot, reaping dead owners once if the table is full
    pub fn admit(control: Arc<ControlFile>) -> Result<Self> {
        if let Some(connection) = Self::try_admit(&control) {
            return Ok(connection);
        }

        if reap_dead(&control) > 0 {
            if let Some(connection) = Self::try_admit(&control) {
                return Ok(connection);
            }
        }

        Err(MemKvError::ConnectionLimitExceeded {
            max: control.geometry().connection_limit as usize,
        })
    }

    fn try_admit(control: &Arc<ControlFile>) -> Option<Self> {
        let pid = std::process::id();
        let slot = control.connections().iter().position(|word| {
            word.load(Ordering::Relaxed) == 0
                && word
                    .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
        })?;

        control
            .header()
            .connection_count
            .fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Connection slot {} claimed by pid {}", slot, pid);

        Some(Self {
            control: Arc::clone(control),
            slot,
            pid,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let word = &self.control.connections()[self.slot];
        if word
            .compare_exchange(self.pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            decrement(&self.control.header().connection_count);
            tracing::debug!("Connection slot {} released", self.slot);
        }
    }
}

/// Release the slots of processes that no longer exist
pub(crate) fn reap_dead(control: &ControlFile) -> usize {
    let mut reaped = 0;
    for (slot, word) in control.connections().iter().enumerate() {
        let pid = word.load(Ordering::Acquire);
        if pid == 0 || process_alive(pid) {
            continue;
        }
        if word
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            decrement(&control.header().connection_count);
            tracing::warn!("Reaped connection slot {} of dead process {}", slot, pid);
            reaped += 1;
        }
    }
    reaped
}

/// Slots currently held by any process
pub(crate) fn occupied_slots(control: &ControlFile) -> usize {
    control
        .connections()
        .iter()
        .filter(|word| word.load(Ordering::Acquire) != 0)
        .count()
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |count| {
        Some(count.saturating_sub(1))
    });
}
