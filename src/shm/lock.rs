//! Cross-process lock words
//!
//! A lock is a single `AtomicU32` living in mapped memory. Zero means free;
//! otherwise it holds the PID of the owning process. Threads of the same
//! process contend on the word like any other waiter.
//!
//! If a process dies while holding a lock, the word keeps its PID forever.
//! Waiters periodically check whether the owner is still alive and take the
//! lock over when it is not. The guard reports such a takeover so callers can
//! mark the protected state as suspect.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crossbeam::utils::Backoff;

/// Spins between liveness checks of the current owner
const STALE_CHECK_INTERVAL: u32 = 64;

/// Sleep once the backoff is exhausted
const PARK_DURATION: Duration = Duration::from_micros(50);

/// Held lock; released on drop
pub(crate) struct ShmLockGuard<'a> {
    word: &'a AtomicU32,
    owner: u32,
    recovered: bool,
}

impl ShmLockGuard<'_> {
    /// True when the lock was taken over from a dead process
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        // Only clear our own ownership
        let _ = self
            .word
            .compare_exchange(self.owner, 0, Ordering::Release, Ordering::Relaxed);
    }
}

/// Acquire the lock word, blocking until it is free or its owner is dead
pub(crate) fn lock(word: &AtomicU32) -> ShmLockGuard<'_> {
    let me = std::process::id();
    let backoff = Backoff::new();
    let mut spins: u32 = 0;

    loop {
        match word.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => {
                return ShmLockGuard {
                    word,
                    owner: me,
                    recovered: false,
                }
            }
            Err(owner) => {
                spins = spins.wrapping_add(1);

                if owner != 0
                    && owner != me
                    && spins % STALE_CHECK_INTERVAL == 0
                    && !process_alive(owner)
                    && word
                        .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    tracing::warn!("Recovered lock held by dead process {}", owner);
                    return ShmLockGuard {
                        word,
                        owner: me,
                        recovered: true,
                    };
                }

                if backoff.is_completed() {
                    std::thread::sleep(PARK_DURATION);
                } else {
                    backoff.snooze();
                }
            }
        }
    }
}

/// Whether a process with this PID currently exists
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };

    // Signal 0 only performs the existence/permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable liveness probe every recorded owner is assumed alive
#[cfg(not(unix))]
pub(crate) fn process_alive(pid: u32) -> bool {
    pid != 0
}
