//! # memkv
//!
//! A low-latency key-value store shared between processes through
//! memory-mapped files:
//! - Fixed-size blocks in lazily created segment files
//! - Open-addressed key index in shared memory
//! - Striped cross-process locks with dead-owner recovery
//! - Lock-free optimistic reads guarded by sequence counters
//! - Optional host process that keeps stores alive and maintained
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Process A   │  │  Process B   │  │  memkv-host  │
//! │  Store       │  │  Store       │  │  Host        │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │ mmap            │ mmap            │ mmap
//! ┌──────▼─────────────────▼─────────────────▼───────────────────┐
//! │ {data_dir}/{name}/control.mkv                                │
//! │   header │ lock stripes │ connection table │ key index       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ (segment, block)
//!          ┌─────────────────────┼─────────────────────┐
//!          ▼                     ▼                     ▼
//!   ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!   │ segment_000 │       │ segment_001 │  ...  │ segment_N   │
//!   │ [blocks]    │       │ [blocks]    │       │ [blocks]    │
//!   └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use memkv::{Config, Store};
//!
//! let store = Store::open(Config::named("sessions"))?;
//! store.put(b"user:1", b"alice")?;
//! assert_eq!(store.get(b"user:1")?, Some(b"alice".to_vec()));
//! store.remove(b"user:1")?;
//! # Ok::<(), memkv::MemKvError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

mod shm;
mod control;
mod segment;
mod index;
mod manifest;
mod connection;

pub mod store;
pub mod host;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{MemKvError, Result};
pub use config::{Config, ConfigBuilder, LogLevel, SyncStrategy};
pub use control::Geometry;
pub use host::{Host, HostState, DEFAULT_REFRESH_INTERVAL};
pub use shm::LAYOUT_VERSION;
pub use store::{MaintenanceReport, RebuildReport, Store, StoreStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of memkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
