//! Configuration for memkv
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MemKvError, Result};

// =============================================================================
// Limits
// =============================================================================

/// Largest accepted `max_key_size` (bytes)
pub const KEY_SIZE_LIMIT: usize = 64 * 1024;

/// Largest accepted `max_value_size` (bytes)
pub const VALUE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Largest accepted total block count (`max_blocks_per_segment * max_segment_count`)
pub const TOTAL_BLOCKS_LIMIT: usize = 1 << 24;

/// Largest accepted `max_connections`
pub const CONNECTIONS_LIMIT: usize = 65_536;

/// Longest accepted store name
pub const NAME_LENGTH_LIMIT: usize = 128;

/// Main configuration for a memkv store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------
    /// Store name, shared by every process that opens the store
    pub name: String,

    /// Root directory for all stores
    /// Internal structure:
    ///   {data_dir}/{name}/
    ///     ├── control.mkv        (header, locks, connections, key index)
    ///     ├── manifest.bin       (creating config, bincode + crc)
    ///     └── segment_000.mkv    (one file per segment)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Geometry (fixed at creation)
    // -------------------------------------------------------------------------
    /// Max key length in bytes
    pub max_key_size: usize,

    /// Max value length in bytes
    pub max_value_size: usize,

    /// Blocks per segment file
    pub max_blocks_per_segment: usize,

    /// Max number of segment files
    pub max_segment_count: usize,

    /// Max concurrent attachments
    pub max_connections: usize,

    // -------------------------------------------------------------------------
    // Behavior
    // -------------------------------------------------------------------------
    /// When mapped pages are pushed to disk
    pub sync_strategy: SyncStrategy,

    /// Log verbosity used by the binaries when RUST_LOG is unset
    pub log_level: LogLevel,
}

/// Sync strategy: when dirty mapped pages are flushed to the backing files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    /// msync the touched block and index slot before `put` returns
    EveryWrite,

    /// Leave flushing to the OS, maintenance, and explicit `flush()` calls
    Deferred,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// EnvFilter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

impl FromStr for LogLevel {
    type Err = MemKvError;

    /// Accepts level names or the numeric levels 0 (off) through 5 (trace)
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "1" => Ok(LogLevel::Error),
            "warn" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            other => Err(MemKvError::InvalidConfig(format!(
                "unknown log level: {}",
                other
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_dir: std::env::temp_dir().join("memkv"),
            max_key_size: 64,
            max_value_size: 256,
            max_blocks_per_segment: 1000,
            max_segment_count: 100,
            max_connections: 1000,
            sync_strategy: SyncStrategy::Deferred,
            log_level: LogLevel::Off,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Default configuration for the named store
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Total block capacity of the store
    pub fn capacity(&self) -> usize {
        self.max_blocks_per_segment
            .saturating_mul(self.max_segment_count)
    }

    /// Check every field against the on-disk layout limits
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        let positive = [
            ("max_key_size", self.max_key_size),
            ("max_value_size", self.max_value_size),
            ("max_blocks_per_segment", self.max_blocks_per_segment),
            ("max_segment_count", self.max_segment_count),
            ("max_connections", self.max_connections),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(MemKvError::InvalidConfig(format!(
                    "{} must be positive",
                    field
                )));
            }
        }

        if self.max_key_size > KEY_SIZE_LIMIT {
            return Err(MemKvError::InvalidConfig(format!(
                "max_key_size {} exceeds limit {}",
                self.max_key_size, KEY_SIZE_LIMIT
            )));
        }
        if self.max_value_size > VALUE_SIZE_LIMIT {
            return Err(MemKvError::InvalidConfig(format!(
                "max_value_size {} exceeds limit {}",
                self.max_value_size, VALUE_SIZE_LIMIT
            )));
        }
        if self.capacity() > TOTAL_BLOCKS_LIMIT {
            return Err(MemKvError::InvalidConfig(format!(
                "total block count {} exceeds limit {}",
                self.capacity(),
                TOTAL_BLOCKS_LIMIT
            )));
        }
        if self.max_connections > CONNECTIONS_LIMIT {
            return Err(MemKvError::InvalidConfig(format!(
                "max_connections {} exceeds limit {}",
                self.max_connections, CONNECTIONS_LIMIT
            )));
        }

        Ok(())
    }

    /// Directory holding this store's files
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }
}

/// Store names become directory names, so only a safe character set is allowed
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MemKvError::InvalidConfig(
            "store name must not be empty".to_string(),
        ));
    }
    if name.len() > NAME_LENGTH_LIMIT {
        return Err(MemKvError::InvalidConfig(format!(
            "store name longer than {} bytes",
            NAME_LENGTH_LIMIT
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(MemKvError::InvalidConfig(format!(
            "store name {:?} may only contain [A-Za-z0-9_-]",
            name
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the store name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the data directory (root for all stores)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the max key length
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the max value length
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Set the number of blocks in each segment
    pub fn max_blocks_per_segment(mut self, count: usize) -> Self {
        self.config.max_blocks_per_segment = count;
        self
    }

    /// Set the maximum number of segments
    pub fn max_segment_count(mut self, count: usize) -> Self {
        self.config.max_segment_count = count;
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
