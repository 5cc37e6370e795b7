//! Store Manifest
//!
//! A small file next to the control file recording the config the store was
//! created with, so tools can attach by name alone.
//!
//! ## File Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────┐
//! │ Magic(4) │ Len (4)  │ CRC (4)  │ Payload (bincode)       │
//! └──────────┴──────────┴──────────┴─────────────────────────┘
//! ```
//! Written to a temp file and renamed into place.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{MemKvError, Result};
use crate::shm::{manifest_path, LAYOUT_VERSION};

const MANIFEST_MAGIC: [u8; 4] = *b"MKVM";
const PREFIX_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub layout_version: u32,
    pub config: Config,
    pub created_at_ms: u64,
    pub creator_pid: u32,
}

impl Manifest {
    pub fn new(config: &Config, created_at_ms: u64) -> Self {
        Self {
            layout_version: LAYOUT_VERSION,
            config: config.clone(),
            created_at_ms,
            creator_pid: std::process::id(),
        }
    }

    /// Atomically replace the manifest in `store_dir`
    pub fn write(&self, store_dir: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| MemKvError::Serialization("manifest too large".to_string()))?;

        let mut bytes = Vec::with_capacity(PREFIX_SIZE + payload.len());
        bytes.extend_from_slice(&MANIFEST_MAGIC);
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let path = manifest_path(store_dir);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        tracing::debug!("Wrote manifest {}", path.display());
        Ok(())
    }

    /// Read and verify the manifest in `store_dir`
    pub fn read(store_dir: &Path) -> Result<Self> {
        let path = manifest_path(store_dir);
        let bytes = fs::read(&path)?;

        if bytes.len() < PREFIX_SIZE || bytes[..4] != MANIFEST_MAGIC {
            return Err(MemKvError::Corrupted(format!(
                "{} is not a manifest",
                path.display()
            )));
        }

        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let payload = bytes.get(PREFIX_SIZE..PREFIX_SIZE + len).ok_or_else(|| {
            MemKvError::Corrupted(format!("{} is truncated", path.display()))
        })?;

        if crc32fast::hash(payload) != crc {
            return Err(MemKvError::Corrupted(format!(
                "{} failed its checksum",
                path.display()
            )));
        }

        Ok(bincode::deserialize(payload)?)
    }
}
