//! File naming inside a store directory

use std::path::{Path, PathBuf};

const CONTROL_FILENAME: &str = "control.mkv";
const MANIFEST_FILENAME: &str = "manifest.bin";

/// Directory holding one store's files
pub(crate) fn store_dir(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(name)
}

/// Control file: header, lock stripes, connection table, key index
pub(crate) fn control_path(store_dir: &Path) -> PathBuf {
    store_dir.join(CONTROL_FILENAME)
}

/// Manifest: the creating config
pub(crate) fn manifest_path(store_dir: &Path) -> PathBuf {
    store_dir.join(MANIFEST_FILENAME)
}

/// Segment file for the given ordinal
pub(crate) fn segment_path(store_dir: &Path, id: u32) -> PathBuf {
    store_dir.join(format!("segment_{:03}.mkv", id))
}

/// Parse a segment ordinal from a file name
/// "segment_007.mkv" → Some(7)
pub(crate) fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension()? != "mkv" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("segment_")?.parse().ok()
}
