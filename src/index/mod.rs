//! Index Module
//!
//! Shared key index mapping key hashes to block locations.
//!
//! ## Responsibilities
//! - Hash keys and pick their lock stripe
//! - Open-addressed slot table inside the control file
//! - Tombstones for removed keys, cleared by a rebuild

mod table;

pub(crate) use table::{IndexSlot, KeyIndex};

/// Bits of the hash used to select a lock stripe
const STRIPE_BITS: u32 = 6;

/// 32-bit hash of a key
///
/// CRC32 followed by the murmur3 finalizer, so both the low bits (slot) and
/// the high bits (stripe) are well mixed.
pub(crate) fn hash_key(key: &[u8]) -> u32 {
    fmix32(crc32fast::hash(key))
}

/// Lock stripe guarding every key with this hash
pub(crate) fn stripe_of(hash: u32) -> usize {
    (hash >> (32 - STRIPE_BITS)) as usize
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
