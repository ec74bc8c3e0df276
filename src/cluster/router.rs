//! Deterministic key-to-partition routing.
//!
//! Every node must map a given key to the same partition index, so the hash
//! must be stable across processes, platforms, and releases. The default
//! router uses FNV-1a 64 over the key's serialized bytes reduced modulo the
//! partition count. `std::hash` types are deliberately avoided: their output
//! is not guaranteed stable between builds.

use crate::types::PartitionIndex;

/// Pluggable, stateless key-to-partition mapping.
///
/// Contract: identical `key` and `distributed_size` always yield the same
/// index on every node. Changing `distributed_size` at runtime is not
/// supported; it is fixed at cluster formation.
pub trait PartitionRouter: Send + Sync {
    /// Map a key to a partition index in `[0, distributed_size)`.
    fn select_partition(&self, key: &[u8], distributed_size: usize) -> PartitionIndex;
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Default router: FNV-1a 64 over the key bytes, reduced modulo the
/// partition count.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableHashRouter;

impl StableHashRouter {
    /// Compute the raw FNV-1a 64 hash of a byte slice.
    pub fn hash(bytes: &[u8]) -> u64 {
        let mut hash = FNV_OFFSET_BASIS;
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl PartitionRouter for StableHashRouter {
    fn select_partition(&self, key: &[u8], distributed_size: usize) -> PartitionIndex {
        debug_assert!(distributed_size > 0);
        (Self::hash(key) % distributed_size as u64) as PartitionIndex
    }
}
