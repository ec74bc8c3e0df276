//! Centralized configuration constants.
//!
//! This module consolidates the magic numbers used throughout the shardmesh
//! cluster core. Having them in one place makes it easier to:
//!
//! - Understand the coordination constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Placement Constants**: partition space and replication defaults
//! - **Timeout Constants**: coordination and lock budgets
//! - **Executor Constants**: fan-out worker pool sizing

// =============================================================================
// Placement Constants
// =============================================================================

/// Default number of partitions in the key space.
///
/// Must be at least 2; the partition count is fixed at cluster formation and
/// cannot change at runtime. A power of two is conventional but not required
/// (routing is modulo, not bit-masked).
pub const DEFAULT_DISTRIBUTED_SIZE: usize = 16;

/// Minimum allowed partition count.
pub const MIN_DISTRIBUTED_SIZE: usize = 2;

/// Default target number of server (authoritative) holders per partition.
///
/// At steady state every partition has `min(replication_size, node_count)`
/// server holders.
pub const DEFAULT_REPLICATION_SIZE: usize = 2;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default budget for ordinary cluster operations (get/put fan-out, lock
/// acquisition), in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Default budget for a full rehash exchange (snapshot gather, plan push,
/// acknowledgements), in milliseconds.
///
/// Rehash crosses the messaging channel several times per peer; it gets a
/// larger budget than single data operations.
pub const DEFAULT_REHASH_TIMEOUT_MS: u64 = 10_000;

/// Ceiling on how long a single lock ticket may be held before the watchdog
/// reclaims it as a forced unlock, in milliseconds.
pub const DEFAULT_FORCED_LOCK_TIMEOUT_MS: u64 = 60_000;

/// Ceiling for whole-store locks, in milliseconds.
///
/// Whole-store locks cover every partition at once and are expected to be
/// short-lived; the ceiling is tighter than the per-key one.
pub const DEFAULT_FORCED_WHOLE_LOCK_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Executor Constants
// =============================================================================

/// Default fan-out worker pool size. Zero selects sequential mode.
pub const DEFAULT_PARALLEL_REQUEST_THREADS: usize = 0;

/// Upper bound on the fan-out worker pool size.
///
/// One worker per partition is the useful maximum; beyond that workers idle.
pub const MAX_PARALLEL_REQUEST_THREADS: usize = 256;

/// Capacity of the bounded task queue feeding the fan-out worker pool.
pub const FANOUT_TASK_QUEUE_CAPACITY: usize = 1_024;

// =============================================================================
// Snapshot Codec Constants
// =============================================================================

/// Current version byte of the distribution snapshot wire encoding.
pub const SNAPSHOT_CODEC_VERSION: u8 = 1;

/// Fixed header size of an encoded snapshot:
/// version (1) + node id (8) + partition count (4).
pub const SNAPSHOT_HEADER_SIZE: usize = 13;
