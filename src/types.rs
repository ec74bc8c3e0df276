//! Type-safe wrappers for cluster primitives.
//!
//! These newtypes prevent mixing up integer values that share an underlying
//! representation but carry different semantic meanings (node identifiers vs
//! partition indexes vs raw counts).

use std::fmt;

/// Identifier of a cluster node.
///
/// Node ids are assigned at cluster formation and are stable for the lifetime
/// of the node. Ordering of node ids is meaningful: it is the documented
/// tie-break for rebalance candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a node id from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        NodeId(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Index of a partition within the fixed partition space.
///
/// Always in `[0, distributed_size)`. The partition count is fixed at
/// cluster formation and never changes at runtime.
pub type PartitionIndex = usize;

/// Role of a node for a single partition.
///
/// The state machine is `Unassigned -> Client <-> Server`. Transitions are
/// driven only by applying a rebalance plan entry; once any placement exists
/// for a partition, it never returns to `Unassigned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PartitionRole {
    /// No placement has been applied yet for this partition.
    #[default]
    Unassigned = 0,
    /// This node proxies the partition to a server holder.
    Client = 1,
    /// This node is an authoritative replica for the partition.
    Server = 2,
}

impl PartitionRole {
    /// True if this node is an authoritative replica.
    #[inline]
    pub const fn is_server(self) -> bool {
        matches!(self, PartitionRole::Server)
    }

    /// Decode from the atomic storage representation.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PartitionRole::Client,
            2 => PartitionRole::Server,
            _ => PartitionRole::Unassigned,
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRole::Unassigned => write!(f, "unassigned"),
            PartitionRole::Client => write!(f, "client"),
            PartitionRole::Server => write!(f, "server"),
        }
    }
}
