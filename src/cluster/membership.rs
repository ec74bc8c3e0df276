//! Cluster membership view and change notifications.
//!
//! Placement decisions depend on a consistently ordered member list: every
//! node must walk the same sequence when determining the main role, so
//! [`MembershipService::members`] always returns ascending node ids.
//!
//! Membership changes are broadcast as [`MembershipEvent`]s; the coordinator
//! subscribes and converts events into rehash attempts on the main node.
//! [`StaticMembership`] is the built-in implementation with explicit
//! add/remove, suitable for embedded clusters and tests; discovery-backed
//! implementations plug in behind the same trait.

use std::collections::BTreeSet;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::info;

use crate::types::NodeId;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change in cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(NodeId),
    Removed(NodeId),
}

/// Source of the ordered member list and membership change events.
pub trait MembershipService: Send + Sync {
    /// Current members, ascending by node id. Includes the local node.
    fn members(&self) -> Vec<NodeId>;

    /// True if `node` is currently a member.
    fn contains(&self, node: NodeId) -> bool;

    /// Subscribe to membership changes. Slow subscribers may observe lagged
    /// receives and should re-read `members` to resynchronize.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Explicitly managed membership.
pub struct StaticMembership {
    members: RwLock<BTreeSet<NodeId>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(initial: impl IntoIterator<Item = NodeId>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            members: RwLock::new(initial.into_iter().collect()),
            events,
        }
    }

    /// Add a member, broadcasting an event if it was not already present.
    pub fn add(&self, node: NodeId) -> bool {
        let added = self
            .members
            .write()
            .expect("membership set poisoned")
            .insert(node);
        if added {
            info!(%node, "member joined");
            let _ = self.events.send(MembershipEvent::Added(node));
        }
        added
    }

    /// Remove a member, broadcasting an event if it was present.
    pub fn remove(&self, node: NodeId) -> bool {
        let removed = self
            .members
            .write()
            .expect("membership set poisoned")
            .remove(&node);
        if removed {
            info!(%node, "member left");
            let _ = self.events.send(MembershipEvent::Removed(node));
        }
        removed
    }
}

impl MembershipService for StaticMembership {
    fn members(&self) -> Vec<NodeId> {
        self.members
            .read()
            .expect("membership set poisoned")
            .iter()
            .copied()
            .collect()
    }

    fn contains(&self, node: NodeId) -> bool {
        self.members
            .read()
            .expect("membership set poisoned")
            .contains(&node)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
