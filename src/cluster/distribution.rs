//! Partition placement state and the rebalance algorithm.
//!
//! A [`DistributionSnapshot`] records, for one node, which partitions it
//! serves authoritatively. A [`DistributionMap`] collects the snapshots of
//! every reachable node for one rehash invocation, and `rebalance` turns
//! that working set into a [`RebalancePlan`]: the minimal set of per-node
//! placement changes that restores the replication target and global
//! balance. The map is built fresh for each rehash and discarded after use.
//!
//! # Candidate selection tie-break
//!
//! Promotion picks the node with the lowest total server count, demotion the
//! node with the highest. When several nodes share the same total, the one
//! with the lowest node id wins. This is deliberate: candidate selection must
//! be deterministic so that every node computing a plan from the same inputs
//! produces the same plan.
//!
//! # Wire encoding
//!
//! Snapshots cross the messaging channel during rehash using an explicit
//! versioned encoding:
//!
//! ```text
//! [version: u8][node_id: u64 BE][partition_count: u32 BE][role bits, LSB-first per byte]
//! ```

use std::cmp::Reverse;
use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{SNAPSHOT_CODEC_VERSION, SNAPSHOT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::types::{NodeId, PartitionIndex};

/// One node's per-partition server/client role vector.
///
/// Created at node startup from the node's actual roles, exchanged during
/// rehash, and mutated only while the rebalance routine runs. Snapshots are
/// superseded, never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSnapshot {
    node_id: NodeId,
    roles: Vec<bool>,
    server_count: usize,
}

impl DistributionSnapshot {
    /// Create a snapshot with every partition in the client role.
    pub fn new(node_id: NodeId, distributed_size: usize) -> Self {
        Self {
            node_id,
            roles: vec![false; distributed_size],
            server_count: 0,
        }
    }

    /// Create a snapshot from an explicit role vector.
    pub fn from_roles(node_id: NodeId, roles: Vec<bool>) -> Self {
        let server_count = roles.iter().filter(|&&s| s).count();
        Self {
            node_id,
            roles,
            server_count,
        }
    }

    /// The owning node's identifier.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of partitions covered by this snapshot.
    #[inline]
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// True if the snapshot covers no partitions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Total number of partitions this node serves.
    #[inline]
    pub fn server_count(&self) -> usize {
        self.server_count
    }

    /// True if this node serves the given partition.
    #[inline]
    pub fn is_server(&self, partition: PartitionIndex) -> bool {
        self.roles[partition]
    }

    /// Set the role for one partition, keeping the derived count in sync.
    pub fn set_server(&mut self, partition: PartitionIndex, server: bool) {
        if self.roles[partition] != server {
            self.roles[partition] = server;
            if server {
                self.server_count += 1;
            } else {
                self.server_count -= 1;
            }
        }
    }

    /// Iterate over the partitions this node serves.
    pub fn server_partitions(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        self.roles
            .iter()
            .enumerate()
            .filter_map(|(p, &s)| s.then_some(p))
    }

    /// Borrow the raw role vector.
    pub fn roles(&self) -> &[bool] {
        &self.roles
    }

    /// Encode to the versioned wire format.
    pub fn encode(&self) -> Bytes {
        let bit_bytes = self.roles.len().div_ceil(8);
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + bit_bytes);
        buf.put_u8(SNAPSHOT_CODEC_VERSION);
        buf.put_u64(self.node_id.value());
        buf.put_u32(self.roles.len() as u32);
        let mut acc = 0u8;
        for (i, &server) in self.roles.iter().enumerate() {
            if server {
                acc |= 1 << (i % 8);
            }
            if i % 8 == 7 {
                buf.put_u8(acc);
                acc = 0;
            }
        }
        if self.roles.len() % 8 != 0 {
            buf.put_u8(acc);
        }
        buf.freeze()
    }

    /// Decode from the versioned wire format.
    ///
    /// Corrupt payloads are reported as [`Error::Send`]: a malformed snapshot
    /// is a transport-level delivery failure from the receiver's perspective.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SNAPSHOT_HEADER_SIZE {
            return Err(Error::Send(format!(
                "snapshot payload truncated: {} bytes",
                buf.len()
            )));
        }
        let version = buf.get_u8();
        if version != SNAPSHOT_CODEC_VERSION {
            return Err(Error::Send(format!(
                "unknown snapshot codec version {version}"
            )));
        }
        let node_id = NodeId::new(buf.get_u64());
        let count = buf.get_u32() as usize;
        let bit_bytes = count.div_ceil(8);
        if buf.len() < bit_bytes {
            return Err(Error::Send(format!(
                "snapshot role vector truncated: need {bit_bytes} bytes, got {}",
                buf.len()
            )));
        }
        let mut roles = Vec::with_capacity(count);
        for i in 0..count {
            let byte = buf[i / 8];
            roles.push(byte & (1 << (i % 8)) != 0);
        }
        Ok(Self::from_roles(node_id, roles))
    }
}

/// The rebalance working set: one snapshot per reachable node, plus running
/// per-partition server totals.
///
/// Built fresh for each rehash invocation and discarded after use.
#[derive(Debug)]
pub struct DistributionMap {
    distributed_size: usize,
    snapshots: BTreeMap<NodeId, DistributionSnapshot>,
    partition_servers: Vec<usize>,
}

impl DistributionMap {
    /// Create an empty map for the given partition count.
    pub fn new(distributed_size: usize) -> Self {
        Self {
            distributed_size,
            snapshots: BTreeMap::new(),
            partition_servers: vec![0; distributed_size],
        }
    }

    /// Insert (or supersede) a node's snapshot.
    pub fn insert(&mut self, snapshot: DistributionSnapshot) -> Result<()> {
        if snapshot.len() != self.distributed_size {
            return Err(Error::Config(format!(
                "snapshot for {} covers {} partitions, map expects {}",
                snapshot.node_id(),
                snapshot.len(),
                self.distributed_size
            )));
        }
        if let Some(old) = self.snapshots.remove(&snapshot.node_id()) {
            for p in old.server_partitions() {
                self.partition_servers[p] -= 1;
            }
        }
        for p in snapshot.server_partitions() {
            self.partition_servers[p] += 1;
        }
        self.snapshots.insert(snapshot.node_id(), snapshot);
        Ok(())
    }

    /// Number of nodes represented.
    pub fn node_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Current number of server holders for a partition.
    pub fn server_count(&self, partition: PartitionIndex) -> usize {
        self.partition_servers[partition]
    }

    /// Borrow a node's snapshot.
    pub fn snapshot(&self, node: NodeId) -> Option<&DistributionSnapshot> {
        self.snapshots.get(&node)
    }

    /// Compute the placement changes needed to restore the replication
    /// target and global balance.
    ///
    /// The map itself is left untouched; the returned plan carries the full
    /// final snapshot of every node whose role vector would change.
    pub fn rebalance(&self, replication_size: usize) -> RebalancePlan {
        let mut working = self.snapshots.clone();
        let original: BTreeMap<NodeId, Vec<bool>> = self
            .snapshots
            .iter()
            .map(|(id, s)| (*id, s.roles().to_vec()))
            .collect();

        let node_count = working.len();
        if node_count == 1 {
            // A lone node skips the fill/drain and balancing passes: it simply
            // serves every partition.
            let snap = working.values_mut().next().expect("one snapshot");
            for p in 0..self.distributed_size {
                snap.set_server(p, true);
            }
        } else if node_count > 1 {
            self.fill_and_drain(&mut working, replication_size);
            self.balance_totals(&mut working, replication_size);
        }

        let mut plan = RebalancePlan::default();
        for (id, snap) in &working {
            let before = &original[id];
            let gained = (0..self.distributed_size).any(|p| snap.is_server(p) && !before[p]);
            let lost = (0..self.distributed_size).any(|p| !snap.is_server(p) && before[p]);
            if gained {
                plan.increase.insert(*id, snap.clone());
            }
            if lost {
                plan.decrease.insert(*id, snap.clone());
            }
        }
        plan
    }

    /// Step 1: per-partition fill/drain toward the replication target.
    fn fill_and_drain(
        &self,
        working: &mut BTreeMap<NodeId, DistributionSnapshot>,
        replication_size: usize,
    ) {
        for p in 0..self.distributed_size {
            loop {
                let servers = working.values().filter(|s| s.is_server(p)).count();
                if servers < replication_size {
                    // Promote the least-loaded node not yet serving p. If the
                    // target is unreachable (replication exceeds node count),
                    // stop once every node serves p.
                    let candidate = working
                        .values()
                        .filter(|s| !s.is_server(p))
                        .min_by_key(|s| (s.server_count(), s.node_id()))
                        .map(|s| s.node_id());
                    match candidate {
                        Some(id) => working
                            .get_mut(&id)
                            .expect("candidate exists")
                            .set_server(p, true),
                        None => break,
                    }
                } else if servers > replication_size {
                    // Demote the most-loaded holder of p.
                    let candidate = working
                        .values()
                        .filter(|s| s.is_server(p))
                        .max_by_key(|s| (s.server_count(), Reverse(s.node_id())))
                        .map(|s| s.node_id());
                    match candidate {
                        Some(id) => working
                            .get_mut(&id)
                            .expect("candidate exists")
                            .set_server(p, false),
                        None => break,
                    }
                } else {
                    break;
                }
            }
        }
    }

    /// Step 2: move partitions from the most- to the least-loaded node until
    /// total server counts differ by at most the threshold.
    fn balance_totals(
        &self,
        working: &mut BTreeMap<NodeId, DistributionSnapshot>,
        replication_size: usize,
    ) {
        let node_count = working.len();
        let diff_threshold = if replication_size >= node_count { 0 } else { 1 };

        loop {
            let max = working
                .values()
                .max_by_key(|s| (s.server_count(), Reverse(s.node_id())))
                .map(|s| s.node_id())
                .expect("non-empty working set");
            let min = working
                .values()
                .min_by_key(|s| (s.server_count(), s.node_id()))
                .map(|s| s.node_id())
                .expect("non-empty working set");
            if max == min {
                break;
            }

            let spread =
                working[&max].server_count() as i64 - working[&min].server_count() as i64;
            if spread <= diff_threshold {
                break;
            }

            // A partition the loaded node serves and the idle node does not.
            // If none exists the role vectors are permutation-equivalent and
            // no move can help, so stop rather than loop forever.
            let movable = (0..self.distributed_size)
                .find(|&p| working[&max].is_server(p) && !working[&min].is_server(p));
            match movable {
                Some(p) => {
                    working.get_mut(&max).expect("max exists").set_server(p, false);
                    working.get_mut(&min).expect("min exists").set_server(p, true);
                }
                None => break,
            }
        }
    }
}

/// The output of one rebalance run: per-node placement changes.
///
/// Nodes needing no change are absent from both maps. A node that gained one
/// partition and lost another appears in both, each entry carrying its full
/// final snapshot. Applying a remote entry is a pure, idempotent overwrite
/// of that node's role vector.
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    /// Nodes that gained at least one partition, keyed by node id.
    pub increase: BTreeMap<NodeId, DistributionSnapshot>,
    /// Nodes that lost at least one partition, keyed by node id.
    pub decrease: BTreeMap<NodeId, DistributionSnapshot>,
}

impl RebalancePlan {
    /// True if no node's placement changes.
    pub fn is_empty(&self) -> bool {
        self.increase.is_empty() && self.decrease.is_empty()
    }

    /// The final snapshot for a node, if the plan touches it at all.
    ///
    /// When a node appears in both maps the snapshots are identical, so
    /// either entry serves.
    pub fn entry_for(&self, node: NodeId) -> Option<&DistributionSnapshot> {
        self.increase.get(&node).or_else(|| self.decrease.get(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(snapshots: Vec<DistributionSnapshot>) -> DistributionMap {
        let size = snapshots[0].len();
        let mut map = DistributionMap::new(size);
        for s in snapshots {
            map.insert(s).unwrap();
        }
        map
    }

    fn apply(map: &DistributionMap, plan: &RebalancePlan, size: usize) -> Vec<DistributionSnapshot> {
        // Final cluster state: plan entry where present, original otherwise.
        let mut out = Vec::new();
        for (id, snap) in &map.snapshots {
            let final_snap = plan.entry_for(*id).cloned().unwrap_or_else(|| snap.clone());
            assert_eq!(final_snap.len(), size);
            out.push(final_snap);
        }
        out
    }

    #[test]
    fn test_snapshot_codec_round_trip() {
        let snap = DistributionSnapshot::from_roles(
            NodeId::new(7),
            vec![true, false, true, true, false, false, false, true, true],
        );
        let decoded = DistributionSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.server_count(), 5);
    }

    #[test]
    fn test_snapshot_decode_rejects_bad_version() {
        let mut encoded = DistributionSnapshot::new(NodeId::new(1), 4).encode().to_vec();
        encoded[0] = 9;
        let err = DistributionSnapshot::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_snapshot_decode_rejects_truncation() {
        let encoded = DistributionSnapshot::new(NodeId::new(1), 64).encode();
        assert!(DistributionSnapshot::decode(&encoded[..5]).is_err());
        assert!(DistributionSnapshot::decode(&encoded[..SNAPSHOT_HEADER_SIZE + 1]).is_err());
    }

    #[test]
    fn test_single_node_serves_everything() {
        // Scenario A: 1 node, 4 partitions, replication 2.
        let map = map_of(vec![DistributionSnapshot::new(NodeId::new(1), 4)]);
        let plan = map.rebalance(2);
        let entry = plan.increase.get(&NodeId::new(1)).expect("gained partitions");
        assert_eq!(entry.server_count(), 4);
        assert!(plan.decrease.is_empty());
    }

    #[test]
    fn test_four_nodes_replication_two() {
        // Scenario B: 4 nodes, 4 partitions, replication 2.
        let map = map_of((1..=4).map(|i| DistributionSnapshot::new(NodeId::new(i), 4)).collect());
        let plan = map.rebalance(2);
        let finals = apply(&map, &plan, 4);

        for p in 0..4 {
            let holders = finals.iter().filter(|s| s.is_server(p)).count();
            assert_eq!(holders, 2, "partition {p} should have 2 servers");
        }
        for s in &finals {
            assert_eq!(s.server_count(), 2, "{} should serve 2 partitions", s.node_id());
        }
    }

    #[test]
    fn test_replication_exceeds_node_count() {
        let map = map_of((1..=3).map(|i| DistributionSnapshot::new(NodeId::new(i), 8)).collect());
        let plan = map.rebalance(5);
        let finals = apply(&map, &plan, 8);
        for s in &finals {
            assert_eq!(s.server_count(), 8, "every node serves every partition");
        }
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let map = map_of((1..=4).map(|i| DistributionSnapshot::new(NodeId::new(i), 16)).collect());
        let plan = map.rebalance(2);
        assert!(!plan.is_empty());

        let mut converged = DistributionMap::new(16);
        for snap in apply(&map, &plan, 16) {
            converged.insert(snap).unwrap();
        }
        let second = converged.rebalance(2);
        assert!(second.is_empty(), "second rebalance must be a no-op");
    }

    #[test]
    fn test_node_join_takes_over_partitions() {
        // Scenario C: converge 4 nodes, then a fifth joins.
        let map = map_of((1..=4).map(|i| DistributionSnapshot::new(NodeId::new(i), 8)).collect());
        let plan = map.rebalance(2);

        let mut converged = DistributionMap::new(8);
        for snap in apply(&map, &plan, 8) {
            converged.insert(snap).unwrap();
        }
        converged
            .insert(DistributionSnapshot::new(NodeId::new(5), 8))
            .unwrap();

        let join_plan = converged.rebalance(2);
        assert!(!join_plan.is_empty());
        let newcomer = join_plan
            .increase
            .get(&NodeId::new(5))
            .expect("new node gains partitions");
        assert!(newcomer.server_count() > 0);
        assert!(!join_plan.decrease.is_empty(), "existing nodes shed load");

        let finals = apply(&converged, &join_plan, 8);
        let counts: Vec<usize> = finals.iter().map(|s| s.server_count()).collect();
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1, "balance restored: {counts:?}");
        for p in 0..8 {
            assert_eq!(finals.iter().filter(|s| s.is_server(p)).count(), 2);
        }
    }

    #[test]
    fn test_node_in_both_increase_and_decrease_is_consistent() {
        // Node 1 over-serves partition 0 space while node 2 over-serves
        // nothing; after draining and filling, a node can gain one partition
        // and lose another.
        let map = map_of(vec![
            DistributionSnapshot::from_roles(NodeId::new(1), vec![true, true, true, false]),
            DistributionSnapshot::from_roles(NodeId::new(2), vec![false, false, false, false]),
        ]);
        let plan = map.rebalance(1);
        for (id, inc) in &plan.increase {
            if let Some(dec) = plan.decrease.get(id) {
                assert_eq!(inc, dec, "both entries carry the same final snapshot");
            }
        }
        let finals = apply(&map, &plan, 4);
        for p in 0..4 {
            assert_eq!(finals.iter().filter(|s| s.is_server(p)).count(), 1);
        }
    }

    #[test]
    fn test_drain_removes_excess_holders() {
        let map = map_of(vec![
            DistributionSnapshot::from_roles(NodeId::new(1), vec![true, true]),
            DistributionSnapshot::from_roles(NodeId::new(2), vec![true, true]),
            DistributionSnapshot::from_roles(NodeId::new(3), vec![true, true]),
        ]);
        let plan = map.rebalance(1);
        let finals = apply(&map, &plan, 2);
        for p in 0..2 {
            assert_eq!(finals.iter().filter(|s| s.is_server(p)).count(), 1);
        }
        let counts: Vec<usize> = finals.iter().map(|s| s.server_count()).collect();
        let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
        assert!(spread <= 1);
    }

    #[test]
    fn test_map_insert_supersedes() {
        let mut map = DistributionMap::new(4);
        map.insert(DistributionSnapshot::from_roles(
            NodeId::new(1),
            vec![true, true, false, false],
        ))
        .unwrap();
        assert_eq!(map.server_count(0), 1);

        map.insert(DistributionSnapshot::from_roles(
            NodeId::new(1),
            vec![false, true, true, false],
        ))
        .unwrap();
        assert_eq!(map.node_count(), 1);
        assert_eq!(map.server_count(0), 0);
        assert_eq!(map.server_count(2), 1);
    }

    #[test]
    fn test_map_insert_rejects_wrong_length() {
        let mut map = DistributionMap::new(4);
        let err = map
            .insert(DistributionSnapshot::new(NodeId::new(1), 8))
            .unwrap_err();
        assert!(err.to_string().contains("partitions"));
    }

    #[test]
    fn test_convergence_property_sweep() {
        // Convergence: for assorted cluster sizes and replication targets,
        // every partition ends with min(replication, nodes) holders and the
        // per-node spread respects the threshold.
        for &nodes in &[1usize, 2, 3, 5, 8] {
            for &replication in &[1usize, 2, 3, 6] {
                for &size in &[4usize, 7, 16] {
                    let map = map_of(
                        (1..=nodes as u64)
                            .map(|i| DistributionSnapshot::new(NodeId::new(i), size))
                            .collect(),
                    );
                    let plan = map.rebalance(replication);
                    let finals = apply(&map, &plan, size);

                    let want = replication.min(nodes);
                    for p in 0..size {
                        assert_eq!(
                            finals.iter().filter(|s| s.is_server(p)).count(),
                            want,
                            "nodes={nodes} repl={replication} size={size} p={p}"
                        );
                    }
                    let counts: Vec<usize> = finals.iter().map(|s| s.server_count()).collect();
                    let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
                    if replication >= nodes {
                        assert_eq!(spread, 0, "nodes={nodes} repl={replication}: {counts:?}");
                    } else {
                        assert!(spread <= 1, "nodes={nodes} repl={replication}: {counts:?}");
                    }
                }
            }
        }
    }
}
