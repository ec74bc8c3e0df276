//! Multi-key distributed lock coordination.
//!
//! `lock_many` is all-or-nothing: keys are grouped by partition and each
//! group is dispatched as one lock request through the fan-out executor. Any
//! failure — a transport error, a timeout, or a not-acquired outcome under
//! `if_acquirable` — triggers a compensating unlock of **every key in the
//! original set** before the failure propagates. The rollback covers keys
//! whose acquisition outcome is unknown (in-flight when a sibling failed);
//! unlocking a key that was never locked is a harmless no-op at the replica.
//!
//! `unlock_many` is the opposite pattern: best-effort. Per-partition failures
//! do not abort the sweep; the keys that could not be released are
//! accumulated and returned to the caller.
//!
//! `lock_all` / `unlock_all` are the coarse-grained analog: they sweep every
//! key currently present in every partition, with the wait budget capped by
//! the whole-store ceiling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cluster::fanout::{boxed, All, FanOutExecutor, FanOutFuture, Union};
use crate::cluster::replica::PartitionReplica;
use crate::cluster::router::PartitionRouter;
use crate::error::Result;
use crate::types::{NodeId, PartitionIndex};

/// Coordinates multi-key lock acquisition and release across partitions.
pub struct LockCoordinator {
    router: Arc<dyn PartitionRouter>,
    replicas: Vec<Arc<dyn PartitionReplica>>,
    executor: Arc<FanOutExecutor>,
    forced_whole_lock_timeout: Duration,
}

impl LockCoordinator {
    pub fn new(
        router: Arc<dyn PartitionRouter>,
        replicas: Vec<Arc<dyn PartitionReplica>>,
        executor: Arc<FanOutExecutor>,
        forced_whole_lock_timeout: Duration,
    ) -> Self {
        Self {
            router,
            replicas,
            executor,
            forced_whole_lock_timeout,
        }
    }

    fn group_by_partition(&self, keys: &[Bytes]) -> BTreeMap<PartitionIndex, Vec<Bytes>> {
        let mut groups: BTreeMap<PartitionIndex, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            let partition = self.router.select_partition(key, self.replicas.len());
            groups.entry(partition).or_default().push(key.clone());
        }
        groups
    }

    /// Acquire locks on all `keys` for `owner`, or none of them.
    ///
    /// Returns `Ok(false)` when `if_acquirable` is set and some key was
    /// contended. On any failure every key in the original set is unlocked
    /// before the outcome propagates.
    pub async fn lock_many(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        if_acquirable: bool,
        if_exist: bool,
        timeout: Duration,
    ) -> Result<bool> {
        if keys.is_empty() {
            return Ok(true);
        }
        let groups = self.group_by_partition(keys);
        debug!(
            key_count = keys.len(),
            partition_count = groups.len(),
            %owner,
            "acquiring multi-key locks"
        );

        let tasks: Vec<FanOutFuture<bool>> = groups
            .into_iter()
            .map(|(partition, group)| {
                let replica = Arc::clone(&self.replicas[partition]);
                boxed(async move {
                    replica
                        .lock(&group, owner, if_acquirable, if_exist, timeout)
                        .await
                })
            })
            .collect();

        match self.executor.execute(tasks, timeout, All::new()).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.rollback(keys, owner).await;
                Ok(false)
            }
            Err(err) => {
                self.rollback(keys, owner).await;
                Err(err)
            }
        }
    }

    /// Release locks on `keys` for `owner`, best-effort.
    ///
    /// Returns the keys that were not released. With `force` set, ownership
    /// is ignored and the returned set only contains keys whose partition
    /// sweep failed outright.
    pub async fn unlock_many(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        force: bool,
        timeout: Duration,
    ) -> Result<Vec<Bytes>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let groups = self.group_by_partition(keys);

        let tasks: Vec<FanOutFuture<Vec<Bytes>>> = groups
            .into_iter()
            .map(|(partition, group)| {
                let replica = Arc::clone(&self.replicas[partition]);
                boxed(async move {
                    match replica.unlock(&group, owner, force, timeout).await {
                        Ok(not_released) => Ok(not_released),
                        Err(err) => {
                            // Best-effort: the whole group counts as
                            // unreleased, the sweep continues.
                            warn!(partition, %err, "partition unlock failed");
                            Ok(group)
                        }
                    }
                })
            })
            .collect();

        self.executor.execute(tasks, timeout, Union::new()).await
    }

    /// Lock every key currently present in every partition.
    ///
    /// The wait budget is capped by the whole-store ceiling. Keys written
    /// after the sweep started are not covered.
    pub async fn lock_all(&self, owner: NodeId, timeout: Duration) -> Result<bool> {
        let budget = if timeout.is_zero() {
            self.forced_whole_lock_timeout
        } else {
            timeout.min(self.forced_whole_lock_timeout)
        };

        let tasks: Vec<FanOutFuture<bool>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move {
                    let keys = replica.keys().await?;
                    replica.lock(&keys, owner, false, true, budget).await
                })
            })
            .collect();

        match self.executor.execute(tasks, budget, All::new()).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(err) = self.unlock_all(owner, budget).await {
                    warn!(%err, "whole-store lock rollback failed");
                }
                Ok(false)
            }
            Err(err) => {
                if let Err(rollback_err) = self.unlock_all(owner, budget).await {
                    warn!(%rollback_err, "whole-store lock rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Release every lock held by `owner` across all partitions.
    pub async fn unlock_all(&self, owner: NodeId, timeout: Duration) -> Result<Vec<Bytes>> {
        let tasks: Vec<FanOutFuture<Vec<Bytes>>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move {
                    let keys = replica.keys().await?;
                    match replica.unlock(&keys, owner, false, timeout).await {
                        Ok(not_released) => Ok(not_released),
                        Err(err) => {
                            warn!(%err, "partition unlock sweep failed");
                            Ok(keys)
                        }
                    }
                })
            })
            .collect();

        self.executor.execute(tasks, timeout, Union::new()).await
    }

    /// Compensating unlock after a failed acquisition. Unconditional: every
    /// key in the original set is swept regardless of which groups
    /// succeeded.
    async fn rollback(&self, keys: &[Bytes], owner: NodeId) {
        match self.unlock_many(keys, owner, false, Duration::ZERO).await {
            Ok(not_released) if not_released.is_empty() => {}
            Ok(not_released) => {
                // Keys held by another owner were never ours to release.
                debug!(
                    count = not_released.len(),
                    "rollback left keys held by other owners"
                );
            }
            Err(err) => warn!(%err, "lock rollback sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::replica::MemoryReplica;
    use crate::cluster::router::StableHashRouter;

    const PARTITIONS: usize = 4;

    fn coordinator() -> LockCoordinator {
        let replicas: Vec<Arc<dyn PartitionReplica>> = (0..PARTITIONS)
            .map(|p| {
                Arc::new(MemoryReplica::new(p, Duration::from_secs(60)))
                    as Arc<dyn PartitionReplica>
            })
            .collect();
        LockCoordinator::new(
            Arc::new(StableHashRouter),
            replicas,
            Arc::new(FanOutExecutor::new(0)),
            Duration::from_secs(30),
        )
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_lock_then_unlock_many() {
        let locks = coordinator();
        let owner = NodeId::new(1);
        let keys = vec![key("alpha"), key("beta"), key("gamma")];

        assert!(
            locks
                .lock_many(&keys, owner, false, false, Duration::from_millis(200))
                .await
                .unwrap()
        );
        let not_released = locks
            .unlock_many(&keys, owner, false, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(not_released.is_empty());
    }

    #[tokio::test]
    async fn test_contended_key_rolls_back_whole_set() {
        let locks = coordinator();
        let holder = NodeId::new(9);
        let requester = NodeId::new(1);

        // Another owner holds "beta"; the three-key acquisition must fail
        // and leave "alpha" and "gamma" unlocked.
        locks
            .lock_many(&[key("beta")], holder, false, false, Duration::from_millis(100))
            .await
            .unwrap();

        let err = locks
            .lock_many(
                &[key("alpha"), key("beta"), key("gamma")],
                requester,
                false,
                false,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // A third owner can immediately take alpha and gamma: the rollback
        // released them.
        let third = NodeId::new(5);
        assert!(
            locks
                .lock_many(
                    &[key("alpha"), key("gamma")],
                    third,
                    true,
                    false,
                    Duration::from_millis(100),
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_if_acquirable_returns_false_and_rolls_back() {
        let locks = coordinator();
        locks
            .lock_many(&[key("beta")], NodeId::new(9), false, false, Duration::from_millis(100))
            .await
            .unwrap();

        let acquired = locks
            .lock_many(
                &[key("alpha"), key("beta")],
                NodeId::new(1),
                true,
                false,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(!acquired);

        assert!(
            locks
                .lock_many(&[key("alpha")], NodeId::new(5), true, false, Duration::from_millis(100))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_unlock_many_reports_foreign_keys() {
        let locks = coordinator();
        locks
            .lock_many(&[key("mine")], NodeId::new(1), false, false, Duration::from_millis(100))
            .await
            .unwrap();
        locks
            .lock_many(&[key("theirs")], NodeId::new(2), false, false, Duration::from_millis(100))
            .await
            .unwrap();

        let not_released = locks
            .unlock_many(
                &[key("mine"), key("theirs")],
                NodeId::new(1),
                false,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(not_released, vec![key("theirs")]);

        // Force releases regardless of owner.
        let not_released = locks
            .unlock_many(&[key("theirs")], NodeId::new(1), true, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(not_released.is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_set_is_trivially_locked() {
        let locks = coordinator();
        assert!(
            locks
                .lock_many(&[], NodeId::new(1), false, false, Duration::from_millis(100))
                .await
                .unwrap()
        );
        assert!(
            locks
                .unlock_many(&[], NodeId::new(1), false, Duration::from_millis(100))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_lock_all_covers_existing_keys() {
        let locks = coordinator();
        for k in ["a", "b", "c", "d", "e"] {
            let partition = StableHashRouter.select_partition(k.as_bytes(), PARTITIONS);
            locks.replicas[partition]
                .put(key(k), key("v"))
                .await
                .unwrap();
        }

        let owner = NodeId::new(1);
        assert!(locks.lock_all(owner, Duration::from_millis(500)).await.unwrap());

        // All existing keys are now contended for another owner.
        let acquired = locks
            .lock_many(&[key("a")], NodeId::new(2), true, false, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!acquired);

        let not_released = locks.unlock_all(owner, Duration::from_millis(500)).await.unwrap();
        assert!(not_released.is_empty());
        assert!(
            locks
                .lock_many(&[key("a")], NodeId::new(2), true, false, Duration::from_millis(100))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_budget_cancelled_wait_leaves_no_tickets() {
        // A holder owns keys in two partitions and frees the first one
        // mid-acquisition. The requester takes the first group, then the
        // shrinking budget drops its wait on the second group before the
        // per-key deadline fires. After the rollback and the holder's own
        // release, no tickets may remain anywhere.
        let memory: Vec<Arc<MemoryReplica>> = (0..PARTITIONS)
            .map(|p| Arc::new(MemoryReplica::new(p, Duration::from_secs(60))))
            .collect();
        let replicas: Vec<Arc<dyn PartitionReplica>> = memory
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn PartitionReplica>)
            .collect();
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(StableHashRouter),
            replicas,
            Arc::new(FanOutExecutor::new(0)),
            Duration::from_secs(30),
        ));

        // Two keys routed to distinct partitions, ordered so the contended
        // wait happens in the later group.
        let mut first = key("k-0");
        let mut second = key("k-0");
        let mut lo = StableHashRouter.select_partition(&first, PARTITIONS);
        let mut hi = lo;
        for i in 1..32 {
            let k = key(&format!("k-{i}"));
            let p = StableHashRouter.select_partition(&k, PARTITIONS);
            if p < lo {
                lo = p;
                first = k.clone();
            }
            if p > hi {
                hi = p;
                second = k;
            }
        }
        assert!(lo < hi, "need keys in two distinct partitions");

        let holder = NodeId::new(9);
        locks
            .lock_many(
                &[first.clone(), second.clone()],
                holder,
                false,
                false,
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        let release_first = {
            let locks = Arc::clone(&locks);
            let first = first.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                locks
                    .unlock_many(&[first], holder, false, Duration::ZERO)
                    .await
                    .unwrap();
            })
        };

        let err = locks
            .lock_many(
                &[first.clone(), second.clone()],
                NodeId::new(1),
                false,
                false,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        release_first.await.unwrap();

        locks
            .unlock_many(&[second], holder, false, Duration::ZERO)
            .await
            .unwrap();
        let leaked: usize = memory.iter().map(|r| r.lock_ticket_count()).sum();
        assert_eq!(leaked, 0, "leaked lock tickets");
    }
}
