//! Per-partition replica surface and the default in-memory implementation.
//!
//! [`PartitionReplica`] is the narrow interface the cluster core consumes:
//! point reads/writes, key enumeration, and the lock primitives. Secondary
//! indexing, query evaluation, and persistence formats live behind this trait
//! and are not re-specified here. Persistence is a capability: callers check
//! [`PartitionReplica::supports_persistence`] before delegating SAVE/LOAD
//! rather than relying on a runtime failure.
//!
//! [`MemoryReplica`] is the built-in store: a concurrent hash map plus a
//! lock-ticket table. A ticket records the owning node and the number of
//! waiters; it is created on first lock and destroyed once both the hold and
//! the waiter count reach zero. A watchdog ceiling reclaims tickets whose
//! hold exceeds the configured forced-lock timeout, treating the reclaim as
//! a forced unlock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::NodeId;

/// Narrow interface to one partition's local store.
#[async_trait]
pub trait PartitionReplica: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>>;

    /// Write a value, returning the previous one if any.
    async fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>>;

    /// Remove a key, returning the previous value if any.
    async fn remove(&self, key: &Bytes) -> Result<Option<Bytes>>;

    /// True if the key is present.
    async fn contains(&self, key: &Bytes) -> Result<bool>;

    /// Enumerate all keys in this partition.
    async fn keys(&self) -> Result<Vec<Bytes>>;

    /// Number of entries in this partition.
    async fn len(&self) -> Result<usize>;

    /// Remove every entry in this partition.
    async fn clear(&self) -> Result<()>;

    /// Acquire locks on the given keys for `owner`.
    ///
    /// - `if_acquirable`: do not wait; return `Ok(false)` if any key is held
    ///   by another owner.
    /// - `if_exist`: skip keys not present in the store.
    ///
    /// Waiting is bounded by `timeout`; running out of budget is an
    /// [`Error::Timeout`]. Re-locking a key already held by `owner` succeeds.
    async fn lock(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        if_acquirable: bool,
        if_exist: bool,
        timeout: Duration,
    ) -> Result<bool>;

    /// Release locks on the given keys.
    ///
    /// Returns the keys that were *not* released (held by a different owner
    /// without `force`). Unlocking a key that is not locked is a no-op.
    async fn unlock(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        force: bool,
        timeout: Duration,
    ) -> Result<Vec<Bytes>>;

    /// True if this replica can delegate to a persistent store.
    fn supports_persistence(&self) -> bool {
        false
    }

    /// Persist this partition's contents.
    async fn save(&self, _timeout: Duration) -> Result<()> {
        Err(Error::Config(
            "no persistent store configured for this replica".to_string(),
        ))
    }

    /// Reload this partition's contents from the persistent store.
    async fn load(&self, _timeout: Duration) -> Result<()> {
        Err(Error::Config(
            "no persistent store configured for this replica".to_string(),
        ))
    }

    /// Reload a single key from the persistent store.
    async fn load_key(&self, _key: &Bytes, _timeout: Duration) -> Result<()> {
        Err(Error::Config(
            "no persistent store configured for this replica".to_string(),
        ))
    }
}

/// Lock ticket: owner, hold start, waiter count, and the wakeup handle.
#[derive(Debug)]
struct LockTicket {
    owner: Option<NodeId>,
    acquired_at: Instant,
    waiters: usize,
    notify: Arc<Notify>,
}

impl LockTicket {
    fn vacant() -> Self {
        Self {
            owner: None,
            acquired_at: Instant::now(),
            waiters: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// A registered waiter on one ticket.
///
/// The count is released on drop, which also covers a wait future dropped
/// mid-park by an outer deadline.
struct WaiterGuard<'a> {
    replica: &'a MemoryReplica,
    key: &'a Bytes,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.replica.release_waiter(self.key);
    }
}

/// In-memory partition store with advisory key locks.
#[derive(Debug)]
pub struct MemoryReplica {
    partition: usize,
    data: DashMap<Bytes, Bytes>,
    locks: DashMap<Bytes, LockTicket>,
    forced_lock_timeout: Duration,
}

impl MemoryReplica {
    /// Create an empty replica for the given partition index.
    pub fn new(partition: usize, forced_lock_timeout: Duration) -> Self {
        Self {
            partition,
            data: DashMap::new(),
            locks: DashMap::new(),
            forced_lock_timeout,
        }
    }

    /// The partition index this replica backs.
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Number of live lock tickets (diagnostics).
    pub fn lock_ticket_count(&self) -> usize {
        self.locks.len()
    }

    /// Acquire one key's lock, waiting until `deadline` if necessary.
    ///
    /// Returns `Ok(false)` only in `if_acquirable` mode.
    ///
    /// The wait future may be dropped at its await point by an outer
    /// deadline (the sequential fan-out budget does exactly that), so the
    /// waiter registration is a [`WaiterGuard`] released on drop rather
    /// than by any return path.
    async fn lock_key(
        &self,
        key: &Bytes,
        owner: NodeId,
        if_acquirable: bool,
        deadline: tokio::time::Instant,
    ) -> Result<bool> {
        let mut waiting: Option<WaiterGuard<'_>> = None;
        loop {
            // All ticket mutation happens while holding the map entry; no
            // awaits occur inside this block. The entry guard is dropped
            // before `waiting`, so the guard's own map access cannot
            // deadlock on the shard.
            let notify = {
                let mut entry = self
                    .locks
                    .entry(key.clone())
                    .or_insert_with(LockTicket::vacant);
                let ticket = entry.value_mut();
                match ticket.owner {
                    None => {
                        ticket.owner = Some(owner);
                        ticket.acquired_at = Instant::now();
                        return Ok(true);
                    }
                    Some(holder) if holder == owner => return Ok(true),
                    Some(holder) => {
                        if ticket.acquired_at.elapsed() >= self.forced_lock_timeout {
                            // Watchdog reclaim: the hold exceeded the ceiling,
                            // treat it as a forced unlock and take over.
                            warn!(
                                partition = self.partition,
                                holder = %holder,
                                new_owner = %owner,
                                held_ms = ticket.acquired_at.elapsed().as_millis() as u64,
                                "forced lock timeout exceeded, reclaiming ticket"
                            );
                            ticket.owner = Some(owner);
                            ticket.acquired_at = Instant::now();
                            return Ok(true);
                        }
                        if if_acquirable {
                            return Ok(false);
                        }
                        if waiting.is_none() {
                            ticket.waiters += 1;
                            waiting = Some(WaiterGuard { replica: self, key });
                        }
                        ticket.notify.clone()
                    }
                }
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Err(Error::timeout(0, 1));
            }
        }
    }

    /// Drop a waiter registration, destroying the ticket if nothing holds
    /// or waits on it any more.
    fn release_waiter(&self, key: &Bytes) {
        if let Some(mut ticket) = self.locks.get_mut(key) {
            ticket.waiters = ticket.waiters.saturating_sub(1);
        }
        self.locks
            .remove_if(key, |_, t| t.owner.is_none() && t.waiters == 0);
    }

    /// Release one key's lock. Returns false if held by a different owner
    /// and `force` is not set.
    fn unlock_key(&self, key: &Bytes, owner: NodeId, force: bool) -> bool {
        let released = match self.locks.get_mut(key) {
            None => return true, // never locked: harmless no-op
            Some(mut ticket) => match ticket.owner {
                None => true,
                Some(holder) if holder == owner || force => {
                    ticket.owner = None;
                    if ticket.waiters > 0 {
                        // One permit per release; the woken waiter re-checks
                        // the ticket and takes ownership.
                        ticket.notify.notify_one();
                    }
                    true
                }
                Some(_) => false,
            },
        };
        if released {
            self.locks
                .remove_if(key, |_, t| t.owner.is_none() && t.waiters == 0);
        }
        released
    }
}

#[async_trait]
impl PartitionReplica for MemoryReplica {
    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        Ok(self.data.insert(key, value))
    }

    async fn remove(&self, key: &Bytes) -> Result<Option<Bytes>> {
        Ok(self.data.remove(key).map(|(_, v)| v))
    }

    async fn contains(&self, key: &Bytes) -> Result<bool> {
        Ok(self.data.contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<Bytes>> {
        Ok(self.data.iter().map(|e| e.key().clone()).collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.data.len())
    }

    async fn clear(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    async fn lock(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        if_acquirable: bool,
        if_exist: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        for key in keys {
            if if_exist && !self.data.contains_key(key) {
                debug!(partition = self.partition, "skipping lock on absent key");
                continue;
            }
            if !self.lock_key(key, owner, if_acquirable, deadline).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn unlock(
        &self,
        keys: &[Bytes],
        owner: NodeId,
        force: bool,
        _timeout: Duration,
    ) -> Result<Vec<Bytes>> {
        let mut not_released = Vec::new();
        for key in keys {
            if !self.unlock_key(key, owner, force) {
                not_released.push(key.clone());
            }
        }
        Ok(not_released)
    }
}
