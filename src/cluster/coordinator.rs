//! Per-node orchestration: placement, rehash, and the key/value surface.
//!
//! A [`NodeCoordinator`] owns one node's partition arena (one
//! [`PartitionReplica`] per partition index), the per-partition role flags,
//! and the coordination protocol. Role reads are lock-free atomic loads;
//! role writes happen only while holding the apply mutex, driven by a
//! rebalance plan entry.
//!
//! ## Main role
//!
//! The main node runs rebalancing for the whole cluster. It is determined by
//! walking the membership list in ascending node-id order: the first member
//! that is either this node or a registered receiver decides the outcome. A
//! lone member is always main. Every node resolves the same main without any
//! election traffic.
//!
//! ## Rehash protocol
//!
//! On the main node, `rehash` gathers GET_DIST_INFO snapshots from reachable
//! peers, builds a [`DistributionMap`] including its own snapshot, runs the
//! rebalance, then pushes `increase` plan entries and — only after every
//! gaining node acknowledged — `decrease` entries, so no partition is ever
//! left without a server holder. A non-main node forwards a REHASH_REQUEST
//! to the main and waits for its acknowledgement.
//!
//! Request handling never blocks on long operations: rehash, save, and load
//! run on spawned tasks, and the handler answers immediately.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::collector::ResponseCollector;
use crate::cluster::config::ClusterConfig;
use crate::cluster::distribution::{DistributionMap, DistributionSnapshot};
use crate::cluster::fanout::{boxed, Any, Discard, FanOutExecutor, FanOutFuture, Sum, Union};
use crate::cluster::lock::LockCoordinator;
use crate::cluster::membership::MembershipService;
use crate::cluster::messaging::{
    CoordRequest, CoordResponse, MessagingChannel, RequestHandler,
};
use crate::cluster::replica::{MemoryReplica, PartitionReplica};
use crate::cluster::router::{PartitionRouter, StableHashRouter};
use crate::error::{Error, Result};
use crate::runtime::RuntimeHandles;
use crate::types::{NodeId, PartitionIndex, PartitionRole};

/// Abortable handles for the coordinator's background tasks.
#[derive(Debug)]
pub struct BackgroundTaskHandles {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTaskHandles {
    /// Abort all background tasks.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

enum PersistenceOp {
    Save,
    Load,
    LoadKey(Bytes),
}

/// One node's coordinator: partition arena, placement roles, and protocol.
pub struct NodeCoordinator {
    self_ref: Weak<NodeCoordinator>,
    node_id: NodeId,
    config: ClusterConfig,
    channel: Arc<dyn MessagingChannel>,
    membership: Arc<dyn MembershipService>,
    router: Arc<dyn PartitionRouter>,
    replicas: Vec<Arc<dyn PartitionReplica>>,
    roles: Vec<AtomicU8>,
    // Serializes plan-entry application; reads stay lock-free.
    apply_lock: tokio::sync::Mutex<()>,
    executor: Arc<FanOutExecutor>,
    locks: LockCoordinator,
    rehash_enabled: AtomicBool,
    // Coordination tasks spawn on `control`, fan-out workers on `data`.
    handles: RuntimeHandles,
}

impl NodeCoordinator {
    /// Create a coordinator backed by in-memory replicas.
    ///
    /// Must be called inside a tokio runtime: the fan-out worker pool (if
    /// configured) is spawned here.
    pub fn new(
        node_id: NodeId,
        config: ClusterConfig,
        channel: Arc<dyn MessagingChannel>,
        membership: Arc<dyn MembershipService>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let replicas: Vec<Arc<dyn PartitionReplica>> = (0..config.distributed_size)
            .map(|partition| {
                Arc::new(MemoryReplica::new(partition, config.forced_lock_timeout))
                    as Arc<dyn PartitionReplica>
            })
            .collect();
        Self::with_replicas(node_id, config, channel, membership, replicas)
    }

    /// Create a coordinator over caller-provided replicas (for example a
    /// persistence-capable store).
    ///
    /// Must be called inside a tokio runtime; both planes collapse onto it.
    /// Use [`NodeCoordinator::with_runtime_handles`] for a dedicated
    /// control/data runtime split.
    pub fn with_replicas(
        node_id: NodeId,
        config: ClusterConfig,
        channel: Arc<dyn MessagingChannel>,
        membership: Arc<dyn MembershipService>,
        replicas: Vec<Arc<dyn PartitionReplica>>,
    ) -> Result<Arc<Self>> {
        let handles = RuntimeHandles::from_current();
        Self::with_runtime_handles(node_id, config, channel, membership, replicas, handles)
    }

    /// Create a coordinator with explicit runtime handles.
    ///
    /// Coordination tasks (rehash exchanges, the membership watcher,
    /// delegated persistence) spawn on the control handle; fan-out pool
    /// workers spawn on the data handle. Unlike the other constructors this
    /// does not need an ambient runtime, so an entry point owning a
    /// [`crate::runtime::NodeRuntimes`] pair can build the coordinator
    /// before entering either runtime.
    pub fn with_runtime_handles(
        node_id: NodeId,
        config: ClusterConfig,
        channel: Arc<dyn MessagingChannel>,
        membership: Arc<dyn MembershipService>,
        replicas: Vec<Arc<dyn PartitionReplica>>,
        handles: RuntimeHandles,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if replicas.len() != config.distributed_size {
            return Err(Error::Config(format!(
                "expected {} replicas, got {}",
                config.distributed_size,
                replicas.len()
            )));
        }

        let router: Arc<dyn PartitionRouter> = Arc::new(StableHashRouter);
        let executor = Arc::new(FanOutExecutor::with_handle(
            config.parallel_request_threads,
            handles.data.clone(),
        ));
        let locks = LockCoordinator::new(
            Arc::clone(&router),
            replicas.clone(),
            Arc::clone(&executor),
            config.forced_whole_lock_timeout,
        );
        let roles = (0..config.distributed_size)
            .map(|_| AtomicU8::new(PartitionRole::Unassigned as u8))
            .collect();
        let rehash_enabled = AtomicBool::new(config.rehash_enabled);

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            node_id,
            config,
            channel,
            membership,
            router,
            replicas,
            roles,
            apply_lock: tokio::sync::Mutex::new(()),
            executor,
            locks,
            rehash_enabled,
            handles,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// This node's role for one partition. Lock-free.
    pub fn role(&self, partition: PartitionIndex) -> PartitionRole {
        PartitionRole::from_u8(self.roles[partition].load(Ordering::Acquire))
    }

    /// Partitions this node currently serves.
    pub fn server_partitions(&self) -> Vec<PartitionIndex> {
        (0..self.roles.len())
            .filter(|&p| self.role(p).is_server())
            .collect()
    }

    /// Whether this node participates in rehash.
    pub fn rehash_enabled(&self) -> bool {
        self.rehash_enabled.load(Ordering::Acquire)
    }

    /// Flip local rehash participation.
    pub fn set_rehash_enabled(&self, enabled: bool) {
        self.rehash_enabled.store(enabled, Ordering::Release);
        info!(enabled, "rehash switch changed");
    }

    /// Resolve the main node by walking the membership list in ascending
    /// order: the first member that is this node or a registered receiver.
    pub fn main_node(&self) -> Option<NodeId> {
        let members = self.membership.members();
        if members.len() == 1 {
            return members.first().copied();
        }
        members
            .into_iter()
            .find(|&member| member == self.node_id || self.channel.is_registered(member))
    }

    /// True if this node holds the main role.
    pub fn is_main(&self) -> bool {
        match self.main_node() {
            Some(main) => main == self.node_id,
            // Nothing else is visible: act as main rather than stall.
            None => true,
        }
    }

    fn current_snapshot(&self) -> DistributionSnapshot {
        let roles = (0..self.roles.len())
            .map(|p| self.role(p).is_server())
            .collect();
        DistributionSnapshot::from_roles(self.node_id, roles)
    }

    /// Overwrite this node's role vector from a plan entry.
    async fn apply_snapshot(&self, snapshot: &DistributionSnapshot) -> Result<()> {
        if snapshot.node_id() != self.node_id {
            return Err(Error::Send(format!(
                "plan entry for {} delivered to {}",
                snapshot.node_id(),
                self.node_id
            )));
        }
        if snapshot.len() != self.roles.len() {
            return Err(Error::Config(format!(
                "plan entry covers {} partitions, node has {}",
                snapshot.len(),
                self.roles.len()
            )));
        }

        let _guard = self.apply_lock.lock().await;
        let mut gained = 0usize;
        let mut dropped = 0usize;
        for partition in 0..self.roles.len() {
            let target = if snapshot.is_server(partition) {
                PartitionRole::Server
            } else {
                PartitionRole::Client
            };
            let previous =
                PartitionRole::from_u8(self.roles[partition].swap(target as u8, Ordering::AcqRel));
            match (previous.is_server(), target.is_server()) {
                (false, true) => gained += 1,
                (true, false) => dropped += 1,
                _ => {}
            }
        }
        debug!(gained, dropped, "applied placement entry");
        Ok(())
    }

    /// Send each request and collect the responses, failing fast on the
    /// first remote error.
    async fn exchange(
        &self,
        targets: Vec<(NodeId, CoordRequest)>,
        timeout: Duration,
    ) -> Result<Vec<CoordResponse>> {
        let collector = Arc::new(ResponseCollector::new(targets.len()));
        let responses = Arc::new(std::sync::Mutex::new(Vec::with_capacity(collector.expected())));

        for (to, request) in targets {
            let channel = Arc::clone(&self.channel);
            let collector = Arc::clone(&collector);
            let responses = Arc::clone(&responses);
            let from = self.node_id;
            self.handles.control.spawn(async move {
                let outcome = channel
                    .send(to, from, request)
                    .await
                    .and_then(CoordResponse::into_result);
                match outcome {
                    Ok(response) => {
                        responses
                            .lock()
                            .expect("response buffer poisoned")
                            .push(response);
                        collector.complete_one();
                    }
                    Err(err) => collector.fail(err),
                }
            });
        }

        collector.wait(timeout).await?;
        let collected = std::mem::take(
            &mut *responses.lock().expect("response buffer poisoned"),
        );
        Ok(collected)
    }

    /// Peers that are members and currently registered, excluding self.
    fn reachable_peers(&self) -> Vec<NodeId> {
        self.membership
            .members()
            .into_iter()
            .filter(|&m| m != self.node_id && self.channel.is_registered(m))
            .collect()
    }

    /// Run (or request) a placement rebalance.
    ///
    /// On the main node this executes the full protocol; elsewhere it
    /// forwards a REHASH_REQUEST to the main and waits for the ack. Fails
    /// with a configuration error if the rehash switch is off.
    pub async fn rehash(&self, timeout: Duration) -> Result<()> {
        if !self.rehash_enabled() {
            return Err(Error::Config("rehash is disabled on this node".to_string()));
        }

        let peers = self.reachable_peers();
        if peers.is_empty() {
            // Single-node cluster: serve every partition, no exchange.
            let all = DistributionSnapshot::from_roles(
                self.node_id,
                vec![true; self.config.distributed_size],
            );
            self.apply_snapshot(&all).await?;
            info!("single-node placement: serving all partitions");
            return Ok(());
        }

        if self.is_main() {
            self.rehash_as_main(peers, timeout).await
        } else {
            let main = self
                .main_node()
                .ok_or_else(|| Error::Send("no reachable main node".to_string()))?;
            debug!(%main, "forwarding rehash request to main");
            self.exchange(vec![(main, CoordRequest::RehashRequest)], timeout)
                .await?;
            Ok(())
        }
    }

    async fn rehash_as_main(&self, peers: Vec<NodeId>, timeout: Duration) -> Result<()> {
        info!(peer_count = peers.len(), "starting rehash as main");

        let targets = peers
            .iter()
            .map(|&peer| (peer, CoordRequest::GetDistInfo))
            .collect();
        let responses = self.exchange(targets, timeout).await?;

        let mut map = DistributionMap::new(self.config.distributed_size);
        map.insert(self.current_snapshot())?;
        for response in responses {
            match response {
                CoordResponse::DistInfo(snapshot) => map.insert(snapshot)?,
                other => {
                    return Err(Error::Send(format!(
                        "unexpected response to GET_DIST_INFO: {other:?}"
                    )));
                }
            }
        }

        let plan = map.rebalance(self.config.replication_size);
        if plan.is_empty() {
            debug!("placement already balanced");
            return Ok(());
        }

        // Gaining nodes first, shrinking nodes only after every gain is
        // acknowledged: a partition always keeps at least one server.
        self.push_plan_batch(&plan.increase, timeout).await?;
        self.push_plan_batch(&plan.decrease, timeout).await?;
        info!(
            increased = plan.increase.len(),
            decreased = plan.decrease.len(),
            "rehash complete"
        );
        Ok(())
    }

    async fn push_plan_batch(
        &self,
        entries: &BTreeMap<NodeId, DistributionSnapshot>,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(own) = entries.get(&self.node_id) {
            self.apply_snapshot(own).await?;
        }

        let targets: Vec<(NodeId, CoordRequest)> = entries
            .iter()
            .filter(|&(&node, _)| node != self.node_id)
            .map(|(&node, snapshot)| (node, CoordRequest::Rehash(snapshot.clone())))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        self.exchange(targets, timeout).await?;
        Ok(())
    }

    /// Flip the rehash switch locally and on every reachable peer.
    pub async fn broadcast_rehash_switch(&self, enabled: bool, timeout: Duration) -> Result<()> {
        self.set_rehash_enabled(enabled);
        let targets: Vec<(NodeId, CoordRequest)> = self
            .reachable_peers()
            .into_iter()
            .map(|peer| (peer, CoordRequest::RehashSwitch(enabled)))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        self.exchange(targets, timeout).await?;
        Ok(())
    }

    /// Block until every member has a registered receiver or the budget
    /// runs out.
    pub async fn wait_connect_all(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let peers: Vec<NodeId> = self
                .membership
                .members()
                .into_iter()
                .filter(|&m| m != self.node_id)
                .collect();
            let connected = peers
                .iter()
                .filter(|&&m| self.channel.is_registered(m))
                .count();
            if connected == peers.len() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(connected, peers.len()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Bring the node online.
    ///
    /// With `wait_connect_all_on_start` set, blocks (up to the default
    /// timeout) until every member has a registered receiver before the
    /// background tasks spawn; otherwise starts immediately.
    pub async fn start(self: &Arc<Self>) -> Result<BackgroundTaskHandles> {
        if self.config.wait_connect_all_on_start {
            self.wait_connect_all(self.config.default_timeout).await?;
        }
        Ok(self.start_background_tasks())
    }

    /// Spawn the membership watcher. Events observed while this node is
    /// main (and rehash is enabled) trigger independent rehash attempts.
    pub fn start_background_tasks(self: &Arc<Self>) -> BackgroundTaskHandles {
        let mut events = self.membership.subscribe();
        let this = Arc::clone(self);
        let watcher = self.handles.control.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership events lagged, rehashing from scratch");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !this.rehash_enabled() || !this.is_main() {
                    continue;
                }
                info!(?event, "membership changed, starting rehash");
                let control = this.handles.control.clone();
                let this = Arc::clone(&this);
                control.spawn(async move {
                    if let Err(err) = this.rehash(this.config.rehash_timeout).await {
                        warn!(%err, "membership-triggered rehash failed");
                    }
                });
            }
            debug!("membership watcher stopped");
        });
        BackgroundTaskHandles {
            handles: vec![watcher],
        }
    }

    fn partition_for(&self, key: &[u8]) -> PartitionIndex {
        self.router.select_partition(key, self.replicas.len())
    }

    // --- key/value surface ---------------------------------------------

    pub async fn get(&self, key: &Bytes) -> Result<Option<Bytes>> {
        self.replicas[self.partition_for(key)].get(key).await
    }

    pub async fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        let partition = self.partition_for(&key);
        self.replicas[partition].put(key, value).await
    }

    pub async fn remove(&self, key: &Bytes) -> Result<Option<Bytes>> {
        self.replicas[self.partition_for(key)].remove(key).await
    }

    pub async fn contains_key(&self, key: &Bytes) -> Result<bool> {
        self.replicas[self.partition_for(key)].contains(key).await
    }

    /// Total entry count across all partitions.
    pub async fn len(&self) -> Result<usize> {
        let tasks: Vec<FanOutFuture<usize>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move { replica.len().await })
            })
            .collect();
        self.executor
            .execute(tasks, self.config.default_timeout, Sum::new())
            .await
    }

    /// True if no partition holds any entry. Short-circuits on the first
    /// non-empty partition.
    pub async fn is_empty(&self) -> Result<bool> {
        let tasks: Vec<FanOutFuture<bool>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move { Ok(replica.len().await? > 0) })
            })
            .collect();
        let any_occupied = self
            .executor
            .execute(tasks, self.config.default_timeout, Any::new())
            .await?;
        Ok(!any_occupied)
    }

    /// All keys across all partitions, in partition order.
    pub async fn keys(&self) -> Result<Vec<Bytes>> {
        let tasks: Vec<FanOutFuture<Vec<Bytes>>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move { replica.keys().await })
            })
            .collect();
        self.executor
            .execute(tasks, self.config.default_timeout, Union::new())
            .await
    }

    /// Remove every entry in every partition.
    pub async fn clear(&self) -> Result<()> {
        let tasks: Vec<FanOutFuture<()>> = self
            .replicas
            .iter()
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move { replica.clear().await })
            })
            .collect();
        self.executor
            .execute(tasks, self.config.default_timeout, Discard)
            .await
    }

    // --- lock surface --------------------------------------------------

    /// Acquire locks on all `keys` for this node, or none of them.
    pub async fn lock_many(
        &self,
        keys: &[Bytes],
        if_acquirable: bool,
        if_exist: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let budget = self.or_default(timeout);
        self.locks
            .lock_many(keys, self.node_id, if_acquirable, if_exist, budget)
            .await
    }

    /// Release locks on `keys`, returning those that were not released.
    pub async fn unlock_many(
        &self,
        keys: &[Bytes],
        force: bool,
        timeout: Duration,
    ) -> Result<Vec<Bytes>> {
        let budget = self.or_default(timeout);
        self.locks
            .unlock_many(keys, self.node_id, force, budget)
            .await
    }

    /// Lock every key currently present, store-wide.
    pub async fn lock_all(&self, timeout: Duration) -> Result<bool> {
        self.locks.lock_all(self.node_id, self.or_default(timeout)).await
    }

    /// Release every lock held by this node, store-wide.
    pub async fn unlock_all(&self, timeout: Duration) -> Result<Vec<Bytes>> {
        self.locks
            .unlock_all(self.node_id, self.or_default(timeout))
            .await
    }

    fn or_default(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        }
    }

    // --- persistence delegation ----------------------------------------

    fn delegate_persistence(&self, op: PersistenceOp, timeout: Duration) -> CoordResponse {
        if !self.replicas.iter().any(|r| r.supports_persistence()) {
            return CoordResponse::Error(
                "no persistent store configured on this node".to_string(),
            );
        }
        let Some(this) = self.self_ref.upgrade() else {
            return CoordResponse::Error("coordinator is shutting down".to_string());
        };

        // Long-running store traffic must not block request handling.
        self.handles.control.spawn(async move {
            let outcome = match op {
                PersistenceOp::Save => this.persist_all(true, timeout).await,
                PersistenceOp::Load => this.persist_all(false, timeout).await,
                PersistenceOp::LoadKey(key) => {
                    let partition = this.partition_for(&key);
                    this.replicas[partition].load_key(&key, timeout).await
                }
            };
            if let Err(err) = outcome {
                warn!(%err, "delegated persistence operation failed");
            }
        });
        CoordResponse::Ack
    }

    async fn persist_all(&self, save: bool, timeout: Duration) -> Result<()> {
        let tasks: Vec<FanOutFuture<()>> = self
            .replicas
            .iter()
            .filter(|replica| replica.supports_persistence())
            .map(|replica| {
                let replica = Arc::clone(replica);
                boxed(async move {
                    if save {
                        replica.save(timeout).await
                    } else {
                        replica.load(timeout).await
                    }
                })
            })
            .collect();
        self.executor.execute(tasks, timeout, Discard).await
    }
}

#[async_trait]
impl RequestHandler for NodeCoordinator {
    async fn handle_request(&self, from: NodeId, request: CoordRequest) -> CoordResponse {
        debug!(%from, kind = request.kind(), "handling coordination request");
        match request {
            CoordRequest::GetDistInfo => CoordResponse::DistInfo(self.current_snapshot()),
            CoordRequest::RehashRequest => {
                if !self.is_main() {
                    return CoordResponse::Error(format!(
                        "{} is not the main node",
                        self.node_id
                    ));
                }
                let Some(this) = self.self_ref.upgrade() else {
                    return CoordResponse::Error("coordinator is shutting down".to_string());
                };
                // Ack means accepted; the rebalance itself runs detached so
                // request handling stays responsive.
                self.handles.control.spawn(async move {
                    if let Err(err) = this.rehash(this.config.rehash_timeout).await {
                        warn!(%err, requester = %from, "requested rehash failed");
                    }
                });
                CoordResponse::Ack
            }
            CoordRequest::Rehash(snapshot) => match self.apply_snapshot(&snapshot).await {
                Ok(()) => CoordResponse::Ack,
                Err(err) => CoordResponse::Error(err.to_string()),
            },
            CoordRequest::RehashSwitch(enabled) => {
                self.set_rehash_enabled(enabled);
                CoordResponse::Ack
            }
            CoordRequest::Save { timeout } => {
                self.delegate_persistence(PersistenceOp::Save, timeout)
            }
            CoordRequest::Load { timeout } => {
                self.delegate_persistence(PersistenceOp::Load, timeout)
            }
            CoordRequest::LoadKey { key, timeout } => {
                self.delegate_persistence(PersistenceOp::LoadKey(key), timeout)
            }
        }
    }
}
