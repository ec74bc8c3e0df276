//! Clustered, partitioned, replicated key/value coordination.
//!
//! The key space is split into a fixed number of partitions
//! (`distributed_size`); every node holds an arena with one replica per
//! partition and a role flag saying whether it is an authoritative **server**
//! or a **client** for that partition. Placement is maintained by the
//! rebalance algorithm and exchanged between nodes as compact role-vector
//! snapshots.
//!
//! # Architecture
//!
//! ```text
//!          ┌───────────────────────────────────────────┐
//!          │              NodeCoordinator              │
//!          │  main-role walk · rehash protocol · KV    │
//!          └──────┬──────────────┬──────────────┬──────┘
//!                 │              │              │
//!        ┌────────▼─────┐ ┌──────▼───────┐ ┌────▼───────────┐
//!        │ Distribution │ │ FanOut       │ │ Lock           │
//!        │ Map + plan   │ │ Executor     │ │ Coordinator    │
//!        └────────┬─────┘ └──────┬───────┘ └────┬───────────┘
//!                 │              │              │
//!          ┌──────▼──────────────▼──────────────▼──────┐
//!          │     partition arena (PartitionReplica)    │
//!          └───────────────────────────────────────────┘
//!
//!          MessagingChannel ── GET_DIST_INFO / REHASH /
//!          REHASH_REQUEST / REHASH_SWITCH / SAVE / LOAD
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use shardmesh::cluster::{
//!     ClusterConfig, InProcessNetwork, NodeCoordinator, StaticMembership,
//! };
//! use shardmesh::types::NodeId;
//!
//! #[tokio::main]
//! async fn main() -> shardmesh::error::Result<()> {
//!     let network = Arc::new(InProcessNetwork::new());
//!     let membership = Arc::new(StaticMembership::new([NodeId::new(1)]));
//!     let node = NodeCoordinator::new(
//!         NodeId::new(1),
//!         ClusterConfig::default(),
//!         network.clone(),
//!         membership,
//!     )?;
//!     network.register(node.node_id(), node.clone());
//!     node.rehash(Duration::from_secs(5)).await?;
//!     node.put("answer".into(), "42".into()).await?;
//!     Ok(())
//! }
//! ```

mod collector;
mod config;
mod coordinator;
mod distribution;
mod fanout;
mod lock;
mod membership;
mod messaging;
mod replica;
mod router;

pub use collector::ResponseCollector;
pub use config::ClusterConfig;
pub use coordinator::{BackgroundTaskHandles, NodeCoordinator};
pub use distribution::{DistributionMap, DistributionSnapshot, RebalancePlan};
pub use fanout::{boxed, Aggregate, All, Any, Discard, FanOutExecutor, FanOutFuture, Sum, Union};
pub use lock::LockCoordinator;
pub use membership::{MembershipEvent, MembershipService, StaticMembership};
pub use messaging::{
    CoordRequest, CoordResponse, InProcessNetwork, MessagingChannel, RequestHandler,
};
pub use replica::{MemoryReplica, PartitionReplica};
pub use router::{PartitionRouter, StableHashRouter};
