//! # Shardmesh
//! Embeddable clustered key/value store with partitioned, replicated
//! placement.
//!
//! The key space is divided into a fixed number of partitions; each cluster
//! node serves a subset of them as an authoritative replica and proxies the
//! rest. Placement converges through a deterministic rebalance run by the
//! main node and pushed to peers as compact role-vector snapshots; no
//! external coordination service is required.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Deterministic, inspectable placement: the rebalance is a pure function
//!   of the gathered snapshots
//! - Be a building block for replicated in-process caches and stores
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! shardmesh = "0.1"
//! ```
//!
//! ### Forming an embedded cluster
//! Each node is a [`NodeCoordinator`](cluster::NodeCoordinator) wired to a
//! [`MessagingChannel`](cluster::MessagingChannel) and a
//! [`MembershipService`](cluster::MembershipService). The built-in
//! [`InProcessNetwork`](cluster::InProcessNetwork) routes coordination
//! traffic between nodes in the same process:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use shardmesh::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     use shardmesh::telemetry::{init_logging, LogFormat};
//!     init_logging(LogFormat::from_env()).expect("logging init");
//!
//!     let network = Arc::new(InProcessNetwork::new());
//!     let membership = Arc::new(StaticMembership::new([NodeId::new(1), NodeId::new(2)]));
//!     let config = ClusterConfig::from_env()?;
//!
//!     let a = NodeCoordinator::new(NodeId::new(1), config.clone(), network.clone(), membership.clone())?;
//!     let b = NodeCoordinator::new(NodeId::new(2), config, network.clone(), membership.clone())?;
//!     network.register(a.node_id(), a.clone());
//!     network.register(b.node_id(), b.clone());
//!
//!     a.rehash(Duration::from_secs(5)).await?;
//!     a.put("answer".into(), "42".into()).await?;
//!     assert_eq!(b.len().await?, 0); // each node owns its own arena
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod error;

pub mod types;

pub mod cluster;
pub mod constants;
pub mod runtime;
pub mod telemetry;

pub mod prelude {
    //! Convenience re-exports for typical usage.
    //!
    //! ```rust
    //! use shardmesh::prelude::*;
    //! ```

    pub use crate::cluster::{
        ClusterConfig, DistributionMap, DistributionSnapshot, FanOutExecutor, InProcessNetwork,
        LockCoordinator, MembershipService, MemoryReplica, MessagingChannel, NodeCoordinator,
        PartitionReplica, PartitionRouter, RebalancePlan, ResponseCollector, StableHashRouter,
        StaticMembership,
    };
    pub use crate::error::{Error, Result};
    pub use crate::types::{NodeId, PartitionIndex, PartitionRole};

    pub use bytes;
}
