//! Control-plane / data-plane runtime split.
//!
//! Coordination traffic (rehash exchanges, the membership watcher,
//! delegated persistence) is low-volume but deadline-bound: a rehash
//! acknowledgement that arrives late fails the whole placement change. The
//! data plane (client get/put and the fan-out worker pool) can saturate
//! under load. Hosting the two on separate tokio runtimes keeps one from
//! starving the other.
//!
//! [`RuntimeHandles`] is the seam components consume: the coordinator
//! spawns coordination tasks on `control` and fan-out pool workers on
//! `data`. Embedded and test deployments collapse both onto one runtime
//! with [`RuntimeHandles::from_current`]; a dedicated entry point owns a
//! [`NodeRuntimes`] pair and hands out its handles instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardmesh::cluster::{
//!     ClusterConfig, InProcessNetwork, MemoryReplica, NodeCoordinator, PartitionReplica,
//!     StaticMembership,
//! };
//! use shardmesh::runtime::{NodeRuntimes, RuntimeConfig};
//! use shardmesh::types::NodeId;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtimes = NodeRuntimes::new(RuntimeConfig::from_env())?;
//!
//!     let network = Arc::new(InProcessNetwork::new());
//!     let membership = Arc::new(StaticMembership::new([NodeId::new(1)]));
//!     let config = ClusterConfig::default();
//!     let replicas: Vec<Arc<dyn PartitionReplica>> = (0..config.distributed_size)
//!         .map(|p| {
//!             Arc::new(MemoryReplica::new(p, config.forced_lock_timeout))
//!                 as Arc<dyn PartitionReplica>
//!         })
//!         .collect();
//!     let node = NodeCoordinator::with_runtime_handles(
//!         NodeId::new(1),
//!         config,
//!         network.clone(),
//!         membership,
//!         replicas,
//!         runtimes.handles(),
//!     )?;
//!     network.register(node.node_id(), node.clone());
//!
//!     runtimes.block_on_control(node.rehash(Duration::from_secs(5)))?;
//!     Ok(())
//! }
//! ```

use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

/// Thread counts and names for the two planes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control plane worker threads. Two is plenty for coordination
    /// traffic.
    pub control_plane_threads: usize,

    /// Data plane worker threads. Defaults to the machine's parallelism.
    pub data_plane_threads: usize,

    /// Name prefix for control plane threads.
    pub control_plane_thread_name: String,

    /// Name prefix for data plane threads.
    pub data_plane_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_plane_threads: 2,
            data_plane_threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            control_plane_thread_name: "shardmesh-ctrl".to_string(),
            data_plane_thread_name: "shardmesh-data".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Read thread counts from `CONTROL_PLANE_THREADS` and
    /// `DATA_PLANE_THREADS`, keeping defaults for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let control_plane_threads = std::env::var("CONTROL_PLANE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.control_plane_threads);
        let data_plane_threads = std::env::var("DATA_PLANE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.data_plane_threads);
        Self {
            control_plane_threads,
            data_plane_threads,
            ..defaults
        }
    }
}

/// Cloneable spawn handles for both planes.
///
/// This is what the coordinator holds; it never owns the runtimes.
#[derive(Clone)]
pub struct RuntimeHandles {
    /// Coordination tasks spawn here.
    pub control: Handle,

    /// Fan-out pool workers and data traffic spawn here.
    pub data: Handle,
}

impl RuntimeHandles {
    /// Both planes on the current runtime.
    ///
    /// The single-runtime shape used by tests and embedded deployments.
    pub fn from_current() -> Self {
        let current = Handle::current();
        Self {
            control: current.clone(),
            data: current,
        }
    }
}

/// The owned runtime pair, held by the node's entry point.
pub struct NodeRuntimes {
    control: Runtime,
    data: Runtime,
    handles: RuntimeHandles,
}

impl NodeRuntimes {
    /// Build both runtimes.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let control = Builder::new_multi_thread()
            .worker_threads(config.control_plane_threads)
            .thread_name(&config.control_plane_thread_name)
            .enable_all()
            .build()?;
        let data = Builder::new_multi_thread()
            .worker_threads(config.data_plane_threads)
            .thread_name(&config.data_plane_thread_name)
            .enable_all()
            .build()?;
        let handles = RuntimeHandles {
            control: control.handle().clone(),
            data: data.handle().clone(),
        };
        Ok(Self {
            control,
            data,
            handles,
        })
    }

    /// Handles for passing into components.
    pub fn handles(&self) -> RuntimeHandles {
        self.handles.clone()
    }

    /// Drive a future to completion on the control plane.
    pub fn block_on_control<F: std::future::Future>(&self, future: F) -> F::Output {
        self.control.block_on(future)
    }

    /// Shut down both runtimes, data plane first so client work stops
    /// before coordination does.
    pub fn shutdown(self) {
        drop(self.data);
        drop(self.control);
    }
}
