//! Configuration for a shardmesh cluster node.
//!
//! All placement-affecting options (`distributed_size`, `replication_size`)
//! must be identical on every node of a cluster; they are fixed at cluster
//! formation and validated at startup.

use std::time::Duration;

use crate::constants::{
    DEFAULT_DISTRIBUTED_SIZE, DEFAULT_FORCED_LOCK_TIMEOUT_MS,
    DEFAULT_FORCED_WHOLE_LOCK_TIMEOUT_MS, DEFAULT_PARALLEL_REQUEST_THREADS,
    DEFAULT_REHASH_TIMEOUT_MS, DEFAULT_REPLICATION_SIZE, DEFAULT_TIMEOUT_MS,
    MAX_PARALLEL_REQUEST_THREADS, MIN_DISTRIBUTED_SIZE,
};
use crate::error::{Error, Result};

/// Configuration for a single cluster node.
///
/// # Example
///
/// ```rust
/// use shardmesh::cluster::ClusterConfig;
///
/// let config = ClusterConfig {
///     distributed_size: 32,
///     replication_size: 3,
///     ..Default::default()
/// };
/// config.validate().expect("invalid config");
/// ```
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of partitions in the key space. Minimum 2, fixed at cluster
    /// formation; every node must agree on this value.
    pub distributed_size: usize,

    /// Target number of server (authoritative) holders per partition.
    /// Minimum 1. If it exceeds the number of reachable nodes, every node
    /// serves every partition.
    pub replication_size: usize,

    /// Whether this node participates in rehash (placement changes).
    ///
    /// Toggled at runtime by the REHASH_SWITCH coordination message.
    pub rehash_enabled: bool,

    /// Budget for a full rehash exchange.
    pub rehash_timeout: Duration,

    /// Default budget for ordinary operations (fan-out, locks, remote calls).
    pub default_timeout: Duration,

    /// Ceiling on a single lock ticket hold before the watchdog reclaims it
    /// as a forced unlock.
    pub forced_lock_timeout: Duration,

    /// Ceiling for whole-store lock holds.
    pub forced_whole_lock_timeout: Duration,

    /// Whether `NodeCoordinator::start` blocks until every configured peer
    /// has a registered receiver before spawning background tasks.
    pub wait_connect_all_on_start: bool,

    /// Fan-out worker pool size. Zero selects sequential mode.
    pub parallel_request_threads: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            distributed_size: DEFAULT_DISTRIBUTED_SIZE,
            replication_size: DEFAULT_REPLICATION_SIZE,
            rehash_enabled: true,
            rehash_timeout: Duration::from_millis(DEFAULT_REHASH_TIMEOUT_MS),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            forced_lock_timeout: Duration::from_millis(DEFAULT_FORCED_LOCK_TIMEOUT_MS),
            forced_whole_lock_timeout: Duration::from_millis(
                DEFAULT_FORCED_WHOLE_LOCK_TIMEOUT_MS,
            ),
            wait_connect_all_on_start: false,
            parallel_request_threads: DEFAULT_PARALLEL_REQUEST_THREADS,
        }
    }
}

impl ClusterConfig {
    /// Create configuration from environment variables.
    ///
    /// Recognized variables (all optional, defaults apply otherwise):
    /// - `SHARDMESH_DISTRIBUTED_SIZE`
    /// - `SHARDMESH_REPLICATION_SIZE`
    /// - `SHARDMESH_REHASH_ENABLED` (`true`/`false`)
    /// - `SHARDMESH_REHASH_TIMEOUT_MS`
    /// - `SHARDMESH_DEFAULT_TIMEOUT_MS`
    /// - `SHARDMESH_FORCED_LOCK_TIMEOUT_MS`
    /// - `SHARDMESH_FORCED_WHOLE_LOCK_TIMEOUT_MS`
    /// - `SHARDMESH_WAIT_CONNECT_ALL` (`true`/`false`)
    /// - `SHARDMESH_PARALLEL_REQUEST_THREADS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("SHARDMESH_DISTRIBUTED_SIZE")? {
            config.distributed_size = v;
        }
        if let Some(v) = env_parse("SHARDMESH_REPLICATION_SIZE")? {
            config.replication_size = v;
        }
        if let Some(v) = env_parse("SHARDMESH_REHASH_ENABLED")? {
            config.rehash_enabled = v;
        }
        if let Some(v) = env_parse("SHARDMESH_REHASH_TIMEOUT_MS")? {
            config.rehash_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("SHARDMESH_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("SHARDMESH_FORCED_LOCK_TIMEOUT_MS")? {
            config.forced_lock_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("SHARDMESH_FORCED_WHOLE_LOCK_TIMEOUT_MS")? {
            config.forced_whole_lock_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("SHARDMESH_WAIT_CONNECT_ALL")? {
            config.wait_connect_all_on_start = v;
        }
        if let Some(v) = env_parse("SHARDMESH_PARALLEL_REQUEST_THREADS")? {
            config.parallel_request_threads = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.distributed_size < MIN_DISTRIBUTED_SIZE {
            return Err(Error::Config(format!(
                "distributed_size must be at least {}, got {}",
                MIN_DISTRIBUTED_SIZE, self.distributed_size
            )));
        }
        if self.replication_size < 1 {
            return Err(Error::Config(
                "replication_size must be at least 1".to_string(),
            ));
        }
        if self.parallel_request_threads > MAX_PARALLEL_REQUEST_THREADS {
            return Err(Error::Config(format!(
                "parallel_request_threads must be at most {}, got {}",
                MAX_PARALLEL_REQUEST_THREADS, self.parallel_request_threads
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Config(
                "default_timeout must be positive".to_string(),
            ));
        }
        if self.rehash_timeout.is_zero() {
            return Err(Error::Config("rehash_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// True if the fan-out executor should run in sequential mode.
    #[inline]
    pub fn is_sequential(&self) -> bool {
        self.parallel_request_threads == 0
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value '{raw}' for {name}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_sequential());
        assert!(config.rehash_enabled);
    }

    #[test]
    fn test_distributed_size_too_small() {
        let config = ClusterConfig {
            distributed_size: 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("distributed_size"));
    }

    #[test]
    fn test_replication_size_zero_rejected() {
        let config = ClusterConfig {
            replication_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parallel_threads_bounded() {
        let config = ClusterConfig {
            parallel_request_threads: MAX_PARALLEL_REQUEST_THREADS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClusterConfig {
            parallel_request_threads: 8,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.is_sequential());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = ClusterConfig {
            default_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClusterConfig {
            rehash_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
