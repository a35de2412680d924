//! The capability interface between the pool manager and a database driver.

#[cfg(feature = "deadpool")]
pub mod deadpool;

use async_trait::async_trait;

use crate::{dsn::Dsn, error::Result, metrics::DriverMetrics};

/// Portable pool-factory settings; adapters map these onto their native
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum number of connections kept open per host.
    pub min_size: usize,

    /// Maximum number of connections per host.
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
        }
    }
}

/// Adapter over a driver-owned, single-host connection pool.
///
/// The pool manager never talks to the database itself; everything it needs
/// from the driver goes through this trait. `Pool` must be a cheap handle:
/// it is cloned into the master/replica sets and into balancer snapshots.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Handle to a fully initialized single-host pool.
    type Pool: Clone + Send + Sync + 'static;

    /// A connection checked out of a pool.
    type Connection: Send + Sync + 'static;

    /// Constructs and fully initializes a pool for one host. The caller
    /// imposes the creation time budget, so this may block indefinitely on
    /// an unreachable host.
    async fn create_pool(&self, dsn: &Dsn, config: &PoolConfig) -> Result<Self::Pool>;

    /// Gracefully drains and closes a pool.
    async fn close_pool(&self, pool: &Self::Pool) -> Result<()>;

    /// Forcibly shuts a pool down. Must not block the scheduler; offload if
    /// the underlying call is synchronous.
    async fn terminate_pool(&self, pool: &Self::Pool) -> Result<()>;

    /// Checks a connection out of `pool`.
    async fn acquire(&self, pool: &Self::Pool) -> Result<Self::Connection>;

    /// Returns `connection` to `pool`.
    async fn release(&self, connection: Self::Connection, pool: &Self::Pool) -> Result<()>;

    /// Whether the host behind `connection` currently accepts writes.
    ///
    /// Issues `SHOW transaction_read_only` (or the equivalent for the target
    /// DBMS) and returns true iff the result is `off`. Any failure makes the
    /// monitor treat the host as down.
    async fn is_master(&self, connection: &mut Self::Connection) -> Result<bool>;

    /// Number of idle connections in `pool`.
    fn free_size(&self, pool: &Self::Pool) -> usize;

    /// Whether `connection` has been closed underneath its handle.
    fn is_connection_closed(&self, connection: &Self::Connection) -> bool;

    /// Host component of the pool's DSN, used in metrics.
    fn host(&self, pool: &Self::Pool) -> String;

    /// Adapter-reported gauges for one pool.
    fn pool_metrics(&self, pool: &Self::Pool) -> DriverMetrics;

    /// Adjusts the pool configuration before pools are created.
    ///
    /// One slot of every pool is reserved for the monitor's probe connection
    /// so that probing never starves application acquires; the effective
    /// application capacity therefore equals the requested size.
    fn prepare_pool_config(&self, config: PoolConfig) -> PoolConfig {
        PoolConfig {
            min_size: config.min_size + 1,
            max_size: config.max_size + 1,
        }
    }
}
