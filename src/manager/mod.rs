//! The pool manager: one pool per host, live role classification, and a
//! single acquire surface routed through a balancing policy.

mod monitor;
mod registry;

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::future::{join_all, try_join, try_join_all};
use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

use self::{monitor::Monitor, registry::PoolRegistry};
use crate::{
    balancer::{BalancerPolicy, CandidateRequest, GreedyBalancerPolicy},
    driver::{Driver, PoolConfig},
    dsn::{split_dsn, Dsn, DEFAULT_PORT},
    error::{Error, Result},
    metrics::{Metrics, MetricsRecorder},
    runtime,
    stopwatch::Stopwatch,
};

/// Default total budget for one acquire call.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default sleep between two probe cycles of a host.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Default budget for each probe step (pool creation, probe acquire, role
/// check).
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default probability of serving a read-only acquire from a master.
pub const DEFAULT_MASTER_AS_REPLICA_WEIGHT: f64 = 0.0;

/// Default number of probe durations kept per host for weighted balancing.
pub const DEFAULT_STOPWATCH_WINDOW_SIZE: usize = 128;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of a [`PoolManager`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Total time budget for one acquire call.
    pub acquire_timeout: Duration,

    /// Sleep between two probe cycles of a host.
    pub refresh_delay: Duration,

    /// Time budget for each individual probe step.
    pub refresh_timeout: Duration,

    /// Whether read-only acquires may fall back to a master when no replicas
    /// are available, unless overridden per call.
    pub fallback_master: bool,

    /// Probability of treating masters as replica candidates on read-only
    /// acquires, unless overridden per call. Must lie in `[0, 1]`.
    pub master_as_replica_weight: f64,

    /// Number of probe durations kept per host.
    pub stopwatch_window_size: usize,

    /// Pool-factory settings handed to the driver adapter.
    pub pool_config: PoolConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            refresh_delay: DEFAULT_REFRESH_DELAY,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            fallback_master: false,
            master_as_replica_weight: DEFAULT_MASTER_AS_REPLICA_WEIGHT,
            stopwatch_window_size: DEFAULT_STOPWATCH_WINDOW_SIZE,
            pool_config: PoolConfig::default(),
        }
    }
}

/// Per-call configuration of [`PoolManager::acquire`].
#[derive(Clone, Debug, Default)]
pub struct AcquireOptions {
    /// Whether the request may be served by a replica.
    pub read_only: bool,

    /// Overrides the manager's `fallback_master` for this call.
    pub fallback_master: Option<bool>,

    /// Overrides the manager's `master_as_replica_weight` for this call.
    /// Only valid together with `read_only`.
    pub master_as_replica_weight: Option<f64>,

    /// Overrides the manager's `acquire_timeout` for this call.
    pub timeout: Option<Duration>,
}

impl AcquireOptions {
    /// Sets whether the request may be served by a replica.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allows or forbids falling back to a master for this call.
    pub fn fallback_master(mut self, fallback_master: bool) -> Self {
        self.fallback_master = Some(fallback_master);
        self
    }

    /// Sets the master-as-replica probability for this call.
    pub fn master_as_replica_weight(mut self, weight: f64) -> Self {
        self.master_as_replica_weight = Some(weight);
        self
    }

    /// Sets the time budget for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Shared<D: Driver> {
    driver: D,
    options: PoolOptions,
    pool_config: PoolConfig,
    dsns: Vec<Dsn>,
    dsn_keys: Vec<String>,
    registry: PoolRegistry<D>,
    stopwatch: Stopwatch,
    metrics: MetricsRecorder,
    closing_tx: watch::Sender<bool>,
    closing: AtomicBool,
    closed: AtomicBool,
    next_connection_id: AtomicU64,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes connection acquires across the pools of a replicated cluster.
///
/// Construction parses the multi-host DSN, spawns one monitor task per
/// host, and returns immediately; [`ready`](PoolManager::ready) reports
/// when classification has caught up. The manager is a cheap handle and can
/// be cloned freely; all clones share the same pools.
pub struct PoolManager<D: Driver> {
    inner: Arc<Shared<D>>,
    balancer: Arc<dyn BalancerPolicy<D>>,
}

impl<D: Driver> Clone for PoolManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            balancer: self.balancer.clone(),
        }
    }
}

impl<D: Driver> PoolManager<D> {
    /// Creates a manager balancing with the default greedy policy.
    ///
    /// Must be called from within an async runtime; the per-host monitors
    /// are spawned here.
    pub fn new(dsn: impl AsRef<str>, driver: D, options: PoolOptions) -> Result<Self> {
        Self::with_balancer(dsn, driver, options, Arc::new(GreedyBalancerPolicy::new()))
    }

    /// Creates a manager with an explicit balancing policy.
    pub fn with_balancer(
        dsn: impl AsRef<str>,
        driver: D,
        options: PoolOptions,
        balancer: Arc<dyn BalancerPolicy<D>>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&options.master_as_replica_weight) {
            return Err(Error::invalid_argument(
                "master_as_replica_weight must belong to the segment [0; 1]",
            ));
        }

        let parsed = Dsn::parse(dsn.as_ref())?;
        let dsns = split_dsn(&parsed, DEFAULT_PORT);
        let dsn_keys: Vec<String> = dsns.iter().map(|dsn| dsn.redacted().to_string()).collect();
        let pool_config = driver.prepare_pool_config(options.pool_config.clone());
        let (closing_tx, closing_rx) = watch::channel(false);

        let inner = Arc::new(Shared {
            registry: PoolRegistry::new(dsns.len()),
            stopwatch: Stopwatch::new(options.stopwatch_window_size),
            metrics: MetricsRecorder::new(),
            pool_config,
            dsn_keys,
            dsns,
            driver,
            options,
            closing_tx,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(0),
            monitors: Mutex::new(Vec::new()),
        });

        let handles: Vec<JoinHandle<()>> = inner
            .dsns
            .iter()
            .enumerate()
            .map(|(index, dsn)| {
                Monitor::start(index, dsn.clone(), inner.clone(), closing_rx.clone())
            })
            .collect();
        *inner.monitors.lock().unwrap() = handles;

        Ok(Self {
            inner,
            balancer,
        })
    }

    /// The single-host DSNs this manager monitors, in host-array order.
    pub fn dsns(&self) -> &[Dsn] {
        &self.inner.dsns
    }

    /// Snapshot of the host array's pools; slots are `None` until the host's
    /// first pool creation succeeds.
    pub fn pools(&self) -> Vec<Option<D::Pool>> {
        self.inner.registry.pools()
    }

    /// Number of pools currently classified as masters.
    pub fn master_pool_count(&self) -> usize {
        self.inner.registry.master_count()
    }

    /// Number of pools currently classified as replicas.
    pub fn replica_pool_count(&self) -> usize {
        self.inner.registry.replica_count()
    }

    /// Number of pools currently classified at all.
    pub fn available_pool_count(&self) -> usize {
        self.master_pool_count() + self.replica_pool_count()
    }

    /// Whether the host at `index` is currently classified as a master.
    pub fn pool_is_master(&self, index: usize) -> bool {
        self.inner.registry.is_master(index)
    }

    /// Whether the host at `index` is currently classified as a replica.
    pub fn pool_is_replica(&self, index: usize) -> bool {
        self.inner.registry.is_replica(index)
    }

    /// The median of the host's recent probe durations, if any.
    pub fn last_response_time(&self, index: usize) -> Option<Duration> {
        self.inner.stopwatch.get_time(index)
    }

    /// Number of connections currently borrowed from this manager.
    pub fn borrowed_connection_count(&self) -> usize {
        self.inner.registry.borrowed_count()
    }

    /// Whether a borrowed connection has been closed underneath its handle.
    pub fn is_connection_closed(&self, connection: &PooledConnection<D>) -> bool {
        self.inner.driver.is_connection_closed(&**connection)
    }

    /// Whether a shutdown is in progress.
    pub fn closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Whether the manager has been shut down.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// A registry view suitable for balancing policies.
    pub fn view(&self) -> PoolView<D> {
        PoolView {
            shared: self.inner.clone(),
        }
    }

    /// The master pools, waiting for the set to become non-empty first.
    pub async fn get_master_pools(&self) -> Result<Vec<D::Pool>> {
        let indexes = self.inner.registry.master_pools_ready().await?;
        Ok(self.collect_pools(&indexes))
    }

    /// The replica pools, waiting for the set to become non-empty first;
    /// with `fallback_master` an empty replica set is substituted by the
    /// masters.
    pub async fn get_replica_pools(&self, fallback_master: bool) -> Result<Vec<D::Pool>> {
        let indexes = self.inner.registry.replica_pools_ready(fallback_master).await?;
        Ok(self.collect_pools(&indexes))
    }

    fn collect_pools(&self, indexes: &[usize]) -> Vec<D::Pool> {
        indexes
            .iter()
            .filter_map(|&index| self.inner.registry.pool(index))
            .collect()
    }

    /// Acquires a connection according to `options`.
    ///
    /// Policy selection and the driver acquire together run under a single
    /// time budget (the per-call `timeout`, defaulting to the manager's
    /// `acquire_timeout`). The returned [`PooledConnection`] releases itself
    /// when dropped; pass it to [`release`](PoolManager::release) to await
    /// the release instead.
    pub async fn acquire(&self, options: AcquireOptions) -> Result<PooledConnection<D>> {
        let fallback_master = options
            .fallback_master
            .unwrap_or(self.inner.options.fallback_master);

        if !options.read_only && options.master_as_replica_weight.is_some() {
            return Err(Error::invalid_argument(
                "master_as_replica_weight is used only when read_only is true",
            ));
        }
        if let Some(weight) = options.master_as_replica_weight {
            if !(0.0..=1.0).contains(&weight) {
                return Err(Error::invalid_argument(
                    "master_as_replica_weight must belong to the segment [0; 1]",
                ));
            }
        }

        let master_as_replica_weight = options.read_only.then(|| {
            options
                .master_as_replica_weight
                .unwrap_or(self.inner.options.master_as_replica_weight)
        });
        let timeout = options.timeout.unwrap_or(self.inner.options.acquire_timeout);

        runtime::timeout(
            timeout,
            self.acquire_connection(options.read_only, fallback_master, master_as_replica_weight),
        )
        .await?
    }

    /// Acquires a connection to the master.
    pub async fn acquire_master(&self) -> Result<PooledConnection<D>> {
        self.acquire(AcquireOptions::default()).await
    }

    /// Acquires a connection to a replica; equivalent to
    /// [`acquire`](PoolManager::acquire) with `read_only` forced on.
    pub async fn acquire_replica(&self, options: AcquireOptions) -> Result<PooledConnection<D>> {
        self.acquire(options.read_only(true)).await
    }

    async fn acquire_connection(
        &self,
        read_only: bool,
        fallback_master: bool,
        master_as_replica_weight: Option<f64>,
    ) -> Result<PooledConnection<D>> {
        let request = CandidateRequest::new(read_only, fallback_master, master_as_replica_weight)?;
        let view = self.view();

        let index = {
            let _timer = self.inner.metrics.time_pool();
            self.balancer.select_pool(&view, &request).await?
        };
        let pool = self
            .inner
            .registry
            .pool(index)
            .ok_or_else(|| Error::internal("selected pool is no longer available"))?;

        let connection = {
            let _timer = self.inner.metrics.time_acquire();
            self.inner.driver.acquire(&pool).await?
        };

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.inner.registry.register_connection(id, index);
        self.inner.metrics.add_connection(&self.inner.dsn_keys[index]);

        Ok(PooledConnection {
            connection: Some(connection),
            id,
            index,
            shared: self.inner.clone(),
        })
    }

    /// Releases a borrowed connection back to its owning pool.
    ///
    /// The owning pool is looked up through the borrowed-connection map;
    /// releasing a connection the manager no longer knows about (for
    /// instance after [`close`](PoolManager::close)) is a programming error.
    pub async fn release(&self, mut connection: PooledConnection<D>) -> Result<()> {
        let raw = connection
            .connection
            .take()
            .ok_or_else(|| Error::internal("connection already released"))?;
        match self.inner.registry.unregister_connection(connection.id) {
            Some(index) => {
                let pool = self
                    .inner
                    .registry
                    .pool(index)
                    .ok_or_else(|| Error::internal("owning pool is no longer available"))?;
                self.inner.metrics.remove_connection(&self.inner.dsn_keys[index]);
                self.inner.driver.release(raw, &pool).await
            }
            None => Err(Error::invalid_argument(
                "released connection is not managed by this pool manager",
            )),
        }
    }

    /// Waits until the cluster is ready.
    ///
    /// With both counts `None`, waits until every host has been classified
    /// once; with both counts set, waits until at least that many masters
    /// and replicas are up simultaneously. Mixing `None` and `Some` is an
    /// error. `timeout` defaults to ten seconds.
    pub async fn ready(
        &self,
        masters_count: Option<usize>,
        replicas_count: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if masters_count.is_some() != replicas_count.is_some() {
            return Err(Error::invalid_argument(
                "masters_count and replicas_count should both be either None or not None",
            ));
        }
        let timeout = timeout.unwrap_or(DEFAULT_READY_TIMEOUT);
        match (masters_count, replicas_count) {
            (Some(masters), Some(replicas)) => {
                runtime::timeout(timeout, async {
                    try_join(
                        self.wait_masters_ready(masters),
                        self.wait_replicas_ready(replicas),
                    )
                    .await
                    .map(|_| ())
                })
                .await?
            }
            _ => runtime::timeout(timeout, self.wait_all_ready()).await?,
        }
    }

    /// Waits until every host has been classified at least once.
    pub async fn wait_all_ready(&self) -> Result<()> {
        for index in 0..self.inner.dsns.len() {
            self.inner.registry.wait_ready(index).await?;
        }
        Ok(())
    }

    /// Waits until at least `masters_count` masters are up.
    pub async fn wait_masters_ready(&self, masters_count: usize) -> Result<()> {
        self.inner.registry.wait_masters_ready(masters_count).await
    }

    /// Waits until at least `replicas_count` replicas are up.
    pub async fn wait_replicas_ready(&self, replicas_count: usize) -> Result<()> {
        self.inner.registry.wait_replicas_ready(replicas_count).await
    }

    /// Waits until every host has completed a probe cycle that started
    /// after this call. `timeout` defaults to ten seconds.
    pub async fn wait_next_pool_check(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(DEFAULT_READY_TIMEOUT);
        let checks =
            (0..self.inner.dsns.len()).map(|index| self.inner.registry.wait_checked_twice(index));
        runtime::timeout(timeout, try_join_all(checks)).await?.map(|_| ())
    }

    /// A metrics snapshot covering every live pool and the manager itself.
    pub fn metrics(&self) -> Metrics {
        let drivers = self
            .inner
            .registry
            .pools()
            .into_iter()
            .flatten()
            .map(|pool| self.inner.driver.pool_metrics(&pool))
            .collect();
        Metrics {
            drivers,
            hasql: self.inner.metrics.snapshot(),
        }
    }

    /// Gracefully shuts the manager down: stops the monitors, reclaims
    /// borrowed connections, clears both sets, and closes every pool
    /// concurrently. Failures of individual pool closes are logged and
    /// swallowed.
    pub async fn close(&self) {
        self.shutdown(false).await
    }

    /// Forcibly shuts the manager down, terminating pools sequentially.
    pub async fn terminate(&self) {
        self.shutdown(true).await
    }

    async fn shutdown(&self, force: bool) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let _ = self.inner.closing_tx.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut monitors = self.inner.monitors.lock().unwrap();
            monitors.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        for (_, index) in self.inner.registry.drain_borrowed() {
            self.inner.metrics.remove_connection(&self.inner.dsn_keys[index]);
        }
        self.inner.registry.clear_sets();

        let pools: Vec<D::Pool> = self.inner.registry.pools().into_iter().flatten().collect();
        if force {
            for pool in &pools {
                if let Err(error) = self.inner.driver.terminate_pool(pool).await {
                    warn!(%error, "terminating pool failed");
                }
            }
        } else {
            join_all(pools.iter().map(|pool| async move {
                if let Err(error) = self.inner.driver.close_pool(pool).await {
                    warn!(%error, "closing pool failed");
                }
            }))
            .await;
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// The registry interface a [`BalancerPolicy`](crate::balancer::BalancerPolicy)
/// sees: candidate sets, readiness waits, and per-host statistics, all keyed
/// by host-array index.
pub struct PoolView<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for PoolView<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Driver> PoolView<D> {
    /// Number of pools currently classified as masters.
    pub fn master_pool_count(&self) -> usize {
        self.shared.registry.master_count()
    }

    /// Number of pools currently classified as replicas.
    pub fn replica_pool_count(&self) -> usize {
        self.shared.registry.replica_count()
    }

    /// The master set's indexes, waiting for the set to become non-empty.
    pub async fn master_candidates(&self) -> Result<Vec<usize>> {
        self.shared.registry.master_pools_ready().await
    }

    /// The replica set's indexes, waiting for the set to become non-empty;
    /// with `fallback_master` an empty replica set is substituted by the
    /// masters.
    pub async fn replica_candidates(&self, fallback_master: bool) -> Result<Vec<usize>> {
        self.shared.registry.replica_pools_ready(fallback_master).await
    }

    /// Waits until at least `count` masters are up.
    pub async fn wait_masters_ready(&self, count: usize) -> Result<()> {
        self.shared.registry.wait_masters_ready(count).await
    }

    /// Waits until at least `count` replicas are up.
    pub async fn wait_replicas_ready(&self, count: usize) -> Result<()> {
        self.shared.registry.wait_replicas_ready(count).await
    }

    /// Snapshot of the host array's pools.
    pub fn pools(&self) -> Vec<Option<D::Pool>> {
        self.shared.registry.pools()
    }

    /// Whether the host at `index` is currently classified as a master.
    pub fn pool_is_master(&self, index: usize) -> bool {
        self.shared.registry.is_master(index)
    }

    /// Whether the host at `index` is currently classified as a replica.
    pub fn pool_is_replica(&self, index: usize) -> bool {
        self.shared.registry.is_replica(index)
    }

    /// Idle-connection count of the host's pool, or zero while the pool
    /// does not exist.
    pub fn free_size(&self, index: usize) -> usize {
        self.shared
            .registry
            .pool(index)
            .map(|pool| self.shared.driver.free_size(&pool))
            .unwrap_or(0)
    }

    /// The median of the host's recent probe durations, if any.
    pub fn last_response_time(&self, index: usize) -> Option<Duration> {
        self.shared.stopwatch.get_time(index)
    }

    /// Length of the host array.
    pub fn host_count(&self) -> usize {
        self.shared.dsns.len()
    }
}

/// A connection borrowed from one of the manager's pools.
///
/// Dereferences to the driver's connection type. Dropping the guard returns
/// the connection to its owning pool in the background; use
/// [`PoolManager::release`] to await the hand-back instead.
pub struct PooledConnection<D: Driver> {
    connection: Option<D::Connection>,
    id: u64,
    index: usize,
    shared: Arc<Shared<D>>,
}

impl<D: Driver> PooledConnection<D> {
    /// Host-array index of the pool this connection belongs to.
    pub fn pool_index(&self) -> usize {
        self.index
    }
}

impl<D: Driver> std::fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("index", &self.index)
            .finish()
    }
}

impl<D: Driver> Deref for PooledConnection<D> {
    type Target = D::Connection;

    fn deref(&self) -> &D::Connection {
        self.connection.as_ref().expect("connection already released")
    }
}

impl<D: Driver> DerefMut for PooledConnection<D> {
    fn deref_mut(&mut self) -> &mut D::Connection {
        self.connection.as_mut().expect("connection already released")
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.shared.registry.unregister_connection(self.id).is_none() {
            // the manager reclaimed this connection during shutdown
            return;
        }
        self.shared
            .metrics
            .remove_connection(&self.shared.dsn_keys[self.index]);
        let Some(pool) = self.shared.registry.pool(self.index) else {
            return;
        };
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = shared.driver.release(connection, &pool).await {
                    warn!(%error, "releasing connection failed");
                }
            });
        }
    }
}
