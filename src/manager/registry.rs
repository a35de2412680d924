use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use tokio::sync::watch;

use crate::{
    driver::Driver,
    error::{Error, Result},
};

/// Shared classification state for every host of one manager.
///
/// The mutable state sits behind one mutex held only across non-blocking
/// sections; waiters observe it through watch channels carrying the set
/// sizes, the per-host ready flag, and the per-host probe-cycle counter.
/// Role transitions update both sets under the lock before any channel is
/// notified, so a woken waiter never observes a half-applied transition.
pub(super) struct PoolRegistry<D: Driver> {
    state: Mutex<RegistryState<D>>,
    master_count: watch::Sender<usize>,
    replica_count: watch::Sender<usize>,
    hosts: Vec<HostSignals>,
}

struct HostSignals {
    ready: watch::Sender<bool>,
    check: watch::Sender<u64>,
}

struct RegistryState<D: Driver> {
    pools: Vec<Option<D::Pool>>,
    masters: HashSet<usize>,
    replicas: HashSet<usize>,
    borrowed: HashMap<u64, usize>,
}

impl<D: Driver> PoolRegistry<D> {
    pub(super) fn new(host_count: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pools: vec![None; host_count],
                masters: HashSet::new(),
                replicas: HashSet::new(),
                borrowed: HashMap::new(),
            }),
            master_count: watch::channel(0).0,
            replica_count: watch::channel(0).0,
            hosts: (0..host_count)
                .map(|_| HostSignals {
                    ready: watch::channel(false).0,
                    check: watch::channel(0).0,
                })
                .collect(),
        }
    }

    pub(super) fn set_pool(&self, index: usize, pool: D::Pool) {
        self.state.lock().unwrap().pools[index] = Some(pool);
    }

    pub(super) fn pool(&self, index: usize) -> Option<D::Pool> {
        self.state.lock().unwrap().pools.get(index).cloned().flatten()
    }

    pub(super) fn pools(&self) -> Vec<Option<D::Pool>> {
        self.state.lock().unwrap().pools.clone()
    }

    /// Moves the host into the master set; returns whether it was newly
    /// added.
    pub(super) fn promote_master(&self, index: usize) -> bool {
        let (added, masters, replicas) = {
            let mut state = self.state.lock().unwrap();
            let added = state.masters.insert(index);
            state.replicas.remove(&index);
            (added, state.masters.len(), state.replicas.len())
        };
        self.master_count.send_replace(masters);
        self.replica_count.send_replace(replicas);
        added
    }

    /// Moves the host into the replica set; returns whether it was newly
    /// added.
    pub(super) fn promote_replica(&self, index: usize) -> bool {
        let (added, masters, replicas) = {
            let mut state = self.state.lock().unwrap();
            let added = state.replicas.insert(index);
            state.masters.remove(&index);
            (added, state.masters.len(), state.replicas.len())
        };
        self.master_count.send_replace(masters);
        self.replica_count.send_replace(replicas);
        added
    }

    /// Removes the host from both sets; returns which sets it was in.
    pub(super) fn demote(&self, index: usize) -> (bool, bool) {
        let (was_master, was_replica, masters, replicas) = {
            let mut state = self.state.lock().unwrap();
            let was_master = state.masters.remove(&index);
            let was_replica = state.replicas.remove(&index);
            (was_master, was_replica, state.masters.len(), state.replicas.len())
        };
        self.master_count.send_replace(masters);
        self.replica_count.send_replace(replicas);
        (was_master, was_replica)
    }

    pub(super) fn clear_sets(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.masters.clear();
            state.replicas.clear();
        }
        self.master_count.send_replace(0);
        self.replica_count.send_replace(0);
    }

    pub(super) fn is_master(&self, index: usize) -> bool {
        self.state.lock().unwrap().masters.contains(&index)
    }

    pub(super) fn is_replica(&self, index: usize) -> bool {
        self.state.lock().unwrap().replicas.contains(&index)
    }

    pub(super) fn master_count(&self) -> usize {
        *self.master_count.borrow()
    }

    pub(super) fn replica_count(&self) -> usize {
        *self.replica_count.borrow()
    }

    pub(super) fn master_indexes(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self.state.lock().unwrap().masters.iter().copied().collect();
        indexes.sort_unstable();
        indexes
    }

    pub(super) fn replica_indexes(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self.state.lock().unwrap().replicas.iter().copied().collect();
        indexes.sort_unstable();
        indexes
    }

    pub(super) async fn wait_masters_ready(&self, count: usize) -> Result<()> {
        let mut receiver = self.master_count.subscribe();
        receiver
            .wait_for(|current| *current >= count)
            .await
            .map(drop)
            .map_err(|_| Error::internal("pool registry went away"))
    }

    pub(super) async fn wait_replicas_ready(&self, count: usize) -> Result<()> {
        let mut receiver = self.replica_count.subscribe();
        receiver
            .wait_for(|current| *current >= count)
            .await
            .map(drop)
            .map_err(|_| Error::internal("pool registry went away"))
    }

    /// Returns the master set, waiting for it to become non-empty first.
    pub(super) async fn master_pools_ready(&self) -> Result<Vec<usize>> {
        loop {
            let snapshot = self.master_indexes();
            if !snapshot.is_empty() {
                return Ok(snapshot);
            }
            self.wait_masters_ready(1).await?;
        }
    }

    /// Returns the replica set, waiting for it to become non-empty first;
    /// with `fallback_master` an empty replica set is substituted by the
    /// master set instead of waiting.
    pub(super) async fn replica_pools_ready(&self, fallback_master: bool) -> Result<Vec<usize>> {
        if self.replica_count() == 0 && fallback_master {
            return self.master_pools_ready().await;
        }
        loop {
            let snapshot = self.replica_indexes();
            if !snapshot.is_empty() {
                return Ok(snapshot);
            }
            self.wait_replicas_ready(1).await?;
        }
    }

    /// Marks the host as classified at least once.
    pub(super) fn mark_ready(&self, index: usize) {
        self.hosts[index].ready.send_replace(true);
    }

    pub(super) async fn wait_ready(&self, index: usize) -> Result<()> {
        let mut receiver = self.hosts[index].ready.subscribe();
        receiver
            .wait_for(|ready| *ready)
            .await
            .map(drop)
            .map_err(|_| Error::internal("pool registry went away"))
    }

    /// Records that one probe cycle for the host has completed.
    pub(super) fn notify_check(&self, index: usize) {
        self.hosts[index].check.send_modify(|cycles| *cycles += 1);
    }

    /// Waits for two further probe cycles of the host, which guarantees that
    /// a full cycle started after this call has completed.
    pub(super) async fn wait_checked_twice(&self, index: usize) -> Result<()> {
        let mut receiver = self.hosts[index].check.subscribe();
        let target = *receiver.borrow() + 2;
        receiver
            .wait_for(|cycles| *cycles >= target)
            .await
            .map(drop)
            .map_err(|_| Error::internal("pool registry went away"))
    }

    pub(super) fn register_connection(&self, id: u64, index: usize) {
        self.state.lock().unwrap().borrowed.insert(id, index);
    }

    pub(super) fn unregister_connection(&self, id: u64) -> Option<usize> {
        self.state.lock().unwrap().borrowed.remove(&id)
    }

    pub(super) fn drain_borrowed(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().borrowed.drain().collect()
    }

    pub(super) fn borrowed_count(&self) -> usize {
        self.state.lock().unwrap().borrowed.len()
    }
}
