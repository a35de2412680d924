use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{BalancerPolicy, CandidateRequest};
use crate::{
    driver::Driver,
    error::{Error, Result},
    manager::PoolView,
};

/// Cycles through the host array, keeping an independent cursor per request
/// shape so masters, replicas, and master-as-replica requests rotate
/// independently.
#[derive(Debug, Default)]
pub struct RoundRobinBalancerPolicy {
    cursors: Mutex<HashMap<RequestShape, usize>>,
}

/// The three cursor keys: `(read_only, choose_master_as_replica)`.
type RequestShape = (bool, bool);

impl RoundRobinBalancerPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self::default()
    }

    fn matches<D: Driver>(view: &PoolView<D>, shape: RequestShape, index: usize) -> bool {
        match shape {
            (false, false) => view.pool_is_master(index),
            (true, false) => view.pool_is_replica(index),
            (true, true) => view.pool_is_master(index) || view.pool_is_replica(index),
            (false, true) => false,
        }
    }
}

#[async_trait]
impl<D: Driver> BalancerPolicy<D> for RoundRobinBalancerPolicy {
    async fn select_pool(&self, view: &PoolView<D>, request: &CandidateRequest) -> Result<usize> {
        let mut read_only = request.read_only;
        let mut choose_master_as_replica = request.choose_master_as_replica;

        if read_only {
            if view.replica_pool_count() == 0 {
                if request.fallback_master {
                    read_only = false;
                    choose_master_as_replica = false;
                    if view.master_pool_count() == 0 {
                        view.wait_masters_ready(1).await?;
                    }
                } else {
                    view.wait_replicas_ready(1).await?;
                }
            }
        } else if view.master_pool_count() == 0 {
            view.wait_masters_ready(1).await?;
        }

        let shape = (read_only, choose_master_as_replica);
        let pools = view.pools();
        let start_index = {
            let cursors = self.cursors.lock().unwrap();
            cursors.get(&shape).copied().unwrap_or(0)
        };

        for offset in 0..pools.len() {
            let index = (start_index + offset) % pools.len();
            if pools[index].is_some() && Self::matches(view, shape, index) {
                let mut cursors = self.cursors.lock().unwrap();
                cursors.insert(shape, (index + 1) % pools.len());
                return Ok(index);
            }
        }

        Err(Error::internal("no pool matched the round-robin predicate"))
    }
}
