use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{candidate_indexes, BalancerPolicy, CandidateRequest};
use crate::{
    driver::Driver,
    error::{Error, Result},
    manager::PoolView,
};

/// Picks the candidate pool with the most idle connections, breaking ties
/// uniformly at random so equally loaded hosts do not hot-spot.
#[derive(Clone, Copy, Debug, Default)]
pub struct GreedyBalancerPolicy;

impl GreedyBalancerPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<D: Driver> BalancerPolicy<D> for GreedyBalancerPolicy {
    async fn select_pool(&self, view: &PoolView<D>, request: &CandidateRequest) -> Result<usize> {
        let candidates = candidate_indexes(view, request).await?;
        // read each free size once so a probe running in parallel cannot
        // desynchronize the maximum from the filter below
        let free_sizes: Vec<(usize, usize)> = candidates
            .into_iter()
            .map(|index| (index, view.free_size(index)))
            .collect();
        let max_free_size = free_sizes
            .iter()
            .map(|&(_, free_size)| free_size)
            .max()
            .unwrap_or(0);
        let fattest: Vec<usize> = free_sizes
            .into_iter()
            .filter(|&(_, free_size)| free_size == max_free_size)
            .map(|(index, _)| index)
            .collect();
        fattest
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| Error::internal("no candidate pools for request"))
    }
}
