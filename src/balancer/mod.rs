//! Balancing policies that pick a pool for each acquire request.

mod greedy;
mod random_weighted;
mod round_robin;

pub use self::{
    greedy::GreedyBalancerPolicy,
    random_weighted::RandomWeightedBalancerPolicy,
    round_robin::RoundRobinBalancerPolicy,
};

use async_trait::async_trait;
use rand::Rng;

use crate::{
    driver::Driver,
    error::{Error, Result},
    manager::PoolView,
};

/// A normalized acquire request, as seen by a balancing policy.
///
/// [`CandidateRequest::new`] performs the shared normalization: it validates
/// the `master_as_replica_weight` argument, draws the master-as-replica
/// decision from it, and folds that decision into `fallback_master`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidateRequest {
    /// Whether the request may be served by a replica.
    pub read_only: bool,

    /// Whether a read-only request may fall back to a master when no
    /// replicas are available.
    pub fallback_master: bool,

    /// Whether this particular request treats masters as replica candidates.
    pub choose_master_as_replica: bool,
}

impl CandidateRequest {
    /// Normalizes raw acquire arguments into a request.
    pub fn new(
        read_only: bool,
        fallback_master: bool,
        master_as_replica_weight: Option<f64>,
    ) -> Result<Self> {
        if !read_only && master_as_replica_weight.is_some() {
            return Err(Error::invalid_argument(
                "master_as_replica_weight is used only when read_only is true",
            ));
        }
        if let Some(weight) = master_as_replica_weight {
            if !(0.0..=1.0).contains(&weight) {
                return Err(Error::invalid_argument(
                    "master_as_replica_weight must belong to the segment [0; 1]",
                ));
            }
        }

        let choose_master_as_replica = match master_as_replica_weight {
            Some(weight) => {
                let rand: f64 = rand::thread_rng().gen();
                rand > 0.0 && rand <= weight
            }
            None => false,
        };

        Ok(Self {
            read_only,
            fallback_master: fallback_master || choose_master_as_replica,
            choose_master_as_replica,
        })
    }
}

/// A policy that selects the pool serving an acquire request.
///
/// Policies see the registry through the injected [`PoolView`] and return the
/// host-array index of the chosen pool. Implementations may await readiness
/// of the sets they need; the acquire timeout bounds the whole call.
#[async_trait]
pub trait BalancerPolicy<D: Driver>: Send + Sync + 'static {
    /// Selects a pool for `request`.
    async fn select_pool(&self, view: &PoolView<D>, request: &CandidateRequest) -> Result<usize>;
}

/// Builds the candidate set shared by the greedy and random-weighted
/// policies: replicas (or their fallback) for read-only requests, masters for
/// writes and for requests that drew the master-as-replica option.
pub(crate) async fn candidate_indexes<D: Driver>(
    view: &PoolView<D>,
    request: &CandidateRequest,
) -> Result<Vec<usize>> {
    let mut candidates = Vec::new();
    if request.read_only {
        candidates.extend(view.replica_candidates(request.fallback_master).await?);
    }
    if !request.read_only
        || (request.choose_master_as_replica && view.master_pool_count() > 0)
    {
        candidates.extend(view.master_candidates().await?);
    }
    if candidates.is_empty() {
        return Err(Error::internal("no candidate pools for request"));
    }
    Ok(candidates)
}
