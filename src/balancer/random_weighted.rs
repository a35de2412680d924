use async_trait::async_trait;
use rand::Rng;

use super::{candidate_indexes, BalancerPolicy, CandidateRequest};
use crate::{driver::Driver, error::Result, manager::PoolView};

const MACHINE_EPSILON: f64 = 1e-16;

/// Weights candidates by their recent probe latency so that slow hosts are
/// chosen less often.
///
/// The selection values are derived by reflecting each median around the
/// total (`w = Σt − t + ε`) and then dividing the reflected sum by each
/// element. The resulting values do not form a probability distribution;
/// the prefix-sum draw below is tuned to this exact shape and changing the
/// formula changes the observable selection behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomWeightedBalancerPolicy;

impl RandomWeightedBalancerPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<D: Driver> BalancerPolicy<D> for RandomWeightedBalancerPolicy {
    async fn select_pool(&self, view: &PoolView<D>, request: &CandidateRequest) -> Result<usize> {
        let candidates = candidate_indexes(view, request).await?;
        let response_times: Vec<f64> = candidates
            .iter()
            .map(|&index| {
                view.last_response_time(index)
                    .map(|time| time.as_secs_f64())
                    .unwrap_or(0.0)
            })
            .collect();
        let values = selection_values(&response_times);
        let choice = weighted_choice(&values, rand::thread_rng().gen());
        Ok(candidates[choice])
    }
}

fn selection_values(times: &[f64]) -> Vec<f64> {
    let total: f64 = times.iter().sum();
    let reflected: Vec<f64> = times
        .iter()
        .map(|time| total - time + MACHINE_EPSILON)
        .collect();
    let reflected_total: f64 = reflected.iter().sum();
    reflected.iter().map(|weight| reflected_total / weight).collect()
}

fn weighted_choice(values: &[f64], rand: f64) -> usize {
    let mut prefix_sum = 0.0;
    for (index, value) in values.iter().enumerate() {
        prefix_sum += value;
        if rand <= prefix_sum {
            return index;
        }
    }
    values.len() - 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn selection_values_are_positive_for_equal_times() {
        for times in [vec![0.0, 0.0, 0.0], vec![0.01, 0.01]] {
            let count = times.len();
            let values = selection_values(&times);
            assert_eq!(values.len(), count);
            assert!(values.iter().all(|value| *value > 0.0), "{values:?}");
        }
    }

    #[test]
    fn selection_values_reflect_latency() {
        let values = selection_values(&[0.001, 0.003]);
        // the reflected weight of the slow host is smaller, so its quotient
        // is larger
        assert!(values[1] > values[0]);
    }

    #[test]
    fn weighted_choice_walks_the_prefix_sums() {
        let values = vec![0.2, 0.3, 0.5];
        assert_eq!(weighted_choice(&values, 0.0), 0);
        assert_eq!(weighted_choice(&values, 0.25), 1);
        assert_eq!(weighted_choice(&values, 0.75), 2);
    }

    #[test]
    fn weighted_choice_falls_back_to_the_last_candidate() {
        // numerical drift can leave the draw above the last prefix sum
        assert_eq!(weighted_choice(&[0.2, 0.3], 0.9), 1);
    }
}
