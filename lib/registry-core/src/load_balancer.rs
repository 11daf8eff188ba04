//! Load balancing strategies for distributing traffic across instances

use crate::instance::InstanceRecord;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin: rotate through the currently eligible instances
    #[default]
    RoundRobin,
    /// Weighted: random draw proportional to instance weight
    Weighted,
    /// Random: uniform random draw
    Random,
}

/// Load balancer for selecting an instance based on a strategy.
///
/// Each service owns one; the round-robin cursor lives here.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified strategy
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select one of the eligible candidates based on the configured strategy
    pub fn select<'a>(&self, candidates: &[&'a InstanceRecord]) -> Option<&'a InstanceRecord> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(candidates),
            LoadBalancingStrategy::Weighted => Self::select_weighted(candidates),
            LoadBalancingStrategy::Random => Self::select_random(candidates),
        }
    }

    /// Select instance using round-robin over the current candidate set
    fn select_round_robin<'a>(&self, candidates: &[&'a InstanceRecord]) -> Option<&'a InstanceRecord> {
        let current = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
        candidates.get(current % candidates.len()).copied()
    }

    fn select_weighted<'a>(candidates: &[&'a InstanceRecord]) -> Option<&'a InstanceRecord> {
        match WeightedIndex::<u32>::new(candidates.iter().map(|c| c.weight)) {
            Ok(dist) => candidates.get(dist.sample(&mut rand::thread_rng())).copied(),
            // All weights zero or overflowing: treat the candidates as equal
            Err(_) => Self::select_random(candidates),
        }
    }

    fn select_random<'a>(candidates: &[&'a InstanceRecord]) -> Option<&'a InstanceRecord> {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index).copied()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}
