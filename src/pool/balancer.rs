//! Worker selection strategies
//!
//! The balancer picks a worker index per request. Unhealthy workers (dead,
//! or over the error threshold) are excluded; when nothing healthy remains
//! the first worker is the safe fallback, so a request always has a target
//! and fails through the normal dead-worker path instead of stalling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::BalancingStrategy;

use super::worker::WorkerHealth;

pub(crate) struct LoadBalancer {
    strategy: BalancingStrategy,
    next: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: BalancingStrategy) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    /// Pick a worker index. `None` only when `workers` is empty.
    pub fn pick(&self, workers: &[Arc<WorkerHealth>]) -> Option<usize> {
        if workers.is_empty() {
            return None;
        }
        let healthy: Vec<usize> = workers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_healthy())
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            return Some(0);
        }

        let choice = match self.strategy {
            BalancingStrategy::RoundRobin => {
                let n = self.next.fetch_add(1, Ordering::Relaxed);
                healthy[n % healthy.len()]
            }
            BalancingStrategy::LeastBusy => healthy
                .iter()
                .copied()
                .min_by_key(|&i| workers[i].load())
                .unwrap_or(healthy[0]),
            BalancingStrategy::Weighted => {
                // Weight proportional to spare capacity: 100 - load.
                let weights: Vec<usize> = healthy
                    .iter()
                    .map(|&i| 100usize.saturating_sub(workers[i].load()).max(1))
                    .collect();
                let total: usize = weights.iter().sum();
                let mut roll = fastrand::usize(..total);
                let mut chosen = healthy[0];
                for (idx, weight) in healthy.iter().zip(weights.iter()) {
                    if roll < *weight {
                        chosen = *idx;
                        break;
                    }
                    roll -= weight;
                }
                chosen
            }
        };
        Some(choice)
    }
}
