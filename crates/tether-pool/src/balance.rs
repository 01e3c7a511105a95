//! Provider selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    /// Rotate through candidates with an index shared across calls.
    #[default]
    RoundRobin,
    /// Uniform random pick.
    Random,
    /// Fewest requests currently in flight.
    LeastConnections,
    /// Fewest requests served since the connection was added.
    LeastRequests,
}

/// Load figures for one eligible connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub request_count: u64,
    pub in_flight: u64,
}

/// Picks one candidate per call according to a strategy.
#[derive(Debug, Default)]
pub struct Balancer {
    strategy: LoadBalanceStrategy,
    next: AtomicUsize,
}

impl Balancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// Index of the chosen candidate, `None` when there are none. Ties go to
    /// the earliest candidate.
    pub fn pick(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                self.next.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            LoadBalanceStrategy::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalanceStrategy::LeastConnections => least_by(candidates, |c| c.in_flight),
            LoadBalanceStrategy::LeastRequests => least_by(candidates, |c| c.request_count),
        };
        Some(index)
    }
}

fn least_by(candidates: &[Candidate<'_>], key: impl Fn(&Candidate<'_>) -> u64) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| key(c))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
