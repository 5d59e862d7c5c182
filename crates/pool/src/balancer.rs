//! Unit selection strategies.
//!
//! The coordinator filters units down to eligible candidates (available,
//! healthy, right capability) before asking the balancer to pick one, so a
//! strategy never sees a unit it must not use.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use offload_protocol::Capability;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::unit::UnitId;

/// Load-balancing strategy, selectable per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through units in id order.
    #[default]
    RoundRobin,
    /// Lowest `recent latency + queue depth hint`, ties by id.
    LeastBusy,
    /// Uniform pick.
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastBusy => "least_busy",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_busy" => Ok(Strategy::LeastBusy),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// What the balancer knows about an eligible unit.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: UnitId,
    pub capability: Capability,
    /// Mean of the unit's recent job latencies.
    pub recent_latency: Duration,
    /// Outstanding work the unit still owes (e.g. unanswered probes).
    pub queue_depth_hint: usize,
}

impl Candidate {
    /// Least-busy score in milliseconds.
    pub fn score(&self) -> f64 {
        self.recent_latency.as_secs_f64() * 1000.0 + self.queue_depth_hint as f64
    }
}

pub struct LoadBalancer {
    strategy: Strategy,
    /// Round-robin cursor: the last unit served.
    last_served: Option<UnitId>,
    rng: StdRng,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            last_served: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic random strategy for tests.
    pub fn with_seed(strategy: Strategy, seed: u64) -> Self {
        Self {
            strategy,
            last_served: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick one of `candidates`, or `None` when there are none.
    pub fn select(&mut self, candidates: &[Candidate]) -> Option<UnitId> {
        if candidates.is_empty() {
            return None;
        }
        let picked = match self.strategy {
            Strategy::RoundRobin => self.next_in_ring(candidates),
            Strategy::LeastBusy => candidates
                .iter()
                .min_by(|a, b| a.score().total_cmp(&b.score()).then(a.id.cmp(&b.id)))
                .map(|c| c.id),
            Strategy::Random => {
                let idx = self.rng.gen_range(0..candidates.len());
                Some(candidates[idx].id)
            }
        };
        if let Some(id) = picked {
            self.last_served = Some(id);
        }
        picked
    }

    /// The smallest candidate id after the last served one, wrapping around.
    ///
    /// Walking a fixed id ring instead of indexing the candidate slice keeps
    /// the rotation stable when the set of available units changes between
    /// dispatches.
    fn next_in_ring(&self, candidates: &[Candidate]) -> Option<UnitId> {
        let lowest = candidates.iter().map(|c| c.id).min();
        match self.last_served {
            None => lowest,
            Some(last) => candidates
                .iter()
                .map(|c| c.id)
                .filter(|id| *id > last)
                .min()
                .or(lowest),
        }
    }
}
