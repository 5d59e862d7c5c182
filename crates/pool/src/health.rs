//! Health policy: who gets probed and when a unit is demoted.
//!
//! The coordinator owns the probe timers; this module only answers policy
//! questions so it can be tested without a running pool.

use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::metrics::UnitStats;

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub probe_deadline: Duration,
    pub busy_grace: Duration,
    pub error_rate_threshold: f64,
    pub min_sample_size: u64,
}

impl HealthPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            probe_deadline: config.probe_deadline(),
            busy_grace: config.busy_grace(),
            error_rate_threshold: config.error_rate_threshold,
            min_sample_size: config.min_sample_size,
        }
    }

    /// `failed / (completed + failed) > threshold`, once enough outcomes exist.
    pub fn error_rate_exceeded(&self, stats: &UnitStats) -> bool {
        let total = stats.window_completed + stats.window_failed;
        if total == 0 || total < self.min_sample_size {
            return false;
        }
        stats.window_failed as f64 / total as f64 > self.error_rate_threshold
    }

    /// Whether a probe round should ping this unit.
    ///
    /// `busy_since` is the assignment time of the current job, if any. Units
    /// flagged for a re-check are always probed.
    pub fn should_probe(
        &self,
        busy_since: Option<Instant>,
        needs_recheck: bool,
        now: Instant,
    ) -> bool {
        if needs_recheck {
            return true;
        }
        match busy_since {
            None => true,
            Some(since) => now.saturating_duration_since(since) < self.busy_grace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy::from_config(&HealthConfig::default())
    }

    fn stats(completed: u64, failed: u64) -> UnitStats {
        let mut s = UnitStats::new(4);
        for _ in 0..completed {
            s.record_success(Duration::from_millis(1));
        }
        for _ in 0..failed {
            s.record_failure();
        }
        s
    }

    #[test]
    fn error_rate_needs_minimum_sample() {
        let p = policy();
        assert!(!p.error_rate_exceeded(&stats(0, 4)));
        assert!(p.error_rate_exceeded(&stats(1, 4)));
    }

    #[test]
    fn error_rate_is_strictly_above_threshold() {
        let p = policy();
        assert!(!p.error_rate_exceeded(&stats(5, 5)));
        assert!(p.error_rate_exceeded(&stats(4, 6)));
    }

    #[test]
    fn busy_units_are_probed_only_within_grace() {
        let p = policy();
        let now = Instant::now();
        assert!(p.should_probe(None, false, now));
        assert!(p.should_probe(Some(now), false, now));
        let long_ago = now - (p.busy_grace + Duration::from_millis(1));
        assert!(!p.should_probe(Some(long_ago), false, now));
        assert!(p.should_probe(Some(long_ago), true, now));
    }
}
