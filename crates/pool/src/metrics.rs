//! Pool and per-unit counters.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Fixed-capacity FIFO that evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

/// Incremental mean: `new_avg = prev_avg + (sample - prev_avg) / count`.
fn fold_mean(prev: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let prev_nanos = prev.as_nanos() as f64;
    let cur_nanos = sample.as_nanos() as f64;
    let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
    Duration::from_nanos(avg_nanos.max(0.0) as u64)
}

pub(crate) fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Outcome counters and latency history of one execution unit.
#[derive(Debug, Clone)]
pub struct UnitStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Lifetime mean latency of successful jobs.
    pub average_latency: Duration,
    recent: RingBuffer<Duration>,
    pub last_used_at: Instant,
    /// Outcomes counted toward the error-rate check since the last recovery.
    pub window_completed: u64,
    pub window_failed: u64,
}

impl UnitStats {
    pub fn new(latency_window: usize) -> Self {
        Self {
            jobs_completed: 0,
            jobs_failed: 0,
            average_latency: Duration::ZERO,
            recent: RingBuffer::new(latency_window),
            last_used_at: Instant::now(),
            window_completed: 0,
            window_failed: 0,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.jobs_completed += 1;
        self.window_completed += 1;
        self.average_latency = fold_mean(self.average_latency, latency, self.jobs_completed);
        self.recent.push(latency);
        self.last_used_at = Instant::now();
    }

    pub fn record_failure(&mut self) {
        self.jobs_failed += 1;
        self.window_failed += 1;
        self.last_used_at = Instant::now();
    }

    /// Mean of the last `latency_window` successful jobs.
    pub fn recent_average_latency(&self) -> Duration {
        if self.recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.recent.iter().sum();
        total / self.recent.len() as u32
    }

    /// Start a fresh error-rate window.
    pub fn reset_window(&mut self) {
        self.window_completed = 0;
        self.window_failed = 0;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

/// Pool-wide counters, exposed through snapshots and `GET /metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_retried: u64,
    pub jobs_cancelled: u64,
    /// Submissions refused with `QueueFull` or `UnknownCapability`.
    pub jobs_rejected: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    /// Healthy-to-unhealthy transitions.
    pub demotions: u64,
    /// Units spawned to refill the pool after an exit or termination.
    pub replacements: u64,
    #[serde(serialize_with = "serialize_millis", rename = "avg_latency_ms")]
    pub avg_latency: Duration,
    pub peak_units: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    pub fn record_completion(&mut self, latency: Duration) {
        self.jobs_completed += 1;
        self.avg_latency = fold_mean(self.avg_latency, latency, self.jobs_completed);
        self.last_completed_at = Some(Utc::now());
    }

    pub fn observe_units(&mut self, units: usize) {
        self.peak_units = self.peak_units.max(units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn pool_latency_is_a_running_mean() {
        let mut m = PoolMetrics::default();
        m.record_completion(Duration::from_millis(100));
        m.record_completion(Duration::from_millis(200));
        assert_eq!(m.jobs_completed, 2);
        let avg = m.avg_latency.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {avg}ms");
        assert!(m.last_completed_at.is_some());
    }

    #[test]
    fn recent_latency_only_sees_the_window() {
        let mut stats = UnitStats::new(2);
        stats.record_success(Duration::from_millis(1000));
        stats.record_success(Duration::from_millis(10));
        stats.record_success(Duration::from_millis(30));
        assert_eq!(stats.recent_average_latency(), Duration::from_millis(20));
        assert!(stats.average_latency > Duration::from_millis(300));
    }

    #[test]
    fn window_resets_but_lifetime_counts_stay() {
        let mut stats = UnitStats::new(4);
        stats.record_failure();
        stats.record_success(Duration::from_millis(5));
        stats.reset_window();
        assert_eq!((stats.window_completed, stats.window_failed), (0, 0));
        assert_eq!((stats.jobs_completed, stats.jobs_failed), (1, 1));
    }

    #[test]
    fn metrics_serialize_latency_in_millis() {
        let m = PoolMetrics {
            avg_latency: Duration::from_millis(12),
            ..Default::default()
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["avg_latency_ms"], 12.0);
        assert!(v.get("avg_latency").is_none());
    }
}
