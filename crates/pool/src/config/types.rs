use std::collections::HashMap;
use std::time::Duration;

use offload_protocol::{Capability, Framing};
use serde::{Deserialize, Serialize};

use crate::balancer::Strategy;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for one worker pool.
///
/// Parsed from `offload.toml` with support for `OFFLOAD_*` environment
/// overrides. Durations are written in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound on the unit count while auto-scaling.
    #[serde(default = "default_min_units")]
    pub min_units: usize,

    /// Hard upper bound on the unit count, also under burst load.
    #[serde(default = "default_max_units")]
    pub max_units: usize,

    /// Grow on demand and shrink when idle. When off, the pool runs a fixed
    /// `max_units` units.
    #[serde(default = "default_true")]
    pub auto_scale: bool,

    /// Pending jobs beyond this are rejected with `QueueFull`.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Load-balancing strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Capabilities this pool accepts jobs for.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,

    /// Capability of the units created at startup.
    #[serde(default = "default_warm_capability")]
    pub warm_capability: Capability,

    /// Execution budget per attempt, counted from assignment.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Maximum number of attempts per job (first try included).
    #[serde(default = "default_retry_budget")]
    pub default_retry_budget: u32,

    /// Base of the exponential retry backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap of the exponential retry backoff.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Whether retries avoid the unit the previous attempt failed on.
    #[serde(default)]
    pub retry_affinity: RetryAffinity,

    /// Optional cap on time spent queued before assignment.
    #[serde(default)]
    pub max_queue_wait_ms: Option<u64>,

    /// Idle time after which an available unit may be scaled down.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_time_ms: u64,

    /// Period of the idle sweep.
    #[serde(default = "default_idle_sweep_ms")]
    pub idle_sweep_interval_ms: u64,

    /// Time allowed for a new unit to announce itself as ready.
    #[serde(default = "default_unit_start_timeout_ms")]
    pub unit_start_timeout_ms: u64,

    /// Number of recent latencies kept per unit for least-busy scoring.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub unit: UnitConfig,
}

fn default_min_units() -> usize {
    1
}

fn default_max_units() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    100
}

fn default_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

fn default_warm_capability() -> Capability {
    Capability::Conversion
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_budget() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_max_idle_ms() -> u64 {
    60_000
}

fn default_idle_sweep_ms() -> u64 {
    15_000
}

fn default_unit_start_timeout_ms() -> u64 {
    10_000
}

fn default_latency_window() -> usize {
    20
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_units: default_min_units(),
            max_units: default_max_units(),
            auto_scale: true,
            max_queue_size: default_max_queue_size(),
            strategy: Strategy::default(),
            capabilities: default_capabilities(),
            warm_capability: default_warm_capability(),
            default_timeout_ms: default_timeout_ms(),
            default_retry_budget: default_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_affinity: RetryAffinity::default(),
            max_queue_wait_ms: None,
            max_idle_time_ms: default_max_idle_ms(),
            idle_sweep_interval_ms: default_idle_sweep_ms(),
            unit_start_timeout_ms: default_unit_start_timeout_ms(),
            latency_window: default_latency_window(),
            event_capacity: default_event_capacity(),
            health: HealthConfig::default(),
            unit: UnitConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn unit_start_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_start_timeout_ms)
    }

    pub fn max_queue_wait(&self) -> Option<Duration> {
        self.max_queue_wait_ms.map(Duration::from_millis)
    }

    /// Units created at startup.
    pub fn initial_units(&self) -> usize {
        if self.auto_scale {
            self.min_units
        } else {
            self.max_units
        }
    }

    /// Delay before the retry that follows `failed_attempts` failures:
    /// `base * 2^(failed_attempts - 1)`, capped at `backoff_max_ms`.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

// ── Section configs ─────────────────────────────────────────────────

/// Retry placement preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAffinity {
    /// Skip the unit the last attempt failed on when another one is eligible.
    #[default]
    PreferDifferent,
    /// Any eligible unit, including the one that just failed.
    Any,
}

/// Health monitor section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Period between probe rounds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// A probe without a pong after this long demotes the unit.
    #[serde(default = "default_probe_deadline_ms")]
    pub probe_deadline_ms: u64,

    /// Busy units are still probed during this window after assignment.
    #[serde(default = "default_busy_grace_ms")]
    pub busy_grace_ms: u64,

    /// Failure ratio above which a unit is demoted.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Outcomes needed before the failure ratio is trusted.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_probe_deadline_ms() -> u64 {
    5_000
}

fn default_busy_grace_ms() -> u64 {
    2_000
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_min_sample_size() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_deadline_ms: default_probe_deadline_ms(),
            busy_grace_ms: default_busy_grace_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            min_sample_size: default_min_sample_size(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_millis(self.probe_deadline_ms)
    }

    pub fn busy_grace(&self) -> Duration {
        Duration::from_millis(self.busy_grace_ms)
    }
}

/// Which execution unit implementation the pool spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// In-process stub running a handler on a tokio task.
    #[default]
    InProcess,
    /// Child process speaking the protocol on stdio.
    Process,
}

/// Execution unit section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitConfig {
    #[serde(default)]
    pub kind: UnitKind,

    /// Required when `kind = "process"`.
    #[serde(default)]
    pub process: Option<ProcessUnitConfig>,
}

/// Child process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessUnitConfig {
    /// Program to execute.
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment passed to the child.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub framing: Framing,
}
