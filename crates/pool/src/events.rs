//! Pool state changes broadcast to observers.

use offload_protocol::{Capability, JobId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::unit::UnitId;

/// Why a unit left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Idle past `max_idle_time`.
    Idle,
    /// Reclaimed while unhealthy.
    Unhealthy,
    /// Asked for through `Scheduler::terminate_unit`.
    Requested,
    /// The unit went away on its own.
    Exited,
    Shutdown,
}

/// Why a unit was demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    ProbeMissed,
    ErrorRate,
    Timeout,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    PoolCreated {
        units: usize,
    },
    UnitCreated {
        unit: UnitId,
        capability: Capability,
    },
    UnitTerminated {
        unit: UnitId,
        reason: TerminationReason,
    },
    UnitUnhealthy {
        unit: UnitId,
        reason: UnhealthyReason,
    },
    UnitRecovered {
        unit: UnitId,
    },
    JobQueued {
        job_id: JobId,
        queue_depth: usize,
    },
    JobAssigned {
        job_id: JobId,
        unit: UnitId,
        attempt: u32,
    },
    JobProgress {
        job_id: JobId,
        current: u64,
        total: u64,
    },
    JobCompleted {
        job_id: JobId,
        unit: UnitId,
        attempts: u32,
        latency_ms: u64,
    },
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },
    JobTimedOut {
        job_id: JobId,
        unit: UnitId,
    },
    JobCancelled {
        job_id: JobId,
    },
    ScaledUp {
        unit: UnitId,
        units: usize,
    },
    ScaledDown {
        unit: UnitId,
        units: usize,
    },
    PoolShutdown,
}

/// Broadcast sender wrapper. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}
