//! Job records, caller-facing requests and results.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use offload_protocol::{Capability, Dispatch, JobId, Progress, UnitRequest};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::PoolError;
use crate::unit::UnitId;

/// Lifecycle of a job inside the scheduler.
///
/// `Pending → Assigned → Running → {Completed | Retrying → Assigned | Failed | TimedOut}`,
/// with `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    Running,
    Completed,
    Retrying,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }
}

/// A job owned by the coordinator from submission to resolution.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub capability: Capability,
    pub payload: Value,
    pub settings: Value,
    /// Higher runs sooner among queued jobs.
    pub priority: i32,
    /// Execution budget per attempt, counted from assignment.
    pub timeout: Duration,
    /// Maximum attempts, first try included.
    pub retry_budget: u32,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: Instant,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    /// Unit the most recent attempt ran on.
    pub last_unit: Option<UnitId>,
    /// Start of the current stay in the queue.
    pub queued_at: Option<Instant>,
    /// Start of the current attempt.
    pub assigned_at: Option<Instant>,
    /// A cancel signal was sent while the job was running.
    pub cancel_requested: bool,
    /// Pending deadline or backoff timer.
    pub(crate) timer: Option<AbortHandle>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        request: JobRequest,
        default_timeout: Duration,
        default_budget: u32,
    ) -> Self {
        Self {
            id,
            capability: request.capability,
            payload: request.payload,
            settings: request.settings,
            priority: request.priority,
            timeout: request.timeout.unwrap_or(default_timeout),
            retry_budget: request.retry_budget.unwrap_or(default_budget).max(1),
            attempt: 0,
            created_at: Instant::now(),
            submitted_at: Utc::now(),
            state: JobState::Pending,
            last_unit: None,
            queued_at: None,
            assigned_at: None,
            cancel_requested: false,
            timer: None,
        }
    }

    /// Drop the pending timer, if any.
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// The dispatch message for the current attempt.
    pub fn dispatch(&self) -> UnitRequest {
        UnitRequest::dispatch(
            self.capability,
            Dispatch::new(self.id, self.payload.clone(), self.settings.clone()),
        )
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.retry_budget
    }
}

/// What a caller asks the pool to run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub capability: Capability,
    pub payload: Value,
    pub settings: Value,
    pub priority: i32,
    /// `None` falls back to the pool's `default_timeout_ms`.
    pub timeout: Option<Duration>,
    /// `None` falls back to the pool's `default_retry_budget`.
    pub retry_budget: Option<u32>,
}

impl JobRequest {
    pub fn new(capability: Capability, payload: Value) -> Self {
        Self {
            capability,
            payload,
            settings: Value::Null,
            priority: 0,
            timeout: None,
            retry_budget: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_budget(mut self, attempts: u32) -> Self {
        self.retry_budget = Some(attempts);
        self
    }

    pub fn settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }
}

/// Successful job resolution.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub job_id: JobId,
    pub output: Value,
    pub metadata: Value,
    /// Attempts it took, the successful one included.
    pub attempts: u32,
    /// Unit that produced the result.
    pub unit: UnitId,
    /// Assignment-to-result time of the successful attempt.
    #[serde(serialize_with = "crate::metrics::serialize_millis")]
    pub latency: Duration,
}

pub(crate) type JobResponder = oneshot::Sender<Result<JobOutput, PoolError>>;

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    result: oneshot::Receiver<Result<JobOutput, PoolError>>,
    progress: mpsc::UnboundedReceiver<Progress>,
}

impl JobTicket {
    pub(crate) fn new(
        id: JobId,
        result: oneshot::Receiver<Result<JobOutput, PoolError>>,
        progress: mpsc::UnboundedReceiver<Progress>,
    ) -> Self {
        Self {
            id,
            result,
            progress,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Progress notifications forwarded from the unit, in arrival order.
    pub fn progress(&mut self) -> &mut mpsc::UnboundedReceiver<Progress> {
        &mut self.progress
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<JobOutput, PoolError> {
        self.result.await.unwrap_or(Err(PoolError::PoolShutdown))
    }
}

/// Result of [`Scheduler::cancel`](crate::Scheduler::cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed before assignment; the caller got `Cancelled`.
    Dequeued,
    /// Running: a cancel signal went to the unit and the caller gets
    /// `Cancelled` on the next observation of the job.
    Signalled,
    /// Unknown or already resolved.
    NotFound,
}
