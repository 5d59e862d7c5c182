use std::time::Duration;

use offload_protocol::{JobId, ProtocolError};
use thiserror::Error;

/// Errors surfaced to callers of the [`Scheduler`](crate::Scheduler).
#[derive(Debug, Error)]
pub enum PoolError {
    /// The job asked for a capability this pool does not serve. Never retried.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// Backpressure: the pending queue is at capacity. Try again later.
    #[error("job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The attempt ran longer than its execution budget; the unit was reset.
    #[error("{job_id} timed out after {after:?}")]
    Timeout { job_id: JobId, after: Duration },

    /// The collaborator reported a failure, crashed, or answered garbage.
    #[error("{job_id} failed on its execution unit: {message}")]
    UnitExecution { job_id: JobId, message: String },

    /// Terminal: every allowed attempt failed. Wraps the last failure.
    #[error("{job_id} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        job_id: JobId,
        attempts: u32,
        last: Box<PoolError>,
    },

    /// The pool is shutting down or already gone.
    #[error("pool is shut down")]
    PoolShutdown,

    #[error("{0} was cancelled")]
    Cancelled(JobId),

    /// The job sat in the queue longer than the configured wait cap.
    #[error("{job_id} waited {waited:?} in the queue without being assigned")]
    QueueWaitExceeded { job_id: JobId, waited: Duration },

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// An execution unit could not be brought up.
    #[error("unit start failed: {0}")]
    UnitStart(#[from] UnitError),
}

impl PoolError {
    /// Whether the retry policy may try the job again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::UnitExecution { .. })
    }
}

/// Errors raised by [`ExecutionUnit`](crate::unit::ExecutionUnit) implementations.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The unit sent something that is not a valid protocol message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A second dispatch arrived while a job was still running.
    #[error("unit is already running {0}")]
    Busy(JobId),

    /// The startup handshake did not produce a `ready` message in time.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unit has exited")]
    Closed,
}

impl UnitError {
    /// The unit can no longer be talked to.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UnitError::Io(_) | UnitError::Closed | UnitError::Protocol(ProtocolError::Io(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unit_execution_errors_are_retryable() {
        let job_id = JobId(1);
        assert!(PoolError::UnitExecution {
            job_id,
            message: "x".into()
        }
        .is_retryable());
        assert!(!PoolError::Timeout {
            job_id,
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!PoolError::UnknownCapability("x".into()).is_retryable());
        assert!(!PoolError::QueueFull { capacity: 1 }.is_retryable());
    }

    #[test]
    fn exhausted_message_includes_attempts_and_cause() {
        let err = PoolError::RetriesExhausted {
            job_id: JobId(4),
            attempts: 3,
            last: Box::new(PoolError::UnitExecution {
                job_id: JobId(4),
                message: "bad header".into(),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt(s)"), "{text}");
        assert!(text.contains("bad header"), "{text}");
    }
}
