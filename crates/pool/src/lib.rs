//! Job-dispatch scheduler for a pool of execution units.
//!
//! A [`Scheduler`] owns a set of execution units and a bounded priority
//! queue. Jobs are bound to units by a [`LoadBalancer`] strategy, retried
//! with exponential backoff on unit failures, and timed out per attempt.
//! The pool grows on demand up to `max_units`, shrinks back toward
//! `min_units` when idle, and demotes units that miss health probes or fail
//! too often. State changes are broadcast as [`PoolEvent`]s.
//!
//! ```no_run
//! # async fn demo() -> Result<(), offload_pool::PoolError> {
//! use std::sync::Arc;
//! use offload_pool::{Capability, InProcessFactory, JobRequest, PoolConfig, Scheduler};
//!
//! let factory = Arc::new(InProcessFactory::default());
//! let pool = Scheduler::start(PoolConfig::default(), factory).await?;
//! let out = pool
//!     .execute(JobRequest::new(Capability::Conversion, serde_json::json!({"text": "a;b"})))
//!     .await?;
//! println!("{} after {} attempt(s)", out.output, out.attempts);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod autoscale;
pub mod balancer;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod unit;

pub use balancer::{Candidate, LoadBalancer, Strategy};
pub use config::{HealthConfig, PoolConfig, ProcessUnitConfig, RetryAffinity, UnitConfig, UnitKind};
pub use error::{PoolError, UnitError};
pub use events::{EventBus, PoolEvent, TerminationReason, UnhealthyReason};
pub use job::{CancelOutcome, JobOutput, JobRequest, JobState, JobTicket};
pub use metrics::PoolMetrics;
pub use scheduler::{PoolSnapshot, Scheduler, UnitSnapshot};
pub use unit::{
    factory_from_config, EchoHandler, ExecutionUnit, HandlerError, HandlerOutput, InProcessFactory,
    InProcessUnit, JobContext, JobHandler, ProcessFactory, ProcessUnit, ProgressReporter,
    UnitFactory, UnitId, UnitStatus,
};

pub use offload_protocol::{Capability, JobId};
