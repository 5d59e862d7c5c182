//! Execution units: the isolated workers jobs run on.
//!
//! The scheduler talks to every unit through [`ExecutionUnit`], a
//! request/response contract over the protocol messages. Two implementations
//! ship with the crate: [`InProcessUnit`] (handler on a tokio task) and
//! [`ProcessUnit`] (child process speaking the protocol on stdio). Which one
//! the pool spawns is decided by configuration.

mod driver;
mod factory;
mod in_process;
mod process;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use offload_protocol::{Capability, UnitReply, UnitRequest};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;

pub(crate) use driver::{start_unit, DriverCommand, DriverHandle, UnitEvent, UnitEventKind};
pub use factory::factory_from_config;
pub use in_process::{
    EchoHandler, HandlerError, HandlerOutput, InProcessFactory, InProcessUnit, JobContext,
    JobHandler, ProgressReporter,
};
pub use process::{ProcessFactory, ProcessUnit};

/// Scheduler-assigned unit identifier. Monotonic within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Routing status of a unit as reported in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Busy,
    /// Excluded from selection until a probe passes or the unit is replaced.
    Unhealthy,
}

/// One isolated worker.
///
/// A unit accepts at most one dispatch at a time and answers it with zero or
/// more `progress` replies followed by exactly one `result` or `error`. The
/// first reply after creation must be `ready`.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Deliver a request to the unit.
    async fn send(&mut self, request: UnitRequest) -> Result<(), UnitError>;

    /// Next reply. `Ok(None)` means the unit is gone. Must be cancel-safe:
    /// the driver polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<UnitReply>, UnitError>;

    /// Abandon the in-flight job, if any, and return to an idle state.
    async fn reset(&mut self) -> Result<(), UnitError>;

    /// Stop the unit and release its resources.
    async fn terminate(&mut self) -> Result<(), UnitError>;
}

/// Creates units on demand (pool start and scale-up).
#[async_trait]
pub trait UnitFactory: Send + Sync {
    async fn spawn(
        &self,
        id: UnitId,
        capability: Capability,
    ) -> Result<Box<dyn ExecutionUnit>, UnitError>;
}

/// Blanket implementation so `Arc<dyn UnitFactory>` can be used directly.
#[async_trait]
impl<T: UnitFactory + ?Sized> UnitFactory for Arc<T> {
    async fn spawn(
        &self,
        id: UnitId,
        capability: Capability,
    ) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        (**self).spawn(id, capability).await
    }
}
