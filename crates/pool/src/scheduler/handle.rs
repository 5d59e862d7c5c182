use std::sync::Arc;
use std::time::Duration;

use offload_protocol::{Capability, JobId};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::coordinator::{Command, Coordinator, PoolSnapshot};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::{EventBus, PoolEvent};
use crate::job::{CancelOutcome, JobOutput, JobRequest, JobTicket};
use crate::unit::{UnitFactory, UnitId};

/// Pending commands a handle may queue before `send` waits.
const COMMAND_BUFFER: usize = 256;

/// Handle to a running pool. Cheap to clone; every clone talks to the same
/// coordinator. The pool shuts down once [`Scheduler::shutdown`] is called
/// or the last handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::Sender<Command>,
    events: EventBus,
}

impl Scheduler {
    /// Validate `config`, create the initial units and start the coordinator.
    pub async fn start(
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
    ) -> Result<Self, PoolError> {
        let events = EventBus::new(config.event_capacity);
        Self::start_with_events(config, factory, events).await
    }

    /// Like [`start`](Self::start), publishing on a caller-provided bus so
    /// subscribers can see the startup events.
    pub async fn start_with_events(
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
        events: EventBus,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let (mut coordinator, inbox) = Coordinator::new(config, factory, events.clone());
        if let Err(e) = coordinator.warm_up().await {
            coordinator.shutdown().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(coordinator.run(rx, inbox));
        Ok(Self {
            commands: tx,
            events,
        })
    }

    /// Submit a job and get a ticket for its progress and outcome.
    ///
    /// Fails fast with `UnknownCapability` or `QueueFull`; everything else is
    /// reported through the ticket.
    pub async fn submit(&self, request: JobRequest) -> Result<JobTicket, PoolError> {
        let (responder, result) = oneshot::channel();
        let (progress, progress_rx) = mpsc::unbounded_channel();
        let id = self
            .call(|ack| Command::Submit {
                request,
                responder,
                progress,
                ack,
            })
            .await??;
        Ok(JobTicket::new(id, result, progress_rx))
    }

    /// Submit a job and wait for its outcome.
    pub async fn execute(&self, request: JobRequest) -> Result<JobOutput, PoolError> {
        self.submit(request).await?.wait().await
    }

    /// [`execute`](Self::execute) with the capability given by name.
    pub async fn execute_json(
        &self,
        payload: Value,
        capability: &str,
        priority: i32,
        timeout: Option<Duration>,
    ) -> Result<JobOutput, PoolError> {
        let capability: Capability = capability
            .parse()
            .map_err(|_| PoolError::UnknownCapability(capability.to_string()))?;
        let mut request = JobRequest::new(capability, payload).priority(priority);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.execute(request).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, PoolError> {
        self.call(|ack| Command::Cancel { job_id, ack }).await
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        self.call(|ack| Command::Snapshot { ack }).await
    }

    /// Terminate one unit. Returns `false` if the pool has no such unit.
    pub async fn terminate_unit(&self, unit: UnitId) -> Result<bool, PoolError> {
        self.call(|ack| Command::TerminateUnit { unit, ack }).await
    }

    /// Reject all outstanding jobs with `PoolShutdown` and stop every unit.
    /// Calling it on a pool that is already down is a no-op.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        match self.call(|ack| Command::Shutdown { ack }).await {
            Ok(()) | Err(PoolError::PoolShutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Whether the coordinator is still running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PoolError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(make(ack))
            .await
            .map_err(|_| PoolError::PoolShutdown)?;
        rx.await.map_err(|_| PoolError::PoolShutdown)
    }
}
