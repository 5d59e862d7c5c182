//! In-process execution unit.
//!
//! Runs a [`JobHandler`] on a tokio task per dispatch. This is the stub the
//! pool uses when no external worker binary is configured, and the easiest
//! way to plug a collaborator written in Rust into the pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use offload_protocol::{
    Capability, JobFailure, JobId, JobResult, Progress, Ready, UnitReply, UnitRequest,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ExecutionUnit, UnitFactory, UnitId};
use crate::error::UnitError;

/// Message a handler fails with. Becomes the `error` reply.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a handler produces on success.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub output: Value,
    pub metadata: Value,
}

impl HandlerOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sends `progress` replies for one job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    tx: mpsc::UnboundedSender<UnitReply>,
}

impl ProgressReporter {
    pub fn report(&self, current: u64, total: u64) {
        self.send(current, total, None);
    }

    pub fn report_with(&self, current: u64, total: u64, message: impl Into<String>) {
        self.send(current, total, Some(message.into()));
    }

    fn send(&self, current: u64, total: u64, message: Option<String>) {
        let _ = self.tx.send(UnitReply::Progress(Progress {
            job_id: self.job_id,
            current,
            total,
            message,
        }));
    }
}

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub capability: Capability,
    pub unit: UnitId,
    pub payload: Value,
    pub settings: Value,
    pub progress: ProgressReporter,
}

/// The collaborator that actually does conversion, validation or export.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError>;

    /// Modes announced in the `ready` handshake.
    fn supported_modes(&self, _capability: Capability) -> Vec<String> {
        Vec::new()
    }
}

/// Returns the payload untouched, with the capability and unit as metadata.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        ctx.progress.report(0, 1);
        let metadata = json!({
            "capability": ctx.capability,
            "unit": ctx.unit,
            "settings": ctx.settings,
        });
        ctx.progress.report(1, 1);
        Ok(HandlerOutput::new(ctx.payload).with_metadata(metadata))
    }

    fn supported_modes(&self, _capability: Capability) -> Vec<String> {
        vec!["echo".to_string()]
    }
}

struct Running {
    job_id: JobId,
    /// Set by the job task right before it sends its terminal reply.
    done: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct InProcessUnit {
    id: UnitId,
    handler: Arc<dyn JobHandler>,
    tx: mpsc::UnboundedSender<UnitReply>,
    rx: mpsc::UnboundedReceiver<UnitReply>,
    running: Option<Running>,
    closed: bool,
}

impl InProcessUnit {
    /// Create the unit. The `ready` handshake is queued immediately.
    pub fn new(id: UnitId, capability: Capability, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(UnitReply::Ready(Ready {
            capability,
            supported_modes: handler.supported_modes(capability),
        }));
        Self {
            id,
            handler,
            tx,
            rx,
            running: None,
            closed: false,
        }
    }

    fn busy_with(&self) -> Option<JobId> {
        self.running
            .as_ref()
            .filter(|r| !r.done.load(Ordering::Acquire) && !r.task.is_finished())
            .map(|r| r.job_id)
    }

    fn abort_running(&mut self) -> Option<JobId> {
        self.running.take().map(|r| {
            r.task.abort();
            r.job_id
        })
    }

    fn start(&mut self, capability: Capability, dispatch: offload_protocol::Dispatch) {
        let job_id = dispatch.job_id;
        let ctx = JobContext {
            job_id,
            capability,
            unit: self.id,
            payload: dispatch.payload,
            settings: dispatch.settings,
            progress: ProgressReporter {
                job_id,
                tx: self.tx.clone(),
            },
        };
        let handler = Arc::clone(&self.handler);
        let tx = self.tx.clone();
        let done = Arc::new(AtomicBool::new(false));
        let finished = Arc::clone(&done);

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(out)) => UnitReply::Result(JobResult {
                    job_id,
                    output: out.output,
                    metadata: out.metadata,
                }),
                Ok(Err(e)) => UnitReply::Error(JobFailure {
                    job_id,
                    message: e.to_string(),
                }),
                Err(_) => UnitReply::Error(JobFailure {
                    job_id,
                    message: "handler panicked".to_string(),
                }),
            };
            finished.store(true, Ordering::Release);
            let _ = tx.send(reply);
        });

        self.running = Some(Running { job_id, done, task });
    }
}

#[async_trait]
impl ExecutionUnit for InProcessUnit {
    async fn send(&mut self, request: UnitRequest) -> Result<(), UnitError> {
        if self.closed {
            return Err(UnitError::Closed);
        }
        match request {
            UnitRequest::Ping => {
                let _ = self.tx.send(UnitReply::pong());
            }
            UnitRequest::Cancel { job_id } => {
                if self.busy_with() == Some(job_id) {
                    self.abort_running();
                    debug!(unit_id = %self.id, job_id = %job_id, "job aborted on cancel");
                    let _ = self.tx.send(UnitReply::Error(JobFailure {
                        job_id,
                        message: "cancelled".to_string(),
                    }));
                }
            }
            other => {
                if let Some(current) = self.busy_with() {
                    return Err(UnitError::Busy(current));
                }
                if let Some((capability, dispatch)) = other.as_dispatch() {
                    let dispatch = dispatch.clone();
                    self.start(capability, dispatch);
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<UnitReply>, UnitError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rx.recv().await)
    }

    async fn reset(&mut self) -> Result<(), UnitError> {
        if let Some(job_id) = self.abort_running() {
            debug!(unit_id = %self.id, job_id = %job_id, "job abandoned on reset");
        }
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), UnitError> {
        self.abort_running();
        self.closed = true;
        Ok(())
    }
}

/// Spawns [`InProcessUnit`]s sharing one handler.
#[derive(Clone)]
pub struct InProcessFactory {
    handler: Arc<dyn JobHandler>,
}

impl InProcessFactory {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self { handler }
    }
}

impl Default for InProcessFactory {
    fn default() -> Self {
        Self::new(Arc::new(EchoHandler))
    }
}

#[async_trait]
impl UnitFactory for InProcessFactory {
    async fn spawn(
        &self,
        id: UnitId,
        capability: Capability,
    ) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        Ok(Box::new(InProcessUnit::new(
            id,
            capability,
            Arc::clone(&self.handler),
        )))
    }
}
