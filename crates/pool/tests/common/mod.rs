//! Shared handlers and config for the scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offload_pool::{
    Capability, EchoHandler, ExecutionUnit, HandlerError, HandlerOutput, InProcessFactory,
    InProcessUnit, JobContext, JobHandler, PoolConfig, PoolEvent, Scheduler, UnitError,
    UnitFactory, UnitId,
};
use offload_protocol::{ProtocolError, UnitReply, UnitRequest};
use tokio::sync::{broadcast, Semaphore};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Pool config with fast backoff and maintenance loops that stay out of the
/// way unless a test shortens them.
pub fn config(min_units: usize, max_units: usize) -> PoolConfig {
    let mut config = PoolConfig {
        min_units,
        max_units,
        default_timeout_ms: 5_000,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        max_idle_time_ms: 60_000,
        idle_sweep_interval_ms: 60_000,
        unit_start_timeout_ms: 1_000,
        ..PoolConfig::default()
    };
    config.health.interval_ms = 60_000;
    config
}

/// A fixed pool of `units` units.
pub fn fixed(units: usize) -> PoolConfig {
    PoolConfig {
        auto_scale: false,
        ..config(units, units)
    }
}

/// Start a pool of in-process units sharing `handler`.
pub async fn start<H: JobHandler>(config: PoolConfig, handler: Arc<H>) -> Scheduler {
    Scheduler::start(config, Arc::new(InProcessFactory::new(handler)))
        .await
        .expect("pool should start")
}

/// Wait until an event matching `pred` arrives.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PoolEvent>,
    pred: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

/// Sleeps, and flags any unit that is handed a second job while busy.
#[derive(Default)]
pub struct Exclusive {
    pub delay: Duration,
    active: Mutex<HashSet<UnitId>>,
    pub overlapped: AtomicBool,
}

impl Exclusive {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobHandler for Exclusive {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        if !self.active.lock().unwrap().insert(ctx.unit) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.active.lock().unwrap().remove(&ctx.unit);
        Ok(HandlerOutput::new(ctx.payload))
    }
}

/// Fails the first `failures` calls, then echoes the payload. Remembers the
/// unit of every failed call.
pub struct FailFirst {
    failures: u32,
    pub calls: AtomicU32,
    pub failed_on: Mutex<Vec<UnitId>>,
}

impl FailFirst {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            failed_on: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobHandler for FailFirst {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            self.failed_on.lock().unwrap().push(ctx.unit);
            return Err(HandlerError::new(format!("transient failure {}", call + 1)));
        }
        Ok(HandlerOutput::new(ctx.payload))
    }
}

/// Holds every job until the test adds permits.
pub struct Gate {
    pub permits: Arc<Semaphore>,
    pub started: Arc<Semaphore>,
    pub order: Mutex<Vec<serde_json::Value>>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            started: Arc::new(Semaphore::new(0)),
            order: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobHandler for Gate {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        self.order.lock().unwrap().push(ctx.payload.clone());
        self.started.add_permits(1);
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HandlerError::new("gate closed"))?;
        permit.forget();
        Ok(HandlerOutput::new(ctx.payload))
    }
}

/// Hangs on the first `stalls` calls, echoes afterwards.
pub struct StallFirst {
    stalls: u32,
    calls: AtomicU32,
}

impl StallFirst {
    pub fn new(stalls: u32) -> Self {
        Self {
            stalls,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for StallFirst {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.stalls {
            std::future::pending::<()>().await;
        }
        Ok(HandlerOutput::new(ctx.payload))
    }
}

/// How a [`Faulty`] unit breaks the protocol.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Swallow the first dispatch and answer it with an undecodable reply.
    GarbleFirstDispatch,
    /// Never answer a ping.
    IgnorePings,
}

/// Echo unit with a scripted protocol fault.
pub struct Faulty {
    inner: InProcessUnit,
    fault: Fault,
    dispatched: bool,
    garbage_due: bool,
}

#[async_trait]
impl ExecutionUnit for Faulty {
    async fn send(&mut self, request: UnitRequest) -> Result<(), UnitError> {
        match self.fault {
            Fault::GarbleFirstDispatch if !self.dispatched && request.as_dispatch().is_some() => {
                self.dispatched = true;
                self.garbage_due = true;
                Ok(())
            }
            Fault::IgnorePings if matches!(request, UnitRequest::Ping) => Ok(()),
            _ => self.inner.send(request).await,
        }
    }

    async fn recv(&mut self) -> Result<Option<UnitReply>, UnitError> {
        if self.garbage_due {
            self.garbage_due = false;
            return Err(UnitError::Protocol(ProtocolError::Malformed {
                kind: "result".into(),
                reason: "missing field `output`".into(),
            }));
        }
        self.inner.recv().await
    }

    async fn reset(&mut self) -> Result<(), UnitError> {
        self.inner.reset().await
    }

    async fn terminate(&mut self) -> Result<(), UnitError> {
        self.inner.terminate().await
    }
}

/// Spawns echo units; only the first one carries `fault`.
pub struct FaultyFirst {
    fault: Fault,
    spawned: AtomicU32,
}

impl FaultyFirst {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            spawned: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl UnitFactory for FaultyFirst {
    async fn spawn(
        &self,
        id: UnitId,
        capability: Capability,
    ) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        let inner = InProcessUnit::new(id, capability, Arc::new(EchoHandler));
        if self.spawned.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(Box::new(inner));
        }
        Ok(Box::new(Faulty {
            inner,
            fault: self.fault,
            dispatched: false,
            garbage_due: false,
        }))
    }
}
