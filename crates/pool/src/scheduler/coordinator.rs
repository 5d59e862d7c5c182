use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use offload_protocol::{Capability, JobId, Progress};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::balancer::{LoadBalancer, Strategy};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::{EventBus, PoolEvent, TerminationReason};
use crate::health::HealthPolicy;
use crate::job::{CancelOutcome, Job, JobOutput, JobRequest, JobResponder, JobState};
use crate::metrics::{PoolMetrics, UnitStats};
use crate::queue::JobQueue;
use crate::unit::{start_unit, DriverHandle, UnitEvent, UnitFactory, UnitId, UnitStatus};

/// Requests from [`Scheduler`](super::Scheduler) handles.
pub(super) enum Command {
    Submit {
        request: JobRequest,
        responder: JobResponder,
        progress: mpsc::UnboundedSender<Progress>,
        ack: oneshot::Sender<Result<JobId, PoolError>>,
    },
    Cancel {
        job_id: JobId,
        ack: oneshot::Sender<CancelOutcome>,
    },
    Snapshot {
        ack: oneshot::Sender<PoolSnapshot>,
    },
    TerminateUnit {
        unit: UnitId,
        ack: oneshot::Sender<bool>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Delayed self-addressed messages.
#[derive(Debug)]
pub(super) enum Timer {
    /// Execution budget of one attempt ran out.
    JobDeadline {
        job_id: JobId,
        unit: UnitId,
        attempt: u32,
    },
    /// Backoff before a retry elapsed.
    RetryDue { job_id: JobId },
    /// A ping went unanswered for the probe deadline.
    ProbeDeadline { unit: UnitId, seq: u64 },
}

pub(super) struct Inbox {
    unit_events: mpsc::UnboundedReceiver<UnitEvent>,
    timers: mpsc::UnboundedReceiver<Timer>,
}

/// Coordinator-side view of one unit.
pub(super) struct UnitRecord {
    pub(super) id: UnitId,
    /// Capability declared in the unit's `ready` handshake.
    pub(super) capability: Capability,
    pub(super) supported_modes: Vec<String>,
    pub(super) driver: DriverHandle,
    /// Exclusively owned while the unit is busy.
    pub(super) current: Option<Job>,
    pub(super) unhealthy: bool,
    /// Probe this unit on the next health round regardless of load.
    pub(super) needs_recheck: bool,
    /// Sequence number of the unanswered ping, if any.
    pub(super) pending_probe: Option<u64>,
    pub(super) probe_timer: Option<AbortHandle>,
    pub(super) stats: UnitStats,
}

impl UnitRecord {
    pub(super) fn status(&self) -> UnitStatus {
        if self.unhealthy {
            UnitStatus::Unhealthy
        } else if self.current.is_some() {
            UnitStatus::Busy
        } else {
            UnitStatus::Available
        }
    }

    /// Available and healthy.
    pub(super) fn is_eligible(&self) -> bool {
        self.current.is_none() && !self.unhealthy
    }

    pub(super) fn holds(&self, job_id: JobId) -> bool {
        self.current.as_ref().is_some_and(|job| job.id == job_id)
    }

    pub(super) fn clear_probe(&mut self) {
        self.pending_probe = None;
        if let Some(timer) = self.probe_timer.take() {
            timer.abort();
        }
    }
}

struct Waiter {
    responder: JobResponder,
    progress: mpsc::UnboundedSender<Progress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub capability: Capability,
    pub status: UnitStatus,
    pub current_job: Option<JobId>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_latency_ms: f64,
    pub recent_latency_ms: f64,
    pub idle_ms: u64,
    /// Wall-clock time of the last assignment or outcome.
    pub last_used_at: DateTime<Utc>,
    pub supported_modes: Vec<String>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub strategy: Strategy,
    pub units: Vec<UnitSnapshot>,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub backing_off: usize,
    pub metrics: PoolMetrics,
}

impl PoolSnapshot {
    pub fn unit(&self, id: UnitId) -> Option<&UnitSnapshot> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }
}

/// Grace given to each unit to stop during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lower bound on the queue-wait check period.
const MIN_QUEUE_WAIT_TICK: Duration = Duration::from_millis(10);

pub(super) struct Coordinator {
    pub(super) config: PoolConfig,
    factory: Arc<dyn UnitFactory>,
    pub(super) balancer: LoadBalancer,
    pub(super) health: HealthPolicy,
    pub(super) events: EventBus,
    pub(super) metrics: PoolMetrics,
    pub(super) units: BTreeMap<UnitId, UnitRecord>,
    pub(super) queue: JobQueue,
    /// Failed jobs waiting out their retry backoff.
    pub(super) backing_off: HashMap<JobId, Job>,
    waiters: HashMap<JobId, Waiter>,
    next_job: u64,
    next_unit: u64,
    pub(super) probe_seq: u64,
    unit_events_tx: mpsc::UnboundedSender<UnitEvent>,
    timers_tx: mpsc::UnboundedSender<Timer>,
}

impl Coordinator {
    pub(super) fn new(
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
        events: EventBus,
    ) -> (Self, Inbox) {
        let (unit_events_tx, unit_events) = mpsc::unbounded_channel();
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let coordinator = Self {
            balancer: LoadBalancer::new(config.strategy),
            health: HealthPolicy::from_config(&config.health),
            queue: JobQueue::new(config.max_queue_size),
            config,
            factory,
            events,
            metrics: PoolMetrics::default(),
            units: BTreeMap::new(),
            backing_off: HashMap::new(),
            waiters: HashMap::new(),
            next_job: 1,
            next_unit: 1,
            probe_seq: 0,
            unit_events_tx,
            timers_tx,
        };
        (coordinator, Inbox { unit_events, timers })
    }

    /// Create the initial units. Fails if any of them cannot start.
    pub(super) async fn warm_up(&mut self) -> Result<(), PoolError> {
        let count = self.config.initial_units();
        for _ in 0..count {
            self.spawn_unit(self.config.warm_capability).await?;
        }
        info!(
            units = count,
            strategy = %self.config.strategy,
            max_units = self.config.max_units,
            auto_scale = self.config.auto_scale,
            "pool created"
        );
        self.events.publish(PoolEvent::PoolCreated { units: count });
        Ok(())
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbox: Inbox) {
        let mut health = ticker(self.health.interval);
        let mut sweep = ticker(self.config.idle_sweep_interval());
        let mut queue_wait = self
            .config
            .max_queue_wait()
            .map(|wait| ticker((wait / 4).max(MIN_QUEUE_WAIT_TICK)));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all scheduler handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = inbox.unit_events.recv() => self.on_unit_event(event).await,
                Some(timer) = inbox.timers.recv() => self.on_timer(timer).await,
                _ = health.tick() => self.probe_units(),
                _ = sweep.tick() => {
                    self.sweep_idle(true);
                    self.restore_size(self.config.warm_capability).await;
                }
                _ = tick_optional(&mut queue_wait) => self.expire_queued(),
            }
        }
        debug!("coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                request,
                responder,
                progress,
                ack,
            } => {
                let result = self.submit(request, responder, progress).await;
                let _ = ack.send(result);
            }
            Command::Cancel { job_id, ack } => {
                let outcome = self.cancel(job_id);
                let _ = ack.send(outcome);
            }
            Command::Snapshot { ack } => {
                let _ = ack.send(self.snapshot());
            }
            Command::TerminateUnit { unit, ack } => {
                let found = self.terminate_unit(unit).await;
                let _ = ack.send(found);
            }
            // intercepted by the event loop
            Command::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::JobDeadline {
                job_id,
                unit,
                attempt,
            } => self.on_job_deadline(job_id, unit, attempt).await,
            Timer::RetryDue { job_id } => self.on_retry_due(job_id).await,
            Timer::ProbeDeadline { unit, seq } => self.on_probe_deadline(unit, seq),
        }
    }

    async fn submit(
        &mut self,
        request: JobRequest,
        responder: JobResponder,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> Result<JobId, PoolError> {
        if !self.config.capabilities.contains(&request.capability) {
            self.metrics.jobs_rejected += 1;
            warn!(capability = %request.capability, "rejecting job for unserved capability");
            return Err(PoolError::UnknownCapability(request.capability.to_string()));
        }
        if self.queue.is_full() {
            self.metrics.jobs_rejected += 1;
            warn!(capacity = self.queue.capacity(), "queue full, rejecting job");
            return Err(PoolError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let id = JobId(self.next_job);
        self.next_job += 1;
        let job = Job::new(
            id,
            request,
            self.config.default_timeout(),
            self.config.default_retry_budget,
        );
        debug!(
            job_id = %id,
            capability = %job.capability,
            priority = job.priority,
            "job submitted"
        );
        self.waiters.insert(
            id,
            Waiter {
                responder,
                progress,
            },
        );
        self.metrics.jobs_submitted += 1;

        // Queued jobs go first; a newcomer only skips the queue when it is empty.
        let job = if self.queue.is_empty() {
            match self.try_place(job).await {
                Ok(()) => return Ok(id),
                Err(job) => job,
            }
        } else {
            job
        };

        match self.queue.push(job) {
            Ok(()) => {
                let queue_depth = self.queue.len();
                debug!(job_id = %id, queue_depth, "job queued");
                self.events.publish(PoolEvent::JobQueued {
                    job_id: id,
                    queue_depth,
                });
                Ok(id)
            }
            Err(_) => {
                self.waiters.remove(&id);
                self.metrics.jobs_rejected += 1;
                warn!(job_id = %id, capacity = self.queue.capacity(), "queue full, rejecting job");
                Err(PoolError::QueueFull {
                    capacity: self.queue.capacity(),
                })
            }
        }
    }

    /// Deliver the terminal outcome of a job to its caller.
    pub(super) fn resolve(&mut self, mut job: Job, outcome: Result<JobOutput, PoolError>) {
        job.cancel_timer();
        match &outcome {
            Ok(out) => {
                job.state = JobState::Completed;
                self.metrics.record_completion(out.latency);
                info!(
                    job_id = %job.id,
                    unit_id = %out.unit,
                    attempts = out.attempts,
                    latency_ms = out.latency.as_millis() as u64,
                    "job completed"
                );
                self.events.publish(PoolEvent::JobCompleted {
                    job_id: job.id,
                    unit: out.unit,
                    attempts: out.attempts,
                    latency_ms: out.latency.as_millis() as u64,
                });
            }
            Err(PoolError::Cancelled(_)) => {
                job.state = JobState::Cancelled;
                self.metrics.jobs_cancelled += 1;
                info!(job_id = %job.id, "job cancelled");
                self.events.publish(PoolEvent::JobCancelled { job_id: job.id });
            }
            Err(PoolError::Timeout { .. }) => {
                job.state = JobState::TimedOut;
                self.metrics.jobs_timed_out += 1;
            }
            Err(e) => {
                job.state = JobState::Failed;
                self.metrics.jobs_failed += 1;
                warn!(job_id = %job.id, attempts = job.attempt, error = %e, "job failed");
                self.events.publish(PoolEvent::JobFailed {
                    job_id: job.id,
                    error: e.to_string(),
                });
            }
        }
        debug_assert!(job.state.is_terminal());
        if let Some(waiter) = self.waiters.remove(&job.id) {
            if waiter.responder.send(outcome).is_err() {
                debug!(job_id = %job.id, "caller stopped waiting");
            }
        }
    }

    /// Forward a progress notification to the job's caller.
    pub(super) fn forward_progress(&self, progress: Progress) {
        if let Some(waiter) = self.waiters.get(&progress.job_id) {
            let _ = waiter.progress.send(progress);
        }
    }

    /// Deliver `timer` back to the event loop after `after`. Aborting the
    /// returned handle drops it.
    pub(super) fn schedule(&self, after: Duration, timer: Timer) -> AbortHandle {
        let tx = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        })
        .abort_handle()
    }

    /// Start a unit and add it to the pool.
    pub(super) async fn spawn_unit(
        &mut self,
        capability: Capability,
    ) -> Result<UnitId, PoolError> {
        let id = UnitId(self.next_unit);
        self.next_unit += 1;

        let (driver, ready) = start_unit(
            Arc::clone(&self.factory),
            id,
            capability,
            self.config.unit_start_timeout(),
            self.unit_events_tx.clone(),
        )
        .await?;

        if ready.capability != capability {
            debug!(
                unit_id = %id,
                requested = %capability,
                declared = %ready.capability,
                "unit declared another capability"
            );
        }
        self.units.insert(
            id,
            UnitRecord {
                id,
                capability: ready.capability,
                supported_modes: ready.supported_modes,
                driver,
                current: None,
                unhealthy: false,
                needs_recheck: false,
                pending_probe: None,
                probe_timer: None,
                stats: UnitStats::new(self.config.latency_window),
            },
        );
        self.metrics.observe_units(self.units.len());
        info!(
            unit_id = %id,
            capability = %ready.capability,
            units = self.units.len(),
            "unit created"
        );
        self.events.publish(PoolEvent::UnitCreated {
            unit: id,
            capability: ready.capability,
        });
        Ok(id)
    }

    /// Remove a unit from the pool and stop it. The caller deals with any
    /// job the unit still holds.
    pub(super) fn retire(
        &mut self,
        unit: UnitId,
        reason: TerminationReason,
    ) -> Option<UnitRecord> {
        let mut record = self.units.remove(&unit)?;
        record.clear_probe();
        record.driver.terminate();
        info!(unit_id = %unit, ?reason, units = self.units.len(), "unit terminated");
        self.events.publish(PoolEvent::UnitTerminated { unit, reason });
        Some(record)
    }

    pub(super) fn eligible_count(&self) -> usize {
        self.units.values().filter(|u| u.is_eligible()).count()
    }

    fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let wall_now = Utc::now();
        let units: Vec<_> = self
            .units
            .values()
            .map(|u| UnitSnapshot {
                id: u.id,
                capability: u.capability,
                status: u.status(),
                current_job: u.current.as_ref().map(|j| j.id),
                jobs_completed: u.stats.jobs_completed,
                jobs_failed: u.stats.jobs_failed,
                average_latency_ms: u.stats.average_latency.as_secs_f64() * 1000.0,
                recent_latency_ms: u.stats.recent_average_latency().as_secs_f64() * 1000.0,
                idle_ms: if u.current.is_some() {
                    0
                } else {
                    u.stats.idle_for(now).as_millis() as u64
                },
                last_used_at: wall_now
                    - chrono::Duration::from_std(u.stats.idle_for(now))
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                supported_modes: u.supported_modes.clone(),
            })
            .collect();
        let in_flight = units.iter().filter(|u| u.current_job.is_some()).count();

        let mut metrics = self.metrics.clone();
        metrics.queue_depth = self.queue.len();
        metrics.in_flight = in_flight;

        PoolSnapshot {
            strategy: self.balancer.strategy(),
            units,
            queue_depth: self.queue.len(),
            in_flight,
            backing_off: self.backing_off.len(),
            metrics,
        }
    }

    /// Reject everything outstanding and stop every unit.
    pub(super) async fn shutdown(&mut self) {
        info!(
            units = self.units.len(),
            queued = self.queue.len(),
            "shutting down pool"
        );

        let mut orphans = self.queue.drain();
        orphans.extend(self.backing_off.drain().map(|(_, job)| job));

        let mut drivers = Vec::with_capacity(self.units.len());
        for (id, mut record) in std::mem::take(&mut self.units) {
            record.clear_probe();
            if let Some(job) = record.current.take() {
                orphans.push(job);
            }
            self.events.publish(PoolEvent::UnitTerminated {
                unit: id,
                reason: TerminationReason::Shutdown,
            });
            drivers.push(record.driver);
        }

        for job in orphans {
            self.resolve(job, Err(PoolError::PoolShutdown));
        }
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.responder.send(Err(PoolError::PoolShutdown));
        }

        futures::future::join_all(drivers.into_iter().map(|d| d.shutdown(SHUTDOWN_GRACE))).await;
        self.events.publish(PoolEvent::PoolShutdown);
        info!("pool shut down");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
