use std::time::{Duration, Instant};

use offload_protocol::{JobFailure, JobId, JobResult, Progress, UnitReply};
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, Timer};
use crate::error::PoolError;
use crate::events::{PoolEvent, TerminationReason, UnhealthyReason};
use crate::job::{Job, JobOutput, JobState};
use crate::unit::{DriverCommand, UnitEvent, UnitEventKind, UnitId};

impl Coordinator {
    pub(super) async fn on_unit_event(&mut self, event: UnitEvent) {
        let UnitEvent { unit, kind } = event;
        if !self.units.contains_key(&unit) {
            debug!(unit_id = %unit, ?kind, "event from retired unit");
            return;
        }
        match kind {
            UnitEventKind::Reply(UnitReply::Ready(_)) => {
                debug!(unit_id = %unit, "unit announced itself again");
            }
            UnitEventKind::Reply(UnitReply::Pong { .. }) => self.on_pong(unit).await,
            UnitEventKind::Reply(UnitReply::Progress(progress)) => {
                self.on_progress(unit, progress)
            }
            UnitEventKind::Reply(UnitReply::Result(result)) => self.on_result(unit, result).await,
            UnitEventKind::Reply(UnitReply::Error(failure)) => self.on_error(unit, failure).await,
            UnitEventKind::Malformed(reason) => self.on_malformed(unit, reason).await,
            UnitEventKind::Exited => self.on_exited(unit).await,
        }
    }

    /// Take the job `unit` holds if it is `job_id`, with the attempt latency.
    fn take_job(&mut self, unit: UnitId, job_id: JobId) -> Option<(Job, Duration)> {
        let record = self.units.get_mut(&unit)?;
        if !record.holds(job_id) {
            debug!(unit_id = %unit, job_id = %job_id, "stale reply ignored");
            return None;
        }
        let mut job = record.current.take()?;
        job.cancel_timer();
        record.stats.last_used_at = Instant::now();
        let latency = job.assigned_at.map(|at| at.elapsed()).unwrap_or_default();
        Some((job, latency))
    }

    fn on_progress(&mut self, unit: UnitId, progress: Progress) {
        if !self.units.get(&unit).is_some_and(|u| u.holds(progress.job_id)) {
            return;
        }
        self.events.publish(PoolEvent::JobProgress {
            job_id: progress.job_id,
            current: progress.current,
            total: progress.total,
        });
        self.forward_progress(progress);
    }

    async fn on_result(&mut self, unit: UnitId, result: JobResult) {
        let Some((job, latency)) = self.take_job(unit, result.job_id) else {
            return;
        };
        if let Some(record) = self.units.get_mut(&unit) {
            record.stats.record_success(latency);
        }

        if job.cancel_requested {
            let id = job.id;
            self.resolve(job, Err(PoolError::Cancelled(id)));
        } else {
            let output = JobOutput {
                job_id: job.id,
                output: result.output,
                metadata: result.metadata,
                attempts: job.attempt,
                unit,
                latency,
            };
            self.resolve(job, Ok(output));
        }
        self.after_release().await;
    }

    async fn on_error(&mut self, unit: UnitId, failure: JobFailure) {
        let Some((job, _)) = self.take_job(unit, failure.job_id) else {
            return;
        };
        if !job.cancel_requested {
            self.record_unit_failure(unit);
        }
        let error = PoolError::UnitExecution {
            job_id: job.id,
            message: failure.message,
        };
        self.fail_attempt(job, Some(unit), error);
        self.after_release().await;
    }

    async fn on_malformed(&mut self, unit: UnitId, reason: String) {
        let held = self
            .units
            .get_mut(&unit)
            .and_then(|record| {
                record.needs_recheck = true;
                record.current.as_ref().map(|job| job.id)
            });
        warn!(unit_id = %unit, %reason, "unit sent an invalid reply");

        let Some((job, _)) = held.and_then(|job_id| self.take_job(unit, job_id)) else {
            return;
        };
        self.record_unit_failure(unit);
        let error = PoolError::UnitExecution {
            job_id: job.id,
            message: format!("invalid reply: {reason}"),
        };
        self.fail_attempt(job, Some(unit), error);
        self.after_release().await;
    }

    async fn on_exited(&mut self, unit: UnitId) {
        let Some(mut record) = self.units.remove(&unit) else {
            return;
        };
        record.clear_probe();
        warn!(unit_id = %unit, units = self.units.len(), "unit exited");
        self.events.publish(PoolEvent::UnitTerminated {
            unit,
            reason: TerminationReason::Exited,
        });
        if let Some(job) = record.current.take() {
            let error = PoolError::UnitExecution {
                job_id: job.id,
                message: "unit exited".to_string(),
            };
            self.fail_attempt(job, None, error);
        }
        self.restore_size(record.capability).await;
        self.pump().await;
    }

    async fn on_pong(&mut self, unit: UnitId) {
        let Some(record) = self.units.get_mut(&unit) else {
            return;
        };
        if record.pending_probe.is_none() {
            debug!(unit_id = %unit, "unsolicited pong");
            return;
        }
        record.clear_probe();
        record.needs_recheck = false;
        if record.unhealthy {
            record.unhealthy = false;
            record.stats.reset_window();
            info!(unit_id = %unit, "unit recovered");
            self.events.publish(PoolEvent::UnitRecovered { unit });
            self.pump().await;
        }
    }

    pub(super) async fn on_job_deadline(&mut self, job_id: JobId, unit: UnitId, attempt: u32) {
        let current = self
            .units
            .get(&unit)
            .and_then(|u| u.current.as_ref())
            .is_some_and(|job| job.id == job_id && job.attempt == attempt);
        if !current {
            return;
        }
        let Some((mut job, elapsed)) = self.take_job(unit, job_id) else {
            return;
        };
        job.state = JobState::TimedOut;

        if let Some(record) = self.units.get_mut(&unit) {
            // The unit may still be chewing on the job; make it let go.
            record.driver.command(DriverCommand::Reset);
            record.stats.record_failure();
        }
        self.demote(unit, UnhealthyReason::Timeout);

        warn!(
            job_id = %job_id,
            unit_id = %unit,
            attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            "job timed out"
        );
        self.events.publish(PoolEvent::JobTimedOut { job_id, unit });

        if job.cancel_requested {
            self.resolve(job, Err(PoolError::Cancelled(job_id)));
        } else {
            let after = job.timeout;
            self.resolve(job, Err(PoolError::Timeout { job_id, after }));
        }
        self.after_release().await;
    }

    pub(super) async fn on_retry_due(&mut self, job_id: JobId) {
        let Some(mut job) = self.backing_off.remove(&job_id) else {
            return;
        };
        job.timer = None;
        debug!(job_id = %job_id, attempt = job.attempt + 1, "retry due");
        self.queue.requeue(job);
        self.pump().await;
    }

    /// Count a failed outcome against the unit and demote it if its error
    /// rate crossed the threshold.
    fn record_unit_failure(&mut self, unit: UnitId) {
        let exceeded = match self.units.get_mut(&unit) {
            Some(record) => {
                record.stats.record_failure();
                self.health.error_rate_exceeded(&record.stats)
            }
            None => false,
        };
        if exceeded {
            self.demote(unit, UnhealthyReason::ErrorRate);
        }
    }

    /// Exclude a unit from selection until a probe passes.
    pub(super) fn demote(&mut self, unit: UnitId, reason: UnhealthyReason) {
        let Some(record) = self.units.get_mut(&unit) else {
            return;
        };
        record.needs_recheck = true;
        if record.unhealthy {
            return;
        }
        record.unhealthy = true;
        self.metrics.demotions += 1;
        warn!(unit_id = %unit, ?reason, "unit marked unhealthy");
        self.events.publish(PoolEvent::UnitUnhealthy { unit, reason });
    }

    /// Apply the retry policy to a failed attempt.
    ///
    /// Retryable errors go back to the queue after a backoff while attempts
    /// remain; otherwise the job resolves with the error, wrapped in
    /// `RetriesExhausted` when the budget ran out.
    pub(super) fn fail_attempt(&mut self, mut job: Job, unit: Option<UnitId>, error: PoolError) {
        job.cancel_timer();
        if job.cancel_requested {
            let id = job.id;
            self.resolve(job, Err(PoolError::Cancelled(id)));
            return;
        }
        if let Some(record) = unit.and_then(|u| self.units.get_mut(&u)) {
            record.needs_recheck = true;
        }

        if !error.is_retryable() {
            self.resolve(job, Err(error));
            return;
        }

        if job.has_attempts_left() {
            let backoff = self.config.backoff_for(job.attempt);
            job.state = JobState::Retrying;
            self.metrics.jobs_retried += 1;
            warn!(
                job_id = %job.id,
                attempt = job.attempt,
                budget = job.retry_budget,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            self.events.publish(PoolEvent::JobRetrying {
                job_id: job.id,
                attempt: job.attempt,
                backoff_ms: backoff.as_millis() as u64,
                error: error.to_string(),
            });
            job.timer = Some(self.schedule(backoff, Timer::RetryDue { job_id: job.id }));
            self.backing_off.insert(job.id, job);
        } else {
            let job_id = job.id;
            let attempts = job.attempt;
            self.resolve(
                job,
                Err(PoolError::RetriesExhausted {
                    job_id,
                    attempts,
                    last: Box::new(error),
                }),
            );
        }
    }
}
