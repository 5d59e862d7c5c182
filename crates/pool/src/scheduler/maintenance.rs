use std::time::Instant;

use offload_protocol::{Capability, JobId, UnitRequest};
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, Timer};
use crate::autoscale::{self, IdleUnit};
use crate::error::PoolError;
use crate::events::{PoolEvent, TerminationReason, UnhealthyReason};
use crate::job::CancelOutcome;
use crate::unit::UnitId;

impl Coordinator {
    /// One health round: ping every unit the policy wants probed.
    pub(super) fn probe_units(&mut self) {
        let now = Instant::now();
        let mut sent = Vec::new();
        for record in self.units.values_mut() {
            if record.pending_probe.is_some() {
                continue;
            }
            let busy_since = record.current.as_ref().and_then(|job| job.assigned_at);
            if !self.health.should_probe(busy_since, record.needs_recheck, now) {
                continue;
            }
            self.probe_seq += 1;
            record.pending_probe = Some(self.probe_seq);
            if record.driver.send(UnitRequest::Ping) {
                sent.push((record.id, self.probe_seq));
            }
        }
        if !sent.is_empty() {
            debug!(probes = sent.len(), "health probes sent");
        }
        for (unit, seq) in sent {
            let deadline = self.health.probe_deadline;
            let timer = self.schedule(deadline, Timer::ProbeDeadline { unit, seq });
            if let Some(record) = self.units.get_mut(&unit) {
                record.probe_timer = Some(timer);
            }
        }
    }

    pub(super) fn on_probe_deadline(&mut self, unit: UnitId, seq: u64) {
        let Some(record) = self.units.get_mut(&unit) else {
            return;
        };
        if record.pending_probe != Some(seq) {
            return;
        }
        record.pending_probe = None;
        record.probe_timer = None;
        self.demote(unit, UnhealthyReason::ProbeMissed);
    }

    /// Terminate idle units past `max_idle_time`, keeping `min_units`.
    /// Periodic sweeps also reclaim idle unhealthy units regardless of the
    /// minimum; the sweep tick refills the pool afterwards.
    pub(super) fn sweep_idle(&mut self, reclaim_unhealthy: bool) {
        if !self.config.auto_scale {
            return;
        }
        let now = Instant::now();
        let idle: Vec<IdleUnit> = self
            .units
            .values()
            .filter(|u| u.current.is_none())
            .map(|u| IdleUnit {
                id: u.id,
                idle_for: u.stats.idle_for(now),
                unhealthy: u.unhealthy,
            })
            .collect();

        let victims = autoscale::idle_victims(
            &idle,
            self.units.len(),
            self.config.min_units,
            self.config.max_idle_time(),
            reclaim_unhealthy,
        );
        for (unit, reason) in victims {
            if self.retire(unit, reason).is_some() {
                self.metrics.scale_downs += 1;
                let units = self.units.len();
                info!(unit_id = %unit, ?reason, units, "scaled down");
                self.events.publish(PoolEvent::ScaledDown { unit, units });
            }
        }
    }

    /// Reject jobs that sat in the queue longer than `max_queue_wait`.
    pub(super) fn expire_queued(&mut self) {
        let Some(max_wait) = self.config.max_queue_wait() else {
            return;
        };
        let now = Instant::now();
        for job in self.queue.take_expired(max_wait, now) {
            let job_id = job.id;
            let waited = job
                .queued_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(max_wait);
            self.resolve(job, Err(PoolError::QueueWaitExceeded { job_id, waited }));
        }
    }

    /// Cancel a job. Queued or backing-off jobs are dropped right away;
    /// running jobs get a best-effort cancel signal.
    pub(super) fn cancel(&mut self, job_id: JobId) -> CancelOutcome {
        if let Some(job) = self
            .queue
            .remove(job_id)
            .or_else(|| self.backing_off.remove(&job_id))
        {
            self.resolve(job, Err(PoolError::Cancelled(job_id)));
            return CancelOutcome::Dequeued;
        }

        for record in self.units.values_mut() {
            let Some(job) = record.current.as_mut().filter(|job| job.id == job_id) else {
                continue;
            };
            if !job.cancel_requested {
                job.cancel_requested = true;
                record.driver.send(UnitRequest::Cancel { job_id });
                debug!(job_id = %job_id, unit_id = %record.id, "cancel signalled");
            }
            return CancelOutcome::Signalled;
        }
        CancelOutcome::NotFound
    }

    /// Bring the pool back to its floor after units went away: `min_units`
    /// when auto-scaling, `max_units` for a fixed pool. Replacements get
    /// `capability`.
    pub(super) async fn restore_size(&mut self, capability: Capability) {
        let missing = autoscale::replacements_needed(
            self.config.auto_scale,
            self.units.len(),
            self.config.min_units,
            self.config.max_units,
        );
        if missing == 0 {
            return;
        }
        for _ in 0..missing {
            match self.spawn_unit(capability).await {
                Ok(unit) => {
                    self.metrics.replacements += 1;
                    info!(unit_id = %unit, units = self.units.len(), "unit replaced");
                }
                Err(e) => {
                    warn!(error = %e, units = self.units.len(), "could not replace unit");
                    break;
                }
            }
        }
        self.pump().await;
    }

    /// Explicitly terminate one unit. A job it holds goes through the retry
    /// policy.
    pub(super) async fn terminate_unit(&mut self, unit: UnitId) -> bool {
        let Some(mut record) = self.retire(unit, TerminationReason::Requested) else {
            return false;
        };
        let capability = record.capability;
        if let Some(job) = record.current.take() {
            let error = PoolError::UnitExecution {
                job_id: job.id,
                message: "unit terminated".to_string(),
            };
            self.fail_attempt(job, None, error);
        }
        self.restore_size(capability).await;
        self.pump().await;
        true
    }
}
