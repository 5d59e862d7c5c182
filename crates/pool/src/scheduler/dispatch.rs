use std::time::Instant;

use offload_protocol::Capability;
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, Timer};
use crate::autoscale;
use crate::balancer::Candidate;
use crate::config::RetryAffinity;
use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::job::{Job, JobState};
use crate::unit::UnitId;

impl Coordinator {
    /// Eligible units, optionally restricted to one capability and skipping
    /// `avoid`.
    fn candidates(
        &self,
        capability: Option<Capability>,
        avoid: Option<UnitId>,
    ) -> Vec<Candidate> {
        self.units
            .values()
            .filter(|u| u.is_eligible())
            .filter(|u| capability.map_or(true, |c| u.capability == c))
            .filter(|u| Some(u.id) != avoid)
            .map(|u| Candidate {
                id: u.id,
                capability: u.capability,
                recent_latency: u.stats.recent_average_latency(),
                queue_depth_hint: usize::from(u.pending_probe.is_some()),
            })
            .collect()
    }

    /// The unit a retry should stay away from, if any.
    fn avoided_unit(&self, job: &Job) -> Option<UnitId> {
        match self.config.retry_affinity {
            RetryAffinity::PreferDifferent if job.attempt > 0 => job.last_unit,
            _ => None,
        }
    }

    /// Bind `job` to a unit, growing the pool if allowed. Hands the job back
    /// when nothing can take it right now.
    ///
    /// Preference order: an exact-capability unit, a freshly created unit of
    /// that capability, any eligible unit, and finally the unit the previous
    /// attempt failed on.
    pub(super) async fn try_place(&mut self, job: Job) -> Result<(), Job> {
        let avoid = self.avoided_unit(&job);

        let exact = self.candidates(Some(job.capability), avoid);
        if let Some(unit) = self.balancer.select(&exact) {
            return self.assign(unit, job);
        }

        let units = self.units.len();
        if autoscale::can_scale_up(self.config.auto_scale, units, self.config.max_units) {
            match self.scale_up(job.capability).await {
                Ok(unit) => return self.assign(unit, job),
                Err(e) => warn!(job_id = %job.id, error = %e, "scale-up failed"),
            }
        }

        let any = self.candidates(None, avoid);
        if let Some(unit) = self.balancer.select(&any) {
            return self.assign(unit, job);
        }

        match avoid {
            Some(unit) if self.units.get(&unit).is_some_and(|u| u.is_eligible()) => {
                debug!(job_id = %job.id, unit_id = %unit, "retrying on the unit that failed last");
                self.assign(unit, job)
            }
            _ => Err(job),
        }
    }

    /// Hand `job` to `unit` and arm its deadline.
    fn assign(&mut self, unit_id: UnitId, mut job: Job) -> Result<(), Job> {
        if !self.units.contains_key(&unit_id) {
            return Err(job);
        }

        let now = Instant::now();
        job.attempt += 1;
        job.state = JobState::Assigned;
        job.last_unit = Some(unit_id);
        job.assigned_at = Some(now);
        job.queued_at = None;

        let job_id = job.id;
        let attempt = job.attempt;
        job.cancel_timer();
        job.timer = Some(self.schedule(
            job.timeout,
            Timer::JobDeadline {
                job_id,
                unit: unit_id,
                attempt,
            },
        ));

        let Some(unit) = self.units.get_mut(&unit_id) else {
            job.cancel_timer();
            return Err(job);
        };
        if !unit.driver.send(job.dispatch()) {
            // The driver already stopped; its exit event fails the job.
            warn!(job_id = %job_id, unit_id = %unit_id, "dispatch to stopped unit");
        }
        job.state = JobState::Running;
        unit.current = Some(job);
        unit.stats.last_used_at = now;

        debug!(job_id = %job_id, unit_id = %unit_id, attempt, "job assigned");
        self.events.publish(PoolEvent::JobAssigned {
            job_id,
            unit: unit_id,
            attempt,
        });
        Ok(())
    }

    /// Create one more unit on demand.
    async fn scale_up(&mut self, capability: Capability) -> Result<UnitId, PoolError> {
        let unit = self.spawn_unit(capability).await?;
        self.metrics.scale_ups += 1;
        let units = self.units.len();
        info!(unit_id = %unit, %capability, units, "scaled up");
        self.events.publish(PoolEvent::ScaledUp { unit, units });
        Ok(unit)
    }

    /// Assign queued jobs, highest priority first, until one does not fit.
    pub(super) async fn pump(&mut self) {
        while let Some(job) = self.queue.pop() {
            if let Err(job) = self.try_place(job).await {
                self.queue.restore(job);
                break;
            }
        }
    }

    /// Called whenever a unit finishes with a job.
    pub(super) async fn after_release(&mut self) {
        self.pump().await;
        if self.config.auto_scale && self.queue.is_empty() && self.eligible_count() > 1 {
            self.sweep_idle(false);
        }
    }
}
