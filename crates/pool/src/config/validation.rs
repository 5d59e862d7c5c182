use super::types::{PoolConfig, UnitKind};
use crate::error::PoolError;

impl PoolConfig {
    /// Validate the config: unit bounds, queue size, health thresholds and
    /// the unit launch section.
    pub fn validate(&self) -> Result<(), PoolError> {
        self.validate_unit_bounds()?;
        self.validate_queue()?;
        self.validate_capabilities()?;
        self.validate_health()?;
        self.validate_unit_section()?;
        Ok(())
    }

    fn validate_unit_bounds(&self) -> Result<(), PoolError> {
        if self.max_units == 0 {
            return Err(PoolError::Config("max_units must be at least 1".into()));
        }
        if self.min_units > self.max_units {
            return Err(PoolError::Config(format!(
                "min_units ({}) exceeds max_units ({})",
                self.min_units, self.max_units
            )));
        }
        if self.latency_window == 0 {
            return Err(PoolError::Config("latency_window must be at least 1".into()));
        }
        Ok(())
    }

    fn validate_queue(&self) -> Result<(), PoolError> {
        if self.max_queue_size == 0 {
            return Err(PoolError::Config("max_queue_size must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(PoolError::Config("event_capacity must be at least 1".into()));
        }
        if self.default_retry_budget == 0 {
            return Err(PoolError::Config(
                "default_retry_budget must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }

    /// The warm capability must be one the pool actually serves.
    fn validate_capabilities(&self) -> Result<(), PoolError> {
        if self.capabilities.is_empty() {
            return Err(PoolError::Config("capabilities must not be empty".into()));
        }
        if !self.capabilities.contains(&self.warm_capability) {
            return Err(PoolError::Config(format!(
                "warm_capability '{}' is not in capabilities",
                self.warm_capability
            )));
        }
        Ok(())
    }

    fn validate_health(&self) -> Result<(), PoolError> {
        let threshold = self.health.error_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(PoolError::Config(format!(
                "health.error_rate_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.health.interval_ms == 0 || self.health.probe_deadline_ms == 0 {
            return Err(PoolError::Config(
                "health interval and probe deadline must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn validate_unit_section(&self) -> Result<(), PoolError> {
        if self.unit.kind != UnitKind::Process {
            return Ok(());
        }
        match &self.unit.process {
            Some(process) if !process.program.trim().is_empty() => Ok(()),
            Some(_) => Err(PoolError::Config("unit.process.program is empty".into())),
            None => Err(PoolError::Config(
                "unit.kind = \"process\" requires a [unit.process] section".into(),
            )),
        }
    }
}
