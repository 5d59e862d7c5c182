use std::path::Path;

use crate::error::PoolError;

use super::types::{PoolConfig, UnitKind};

impl PoolConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Recognised keys:
    /// - `OFFLOAD_MIN_UNITS`, `OFFLOAD_MAX_UNITS`
    /// - `OFFLOAD_MAX_QUEUE_SIZE`
    /// - `OFFLOAD_STRATEGY` (`round_robin`, `least_busy`, `random`)
    /// - `OFFLOAD_AUTO_SCALE` (`true`/`false`)
    /// - `OFFLOAD_DEFAULT_TIMEOUT_MS`
    /// - `OFFLOAD_RETRY_BUDGET`
    /// - `OFFLOAD_UNIT_KIND` (`in_process`, `process`)
    ///
    /// Values that fail to parse are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("OFFLOAD_MIN_UNITS") {
            self.min_units = v;
        }
        if let Some(v) = env_parse("OFFLOAD_MAX_UNITS") {
            self.max_units = v;
        }
        if let Some(v) = env_parse("OFFLOAD_MAX_QUEUE_SIZE") {
            self.max_queue_size = v;
        }
        if let Some(v) = env_parse("OFFLOAD_STRATEGY") {
            self.strategy = v;
        }
        if let Some(v) = env_parse("OFFLOAD_AUTO_SCALE") {
            self.auto_scale = v;
        }
        if let Some(v) = env_parse("OFFLOAD_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = v;
        }
        if let Some(v) = env_parse("OFFLOAD_RETRY_BUDGET") {
            self.default_retry_budget = v;
        }
        if let Ok(v) = std::env::var("OFFLOAD_UNIT_KIND") {
            match v.trim() {
                "in_process" => self.unit.kind = UnitKind::InProcess,
                "process" => self.unit.kind = UnitKind::Process,
                other => tracing::warn!(value = other, "ignoring unknown OFFLOAD_UNIT_KIND"),
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
