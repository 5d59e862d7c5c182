//! Pool configuration: TOML file, `OFFLOAD_*` overrides, validation.

mod loading;
mod types;
mod validation;


pub use types::{
    HealthConfig, PoolConfig, ProcessUnitConfig, RetryAffinity, UnitConfig, UnitKind,
};
