use std::sync::Arc;

use super::{InProcessFactory, JobHandler, ProcessFactory, UnitFactory};
use crate::config::{UnitConfig, UnitKind};
use crate::error::PoolError;

/// Build the unit factory the configuration asks for. `handler` backs
/// in-process units and is ignored for process units.
pub fn factory_from_config(
    config: &UnitConfig,
    handler: Arc<dyn JobHandler>,
) -> Result<Arc<dyn UnitFactory>, PoolError> {
    match config.kind {
        UnitKind::InProcess => Ok(Arc::new(InProcessFactory::new(handler))),
        UnitKind::Process => {
            let process = config.process.clone().ok_or_else(|| {
                PoolError::Config("process units need a [unit.process] section".into())
            })?;
            Ok(Arc::new(ProcessFactory::new(process)))
        }
    }
}
