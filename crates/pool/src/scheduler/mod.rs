//! The pool scheduler.
//!
//! A single coordinator task owns every piece of pool state: units, the
//! pending queue, jobs in backoff, metrics. Callers talk to it through the
//! cloneable [`Scheduler`] handle; units talk to it through their drivers;
//! timers (job deadlines, retry backoff, probe deadlines) are messages too.
//! Nothing is shared behind a lock.
//!
//! Split into focused submodules:
//! - `coordinator`: state, event loop, command handling, unit lifecycle
//! - `dispatch`: placement, scale-up, queue pumping
//! - `outcome`: unit replies, retries, timeouts
//! - `maintenance`: health probes, idle sweeps, queue-wait expiry, cancel, shutdown

mod coordinator;
mod dispatch;
mod handle;
mod maintenance;
mod outcome;

pub use coordinator::{PoolSnapshot, UnitSnapshot};
pub use handle::Scheduler;
