//! Scaling decisions. Pure functions over a view of the pool.

use std::time::Duration;

use crate::events::TerminationReason;
use crate::unit::UnitId;

/// An available (not busy) unit considered by an idle sweep.
#[derive(Debug, Clone)]
pub struct IdleUnit {
    pub id: UnitId,
    pub idle_for: Duration,
    pub unhealthy: bool,
}

/// Whether one more unit may be created.
pub fn can_scale_up(auto_scale: bool, units: usize, max_units: usize) -> bool {
    auto_scale && units < max_units
}

/// Units to spawn so the pool is back at its floor: `min_units` while
/// auto-scaling, `max_units` for a fixed pool.
pub fn replacements_needed(
    auto_scale: bool,
    units: usize,
    min_units: usize,
    max_units: usize,
) -> usize {
    let floor = if auto_scale { min_units } else { max_units };
    floor.saturating_sub(units)
}

/// Pick the units an idle sweep terminates.
///
/// Healthy units idle longer than `max_idle` go first-idle-first while the
/// pool stays at or above `min_units`. With `reclaim_unhealthy`, idle
/// unhealthy units are taken regardless of the minimum.
pub fn idle_victims(
    idle: &[IdleUnit],
    total_units: usize,
    min_units: usize,
    max_idle: Duration,
    reclaim_unhealthy: bool,
) -> Vec<(UnitId, TerminationReason)> {
    let mut victims = Vec::new();
    let mut remaining = total_units;

    if reclaim_unhealthy {
        for unit in idle.iter().filter(|u| u.unhealthy) {
            victims.push((unit.id, TerminationReason::Unhealthy));
            remaining = remaining.saturating_sub(1);
        }
    }

    let mut stale: Vec<&IdleUnit> = idle
        .iter()
        .filter(|u| !u.unhealthy && u.idle_for >= max_idle)
        .collect();
    stale.sort_by(|a, b| b.idle_for.cmp(&a.idle_for).then(a.id.cmp(&b.id)));

    for unit in stale {
        if remaining <= min_units {
            break;
        }
        victims.push((unit.id, TerminationReason::Idle));
        remaining -= 1;
    }
    victims
}
