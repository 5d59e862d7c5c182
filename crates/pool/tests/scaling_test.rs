//! Integration tests for on-demand growth and idle shrinking.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::timeout;

use offload_pool::{Capability, JobRequest, PoolEvent, TerminationReason};

use common::{config, fixed, start, wait_for_event, Exclusive, TIMEOUT};

fn request(n: u64) -> JobRequest {
    JobRequest::new(Capability::Conversion, json!({ "n": n }))
}

#[tokio::test]
async fn burst_grows_the_pool_then_idle_units_are_reclaimed() {
    let mut config = config(1, 3);
    config.max_idle_time_ms = 100;
    config.idle_sweep_interval_ms = 50;
    let pool = start(config, Arc::new(Exclusive::new(Duration::from_millis(200)))).await;
    let mut events = pool.subscribe();

    let outcomes = timeout(TIMEOUT, join_all((0..3).map(|n| pool.execute(request(n)))))
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.metrics.scale_ups, 2);
    assert_eq!(snapshot.metrics.peak_units, 3);

    let mut scaled_up = 0;
    let mut shrunk = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::ScaledUp { .. } => scaled_up += 1,
            PoolEvent::ScaledDown { units: 1, .. } => shrunk = true,
            _ => {}
        }
    }
    assert_eq!(scaled_up, 2);

    if !shrunk {
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::ScaledDown { units: 1, .. })).await;
    }
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.units.len(), 1);
    assert_eq!(snapshot.metrics.scale_downs, 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn growth_stops_at_max_units() {
    let pool = start(config(1, 2), Arc::new(Exclusive::new(Duration::from_millis(50)))).await;

    let outcomes = timeout(TIMEOUT, join_all((0..6).map(|n| pool.execute(request(n)))))
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.metrics.peak_units, 2);
    assert_eq!(snapshot.metrics.scale_ups, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn fixed_pool_neither_grows_nor_shrinks() {
    let mut config = fixed(2);
    config.max_idle_time_ms = 10;
    config.idle_sweep_interval_ms = 20;
    let pool = start(config, Arc::new(Exclusive::new(Duration::from_millis(30)))).await;

    let outcomes = timeout(TIMEOUT, join_all((0..6).map(|n| pool.execute(request(n)))))
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.units.len(), 2);
    assert_eq!(snapshot.metrics.scale_ups, 0);
    assert_eq!(snapshot.metrics.scale_downs, 0);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn new_capability_gets_its_own_unit() {
    let pool = start(config(1, 2), Arc::new(Exclusive::new(Duration::ZERO))).await;
    let mut events = pool.subscribe();

    let out = timeout(
        TIMEOUT,
        pool.execute(JobRequest::new(Capability::Export, json!({}))),
    )
    .await
    .unwrap()
    .unwrap();

    let created = wait_for_event(&mut events, |e| matches!(e, PoolEvent::UnitCreated { .. })).await;
    assert!(matches!(
        created,
        PoolEvent::UnitCreated {
            capability: Capability::Export,
            ..
        }
    ));
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.unit(out.unit).unwrap().capability, Capability::Export);

    pool.shutdown().await.unwrap();
    let terminated = wait_for_event(&mut events, |e| {
        matches!(
            e,
            PoolEvent::UnitTerminated {
                reason: TerminationReason::Shutdown,
                ..
            }
        )
    })
    .await;
    assert!(matches!(terminated, PoolEvent::UnitTerminated { .. }));
}
