//! Integration tests for per-attempt timeouts, unit demotion and recovery
//! through health probes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use offload_pool::{
    Capability, JobRequest, PoolError, PoolEvent, Scheduler, UnhealthyReason, UnitId, UnitStatus,
};

use common::{fixed, start, wait_for_event, FailFirst, Fault, FaultyFirst, StallFirst, TIMEOUT};

fn request() -> JobRequest {
    JobRequest::new(Capability::Export, json!({ "format": "xml" }))
}

#[tokio::test]
async fn stalled_attempt_times_out_and_sidelines_the_unit() {
    let pool = start(fixed(2), Arc::new(StallFirst::new(1))).await;
    let mut events = pool.subscribe();

    let budget = Duration::from_millis(100);
    let err = timeout(TIMEOUT, pool.execute(request().timeout(budget)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, PoolError::Timeout { after, .. } if after == budget),
        "{err}"
    );

    let unhealthy =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::UnitUnhealthy { .. })).await;
    assert!(matches!(
        unhealthy,
        PoolEvent::UnitUnhealthy {
            unit: UnitId(1),
            reason: UnhealthyReason::Timeout
        }
    ));

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.unit(UnitId(1)).unwrap().status, UnitStatus::Unhealthy);
    assert_eq!(snapshot.count(UnitStatus::Unhealthy), 1);
    assert_eq!(snapshot.metrics.jobs_timed_out, 1);

    // The sidelined unit is skipped while a healthy one exists.
    for _ in 0..3 {
        let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
        assert_eq!(out.unit, UnitId(2));
    }
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn timed_out_unit_recovers_after_a_probe() {
    let mut config = fixed(1);
    config.health.interval_ms = 50;
    config.health.probe_deadline_ms = 1_000;
    let pool = start(config, Arc::new(StallFirst::new(1))).await;
    let mut events = pool.subscribe();

    let err = timeout(
        TIMEOUT,
        pool.execute(request().timeout(Duration::from_millis(100))),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }), "{err}");

    wait_for_event(&mut events, |e| {
        matches!(e, PoolEvent::UnitRecovered { unit: UnitId(1) })
    })
    .await;

    let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
    assert_eq!(out.unit, UnitId(1));
    assert_eq!(
        pool.snapshot().await.unwrap().count(UnitStatus::Unhealthy),
        0
    );
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_unit_is_demoted_on_error_rate() {
    let mut config = fixed(1);
    config.health.min_sample_size = 2;
    config.health.error_rate_threshold = 0.5;
    let pool = start(config, Arc::new(FailFirst::new(u32::MAX))).await;
    let mut events = pool.subscribe();

    for _ in 0..2 {
        let err = timeout(TIMEOUT, pool.execute(request().retry_budget(1)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PoolError::RetriesExhausted { .. }), "{err}");
    }

    let event = wait_for_event(&mut events, |e| matches!(e, PoolEvent::UnitUnhealthy { .. })).await;
    assert!(matches!(
        event,
        PoolEvent::UnitUnhealthy {
            reason: UnhealthyReason::ErrorRate,
            ..
        }
    ));
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.metrics.demotions, 1);
    assert_eq!(snapshot.count(UnitStatus::Unhealthy), 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn unit_that_ignores_pings_is_demoted() {
    let mut config = fixed(2);
    config.health.interval_ms = 50;
    config.health.probe_deadline_ms = 50;
    let pool = Scheduler::start(config, Arc::new(FaultyFirst::new(Fault::IgnorePings)))
        .await
        .unwrap();
    let mut events = pool.subscribe();

    let unhealthy =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::UnitUnhealthy { .. })).await;
    assert!(matches!(
        unhealthy,
        PoolEvent::UnitUnhealthy {
            unit: UnitId(1),
            reason: UnhealthyReason::ProbeMissed
        }
    ));

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.unit(UnitId(1)).unwrap().status, UnitStatus::Unhealthy);
    assert_eq!(snapshot.unit(UnitId(2)).unwrap().status, UnitStatus::Available);

    let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
    assert_eq!(out.unit, UnitId(2));
    pool.shutdown().await.unwrap();
}
