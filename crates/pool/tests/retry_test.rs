//! Integration tests for the retry policy: backoff, budget exhaustion and
//! retry placement.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use offload_pool::{
    Capability, HandlerError, HandlerOutput, JobContext, JobHandler, JobRequest, PoolError,
    PoolEvent, Scheduler, UnitId, UnitStatus,
};

use common::{fixed, start, wait_for_event, FailFirst, Fault, FaultyFirst, TIMEOUT};

fn request() -> JobRequest {
    JobRequest::new(Capability::Validation, json!({ "rows": 3 }))
}

#[tokio::test]
async fn succeeds_once_transient_failures_stop() {
    let handler = Arc::new(FailFirst::new(2));
    let pool = start(fixed(2), handler.clone()).await;
    let mut events = pool.subscribe();

    let out = timeout(TIMEOUT, pool.execute(request().retry_budget(3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.attempts, 3);
    assert_eq!(out.output, json!({ "rows": 3 }));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let retrying =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::JobRetrying { .. })).await;
    match retrying {
        PoolEvent::JobRetrying {
            attempt,
            backoff_ms,
            error,
            ..
        } => {
            assert_eq!(attempt, 1);
            assert_eq!(backoff_ms, 10);
            assert!(error.contains("transient failure 1"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let metrics = pool.snapshot().await.unwrap().metrics;
    assert_eq!(metrics.jobs_retried, 2);
    assert_eq!(metrics.jobs_completed, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn retries_move_to_another_unit() {
    let handler = Arc::new(FailFirst::new(2));
    let pool = start(fixed(2), handler.clone()).await;

    let out = timeout(TIMEOUT, pool.execute(request().retry_budget(3)))
        .await
        .unwrap()
        .unwrap();

    let failed_on = handler.failed_on.lock().unwrap().clone();
    assert_eq!(failed_on.len(), 2);
    assert_ne!(failed_on[0], failed_on[1]);
    assert_ne!(out.unit, failed_on[1]);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn lone_unit_is_reused_for_retries() {
    let handler = Arc::new(FailFirst::new(1));
    let pool = start(fixed(1), handler.clone()).await;

    let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
    assert_eq!(out.attempts, 2);
    assert_eq!(handler.failed_on.lock().unwrap()[0], out.unit);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_budget_reports_last_failure() {
    let handler = Arc::new(FailFirst::new(u32::MAX));
    let pool = start(fixed(2), handler.clone()).await;

    let err = timeout(TIMEOUT, pool.execute(request().retry_budget(2)))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        PoolError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            match *last {
                PoolError::UnitExecution { ref message, .. } => {
                    assert_eq!(message, "transient failure 2")
                }
                ref other => panic!("unexpected cause {other:?}"),
            }
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let metrics = pool.snapshot().await.unwrap().metrics;
    assert_eq!(metrics.jobs_failed, 1);
    assert_eq!(metrics.jobs_retried, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn single_attempt_budget_never_retries() {
    let handler = Arc::new(FailFirst::new(1));
    let pool = start(fixed(1), handler.clone()).await;

    let err = timeout(TIMEOUT, pool.execute(request().retry_budget(1)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PoolError::RetriesExhausted { attempts: 1, .. }), "{err}");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    pool.shutdown().await.unwrap();
}

/// Panics on the first call, echoes afterwards.
struct PanicOnce {
    panicked: AtomicBool,
}

#[async_trait]
impl JobHandler for PanicOnce {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, HandlerError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("collaborator blew up");
        }
        Ok(HandlerOutput::new(ctx.payload))
    }
}

#[tokio::test]
async fn handler_panic_counts_as_a_unit_failure() {
    let handler = Arc::new(PanicOnce {
        panicked: AtomicBool::new(false),
    });
    let pool = start(fixed(1), handler).await;
    let mut events = pool.subscribe();

    let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
    assert_eq!(out.attempts, 2);

    let retrying =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::JobRetrying { .. })).await;
    assert!(
        matches!(
            retrying,
            PoolEvent::JobRetrying { ref error, .. } if error.contains("handler panicked")
        ),
        "{retrying:?}"
    );
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn undecodable_reply_fails_the_attempt_and_the_job_is_retried() {
    let factory = Arc::new(FaultyFirst::new(Fault::GarbleFirstDispatch));
    let pool = Scheduler::start(fixed(2), factory).await.unwrap();
    let mut events = pool.subscribe();

    let out = timeout(TIMEOUT, pool.execute(request())).await.unwrap().unwrap();
    assert_eq!(out.attempts, 2);
    assert_eq!(out.unit, UnitId(2));
    assert_eq!(out.output, json!({ "rows": 3 }));

    let retrying =
        wait_for_event(&mut events, |e| matches!(e, PoolEvent::JobRetrying { .. })).await;
    assert!(
        matches!(
            retrying,
            PoolEvent::JobRetrying { attempt: 1, ref error, .. } if error.contains("invalid reply")
        ),
        "{retrying:?}"
    );

    let snapshot = pool.snapshot().await.unwrap();
    let garbled = snapshot.unit(UnitId(1)).unwrap();
    assert_eq!(garbled.jobs_failed, 1);
    assert_eq!(garbled.status, UnitStatus::Available);
    assert_eq!(snapshot.metrics.jobs_retried, 1);
    pool.shutdown().await.unwrap();
}
